//! End-to-end pipeline runs against the in-memory stores: raw rows in,
//! calibrated policy fetched, score rows persisted.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use aquascore::calibrate::{
    CalibrationClient, CalibrationError, CalibrationPayload, Calibrator, JobId, JobStatus,
};
use aquascore::config::CalibrationConfig;
use aquascore::scoring::canonical::{AccountId, Period, RawAggregateRow};
use aquascore::scoring::service::{ScoringError, ScoringService};
use aquascore::store::memory::{InMemoryAggregates, InMemoryScores};
use serde_json::{json, Value};
use uuid::Uuid;

struct QueueClient {
    statuses: Mutex<VecDeque<JobStatus>>,
    submits: AtomicUsize,
}

impl QueueClient {
    fn new(statuses: Vec<JobStatus>) -> Arc<Self> {
        Arc::new(Self {
            statuses: Mutex::new(statuses.into()),
            submits: AtomicUsize::new(0),
        })
    }

    fn submit_count(&self) -> usize {
        self.submits.load(Ordering::SeqCst)
    }
}

/// Shareable handle the calibrator owns while the test keeps inspecting
/// the underlying client.
#[derive(Clone)]
struct QueueHandle(Arc<QueueClient>);

impl CalibrationClient for QueueHandle {
    async fn submit(&self, _payload: CalibrationPayload) -> Result<JobId, CalibrationError> {
        self.0.submits.fetch_add(1, Ordering::SeqCst);
        Ok(JobId("job".to_string()))
    }

    async fn poll(&self, _job: &JobId) -> Result<JobStatus, CalibrationError> {
        let mut statuses = self.0.statuses.lock().expect("status mutex poisoned");
        Ok(statuses.pop_front().unwrap_or(JobStatus::Pending))
    }
}

fn template_section() -> Value {
    json!({
        "DADOS_INSUFICIENTES": "dados insuficientes",
        "INAD_ALTA": "inadimplencia alta",
        "MEDICAO_DOMINANTE": "medicao dominante",
        "CADASTRO_DOMINANTE": "cadastro dominante",
        "BALANCEADO": "balanceado"
    })
}

fn rich_policy() -> Value {
    json!({
        "policy_id": "policy_2025-06",
        "periodo": "2025-06",
        "weights": { "cadastro": 0.3333, "medicao": 0.3333, "inadimplencia": 0.3334 },
        "mappings": {
            "cadastro": [{
                "feature": "inconsistencias_rate",
                "breaks": [0.1, 0.3, 0.5],
                "values": [0.1, 0.4, 0.7, 0.9]
            }],
            "medicao": [
                {
                    "feature": "meter_age_years",
                    "breaks": [5.0, 10.0, 15.0],
                    "values": [0.1, 0.4, 0.7, 0.9]
                },
                {
                    "feature": "anomaly_rate",
                    "breaks": [0.03, 0.07, 0.12],
                    "values": [0.1, 0.4, 0.7, 0.9]
                }
            ],
            "inadimplencia": [{
                "feature": "delinquency_days",
                "breaks": [30.0, 90.0, 180.0],
                "values": [0.1, 0.4, 0.7, 0.9]
            }]
        },
        "classification": {
            "score_thresholds": { "baixo": 40.0, "medio": 70.0, "alto": 100.0 },
            "nenhum_if_all_potentials_below": 0.05
        },
        "templates": {
            "motivo": template_section(),
            "acao_sugerida": template_section(),
            "justificativa_curta": template_section()
        },
        "meta": { "validity_days": 30.0 }
    })
}

fn row(sector: &str, columns: Value) -> RawAggregateRow {
    row_with_id(AccountId(Uuid::new_v4()), sector, columns)
}

fn row_with_id(account_id: AccountId, sector: &str, columns: Value) -> RawAggregateRow {
    let map = columns
        .as_object()
        .expect("columns are an object")
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    RawAggregateRow {
        account_id,
        period: period(),
        sector: sector.to_string(),
        window_months: 12,
        columns: map,
    }
}

fn period() -> Period {
    Period::parse("2025-06").expect("valid period")
}

fn service(
    aggregates: &Arc<InMemoryAggregates>,
    scores: &Arc<InMemoryScores>,
    client: &Arc<QueueClient>,
    max_poll_attempts: u32,
) -> ScoringService<QueueHandle> {
    let config = CalibrationConfig {
        max_poll_attempts,
        poll_interval: Duration::from_millis(1),
    };
    let calibrator = Arc::new(Calibrator::new(QueueHandle(client.clone()), config));
    ScoringService::new(aggregates.clone(), scores.clone(), calibrator)
}

#[tokio::test]
async fn rich_policy_scores_and_persists_the_sector() {
    let aggregates = Arc::new(InMemoryAggregates::default());
    let account = AccountId(Uuid::new_v4());
    aggregates.push(row_with_id(
        account,
        "S01",
        json!({ "idade_hidrometro_meses": 144, "taxa_anomalias": 0.02 }),
    ));

    let scores = Arc::new(InMemoryScores::default());
    let client = QueueClient::new(vec![JobStatus::Completed(rich_policy())]);
    let service = service(&aggregates, &scores, &client, 5);

    let report = service.run(period(), "S01").await.expect("batch runs");
    assert_eq!(report.policy_id, "policy_2025-06");
    assert_eq!(report.total, 1);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.coverage.total, 1);
    // meter age and anomaly present, consumption cv missing
    assert!((report.coverage.families["medicao"] - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(report.coverage.families["cadastro"], 0.0);

    let output = scores.get(account, period()).expect("row persisted");
    // meter age 12y -> 0.7, anomaly 0.02 -> 0.1, family mean 0.4
    assert_eq!(output.score_medicao, Some(40.0));
    assert_eq!(output.score_cadastro, Some(0.0));
    assert_eq!(output.score_total, Some(13.33));
    assert_eq!(output.motivo, "dados insuficientes");
    assert!(output.error.is_none());
}

#[tokio::test]
async fn rerun_reuses_the_cached_policy_and_stays_idempotent() {
    let aggregates = Arc::new(InMemoryAggregates::default());
    aggregates.push(row("S01", json!({ "idade_hidrometro_meses": 60 })));

    let scores = Arc::new(InMemoryScores::default());
    let client = QueueClient::new(vec![JobStatus::Completed(rich_policy())]);
    let service = service(&aggregates, &scores, &client, 5);

    service.run(period(), "S01").await.expect("first run");
    service.run(period(), "S01").await.expect("second run");
    assert_eq!(scores.len(), 1);
    assert_eq!(client.submit_count(), 1);
}

#[tokio::test]
async fn calibration_timeout_fails_closed() {
    let aggregates = Arc::new(InMemoryAggregates::default());
    aggregates.push(row("S01", json!({ "idade_hidrometro_meses": 60 })));

    let scores = Arc::new(InMemoryScores::default());
    let client = QueueClient::new(vec![]);
    let service = service(&aggregates, &scores, &client, 2);

    let err = service
        .run(period(), "S01")
        .await
        .expect_err("pending forever must fail");
    assert!(matches!(
        err,
        ScoringError::Calibration(CalibrationError::Timeout { attempts: 2 })
    ));
    assert!(scores.is_empty(), "no partial writes on calibration failure");
}

#[tokio::test]
async fn calibration_failure_writes_nothing() {
    let aggregates = Arc::new(InMemoryAggregates::default());
    aggregates.push(row("S01", json!({ "idade_hidrometro_meses": 60 })));

    let scores = Arc::new(InMemoryScores::default());
    let client = QueueClient::new(vec![JobStatus::Failed("no convergence".to_string())]);
    let service = service(&aggregates, &scores, &client, 5);

    let err = service
        .run(period(), "S01")
        .await
        .expect_err("failed job surfaces");
    assert!(matches!(
        err,
        ScoringError::Calibration(CalibrationError::Failed(_))
    ));
    assert!(scores.is_empty());
}

#[tokio::test]
async fn compact_policy_scores_without_templates() {
    let aggregates = Arc::new(InMemoryAggregates::default());
    let account = AccountId(Uuid::new_v4());
    aggregates.push(row_with_id(
        account,
        "S01",
        json!({ "media_tempo_atraso": 0, "qtd_contas_abertas": 0, "indice_inadimplencia": 0.0 }),
    ));

    let scores = Arc::new(InMemoryScores::default());
    let client = QueueClient::new(vec![JobStatus::Completed(json!({
        "policy_id": "pc-1",
        "familias": { "cadastro": 0.3, "medicao": 0.5, "inadimplencia": 0.2 }
    }))]);
    let service = service(&aggregates, &scores, &client, 5);

    let report = service.run(period(), "S01").await.expect("batch runs");
    assert_eq!(report.policy_id, "pc-1");

    let output = scores.get(account, period()).expect("row persisted");
    // a fully clean delinquency family maps to the top of the band
    assert_eq!(output.score_inadimplencia, Some(100.0));
    assert_eq!(output.motivo, "");
}

#[tokio::test]
async fn missing_period_and_sector_are_distinct_errors() {
    let aggregates = Arc::new(InMemoryAggregates::default());
    let scores = Arc::new(InMemoryScores::default());
    let client = QueueClient::new(vec![JobStatus::Completed(rich_policy())]);
    let service = service(&aggregates, &scores, &client, 5);

    let err = service
        .run(period(), "S01")
        .await
        .expect_err("empty period fails");
    assert!(matches!(err, ScoringError::EmptyPeriod(_)));

    aggregates.push(row("S02", json!({ "idade_hidrometro_meses": 60 })));
    let err = service
        .run(period(), "S01")
        .await
        .expect_err("empty sector fails");
    assert!(matches!(err, ScoringError::EmptySector { .. }));
    assert_eq!(client.submit_count(), 0, "no calibration for empty scopes");
}

#[tokio::test]
async fn nil_account_id_becomes_a_persisted_failure_row() {
    let aggregates = Arc::new(InMemoryAggregates::default());
    let nil = AccountId(Uuid::nil());
    aggregates.push(row_with_id(
        nil,
        "S01",
        json!({ "idade_hidrometro_meses": 60 }),
    ));
    aggregates.push(row("S01", json!({ "idade_hidrometro_meses": 60 })));

    let scores = Arc::new(InMemoryScores::default());
    let client = QueueClient::new(vec![JobStatus::Completed(rich_policy())]);
    let service = service(&aggregates, &scores, &client, 5);

    let report = service.run(period(), "S01").await.expect("batch runs");
    assert_eq!(report.total, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);

    let failure = scores.get(nil, period()).expect("failure row persisted");
    assert!(failure.score_total.is_none());
    let audit: serde_json::Value =
        serde_json::from_str(failure.error.as_deref().expect("audit payload present"))
            .expect("audit payload is JSON");
    assert_eq!(audit["tipo_erro"], "validacao");
    assert_eq!(audit["periodo"], "2025-06");
    assert_eq!(audit["setor"], "S01");
}

#[tokio::test]
async fn rejected_batch_falls_back_to_row_writes_with_audit_rows() {
    let aggregates = Arc::new(InMemoryAggregates::default());
    let poisoned = AccountId(Uuid::new_v4());
    let healthy = AccountId(Uuid::new_v4());
    aggregates.push(row_with_id(
        poisoned,
        "S01",
        json!({ "idade_hidrometro_meses": 60 }),
    ));
    aggregates.push(row_with_id(
        healthy,
        "S01",
        json!({ "idade_hidrometro_meses": 60 }),
    ));

    let scores = Arc::new(InMemoryScores::default());
    scores.set_fail_batch(true);
    scores.set_fail_account(Some(poisoned));
    let client = QueueClient::new(vec![JobStatus::Completed(rich_policy())]);
    let service = service(&aggregates, &scores, &client, 5);

    let report = service.run(period(), "S01").await.expect("batch runs");
    assert_eq!(report.total, 2);
    assert_eq!(report.succeeded, 1);
    assert_eq!(report.failed, 1);

    let good = scores.get(healthy, period()).expect("healthy row persisted");
    assert!(good.error.is_none());

    let audit_row = scores.get(poisoned, period()).expect("audit row persisted");
    let audit: serde_json::Value =
        serde_json::from_str(audit_row.error.as_deref().expect("audit payload present"))
            .expect("audit payload is JSON");
    assert_eq!(audit["tipo_erro"], "persistencia");
    assert_eq!(audit["imovel_id"], poisoned.to_string());
}
