//! Wiring for the demo deployment: in-memory stores, a canned calibration
//! client, and seed data covering two sectors of one period.

use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex};

use aquascore::calibrate::{
    CalibrationClient, CalibrationError, CalibrationPayload, Calibrator, JobId, JobStatus,
};
use aquascore::config::CalibrationConfig;
use aquascore::groups::GroupsService;
use aquascore::params::{ParameterResolver, ParamsService};
use aquascore::scoring::canonical::{AccountId, Period, RawAggregateRow};
use aquascore::scoring::risk::RiskService;
use aquascore::scoring::service::ScoringService;
use aquascore::store::memory::{
    InMemoryAggregates, InMemoryParameters, InMemoryRisk, InMemoryScores, InMemorySectorGroups,
};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Clone)]
pub(crate) struct AppState {
    pub(crate) readiness: Arc<AtomicBool>,
    pub(crate) metrics: Arc<PrometheusHandle>,
    pub(crate) scoring: Arc<ScoringService<StaticCalibrationClient>>,
    pub(crate) risk: Arc<RiskService>,
    pub(crate) params: Arc<ParamsService>,
    pub(crate) groups: Arc<GroupsService>,
}

/// Calibration stand-in that completes every job immediately with a fixed
/// compact result. The deployment behind a real calibration service swaps
/// only this type.
pub(crate) struct StaticCalibrationClient {
    result: Mutex<Value>,
}

impl StaticCalibrationClient {
    pub(crate) fn new(result: Value) -> Self {
        Self {
            result: Mutex::new(result),
        }
    }
}

impl Default for StaticCalibrationClient {
    fn default() -> Self {
        Self::new(json!({
            "policy_id": "demo_policy",
            "familias": { "cadastro": 0.3, "medicao": 0.5, "inadimplencia": 0.2 },
            "inadimplencia": {
                "w_days": 0.34,
                "w_open_count": 0.33,
                "w_amount_ratio": 0.33,
                "trigger_ratio": 0.6,
                "penalty_max": 0.1,
                "curve": "linear"
            },
            "medicao": { "w_idade": 0.4, "w_anomalias": 0.3, "w_desvio": 0.3 },
            "cadastro": { "z_warn": 0.1, "z_risk": 0.3 },
            "potencial": { "pot_min": 0.0, "pot_max": 1.0 },
            "classificacao": {
                "baixo": 40.0,
                "medio": 70.0,
                "alto": 100.0,
                "nenhum_if_all_potentials_below": 0.05
            }
        }))
    }
}

impl CalibrationClient for StaticCalibrationClient {
    async fn submit(&self, _payload: CalibrationPayload) -> Result<JobId, CalibrationError> {
        Ok(JobId("static".to_string()))
    }

    async fn poll(&self, _job: &JobId) -> Result<JobStatus, CalibrationError> {
        let result = self.result.lock().expect("calibration result mutex poisoned");
        Ok(JobStatus::Completed(result.clone()))
    }
}

pub(crate) struct Stores {
    pub(crate) aggregates: Arc<InMemoryAggregates>,
    pub(crate) scores: Arc<InMemoryScores>,
    pub(crate) risks: Arc<InMemoryRisk>,
    pub(crate) parameters: Arc<InMemoryParameters>,
    pub(crate) groups: Arc<InMemorySectorGroups>,
}

impl Default for Stores {
    fn default() -> Self {
        Self {
            aggregates: Arc::new(InMemoryAggregates::default()),
            scores: Arc::new(InMemoryScores::default()),
            risks: Arc::new(InMemoryRisk::default()),
            parameters: Arc::new(InMemoryParameters::default()),
            groups: Arc::new(InMemorySectorGroups::default()),
        }
    }
}

pub(crate) fn build_services(
    stores: &Stores,
    calibration: CalibrationConfig,
) -> (
    Arc<ScoringService<StaticCalibrationClient>>,
    Arc<RiskService>,
    Arc<ParamsService>,
    Arc<GroupsService>,
) {
    let calibrator = Arc::new(Calibrator::new(
        StaticCalibrationClient::default(),
        calibration,
    ));
    let resolver = ParameterResolver::new(stores.parameters.clone(), stores.groups.clone());

    let scoring = Arc::new(ScoringService::new(
        stores.aggregates.clone(),
        stores.scores.clone(),
        calibrator,
    ));
    let risk = Arc::new(RiskService::new(
        stores.aggregates.clone(),
        stores.risks.clone(),
        stores.groups.clone(),
        resolver,
    ));
    let params = Arc::new(ParamsService::new(stores.parameters.clone()));
    let groups = Arc::new(GroupsService::new(stores.groups.clone()));

    (scoring, risk, params, groups)
}

pub(crate) const DEMO_PERIOD: &str = "2025-06";
pub(crate) const DEMO_SECTORS: [&str; 2] = ["S01", "S02"];

fn demo_row(period: Period, sector: &str, columns: Value) -> RawAggregateRow {
    let map = columns
        .as_object()
        .expect("demo columns are an object")
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    RawAggregateRow {
        account_id: AccountId(Uuid::new_v4()),
        period,
        sector: sector.to_string(),
        window_months: 12,
        columns: map,
    }
}

/// Populates the aggregate store with a small but varied population:
/// aged meters, delinquent accounts, sparse rows, and one clean account
/// per sector.
pub(crate) fn seed_demo_data(stores: &Stores) {
    let period = Period::parse(DEMO_PERIOD).expect("demo period is valid");
    let group_id = Uuid::new_v4();
    for sector in DEMO_SECTORS {
        stores.groups.link(sector, group_id);
    }

    let profiles = [
        json!({
            "idade_hidrometro_meses": 150,
            "taxa_anomalias": 0.09,
            "std_consumo_m3": 6.0,
            "media_consumo_m3": 12.0,
            "taxa_inconsistencias": 0.25,
            "media_tempo_atraso": 120,
            "qtd_contas_abertas": 4,
            "valor_total_aberto": 1800.0
        }),
        json!({
            "idade_hidrometro_meses": 36,
            "taxa_anomalias": 0.01,
            "std_consumo_m3": 1.0,
            "media_consumo_m3": 14.0,
            "taxa_inconsistencias": 0.02,
            "media_tempo_atraso": 0,
            "qtd_contas_abertas": 0,
            "valor_total_aberto": 0.0
        }),
        json!({
            "idade_hidrometro_meses": 84,
            "taxa_anomalias": 0.05,
            "media_tempo_atraso": 45,
            "qtd_contas_abertas": 2,
            "valor_total_aberto": 600.0
        }),
        json!({
            "taxa_inconsistencias": 0.6,
            "media_tempo_atraso": 200,
            "qtd_contas_abertas": 7,
            "valor_total_aberto": 4200.0
        }),
        json!({
            "idade_hidrometro_meses": 110,
            "taxa_anomalias": "0.13",
            "std_consumo_m3": 5.5,
            "media_consumo_m3": 9.0
        }),
    ];

    for sector in DEMO_SECTORS {
        for profile in &profiles {
            stores
                .aggregates
                .push(demo_row(period, sector, profile.clone()));
        }
    }
}
