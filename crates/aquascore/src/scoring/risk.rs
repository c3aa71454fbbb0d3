//! Operational risk batch, the additive sibling of the potential score.
//!
//! Where the potential pipeline is policy-driven and calibrated, the risk
//! batch is a fixed formula over the same canonical record, parameterized
//! only by the resolved coefficient set. Components are 0..100, the total
//! is `cadastro + medicao - inadimplencia` clamped back into 0..100.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use super::canonical::{column_p95, AccountId, CanonicalRecord, FeatureNormalizer, Period};
use super::composite::round2;
use crate::params::{CoefficientSet, ParameterResolver};
use crate::store::{AggregateRepository, RiskRepository, SectorGroupRepository, StoreError};

#[derive(Debug, Error)]
pub enum RiskError {
    #[error("escopo must be 'setor', 'grupo' or 'todos', got '{0}'")]
    InvalidScope(String),
    #[error("escopo '{0}' requires at least one identificador")]
    EmptyIdentifiers(String),
    #[error("grupo identificador must be a UUID, got '{0}'")]
    GroupIdNotUuid(String),
    #[error("periodo must be YYYY-MM or YYYY-MM-DD, got '{0}'")]
    InvalidPeriod(String),
    #[error("janela_meses must be a positive number of months, got {0}")]
    InvalidWindow(i64),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RiskTier {
    Ok,
    Atencao,
    Risco,
}

impl RiskTier {
    pub const fn label(self) -> &'static str {
        match self {
            RiskTier::Ok => "OK",
            RiskTier::Atencao => "ATENCAO",
            RiskTier::Risco => "RISCO",
        }
    }
}

/// One persisted risk evaluation, unique on `(account_id, period)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskRow {
    pub account_id: AccountId,
    pub period: Period,
    pub score_cadastro: f64,
    pub score_inadimplencia: f64,
    pub score_medicao: f64,
    pub score_total: f64,
    pub nivel: RiskTier,
    pub mensagem: String,
}

fn clamp100(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 100.0)
    } else {
        0.0
    }
}

/// Computes the three components and the tier for one record. Missing
/// metrics contribute zero; every component is rounded to two decimals
/// before the total is formed, so the persisted parts always re-add to
/// the persisted total.
pub fn evaluate_risk(record: &CanonicalRecord, set: &CoefficientSet) -> RiskRow {
    let metric = |value: Option<f64>| value.filter(|v| v.is_finite()).unwrap_or(0.0);

    let cadastro = round2(clamp100(
        metric(record.inconsistencias_rate).abs() * set.fator_normalizacao,
    ));

    let meter_age_months = metric(record.meter_age_years) * 12.0;
    let medicao = round2(clamp100(
        meter_age_months * set.w_idade
            + metric(record.anomaly_rate) * set.w_anomalias
            + metric(record.consumption_cv) * set.w_desvio,
    ));

    let inadimplencia = round2(clamp100(
        metric(record.delinquency_days) * set.w_atraso
            + metric(record.open_invoices_count) * set.w_indice
            + metric(record.open_amount_ratio) * set.w_valor_aberto,
    ));

    let total = round2(clamp100(cadastro + medicao - inadimplencia));
    let nivel = if total >= set.thr_medio {
        RiskTier::Risco
    } else if total >= set.thr_baixo {
        RiskTier::Atencao
    } else {
        RiskTier::Ok
    };

    RiskRow {
        account_id: record.account_id,
        period: record.period,
        score_cadastro: cadastro,
        score_inadimplencia: inadimplencia,
        score_medicao: medicao,
        score_total: total,
        nivel,
        mensagem: format!(
            "cad={cadastro:.2}, inad={inadimplencia:.2}, med={medicao:.2} (total={total:.2})"
        ),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RiskRunRequest {
    pub escopo: String,
    #[serde(default)]
    pub identificadores: Vec<String>,
    pub periodo: String,
    pub janela_meses: i64,
    #[serde(default)]
    pub reprocess: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RiskReport {
    pub periodo: String,
    pub total: usize,
    pub written: usize,
    pub skipped: usize,
    pub deleted: usize,
}

enum RiskScope {
    Sectors(Vec<String>),
    All,
}

/// Runs the risk formula over a scope and persists the rows.
///
/// Without `reprocess`, accounts that already carry a row for the period
/// are skipped. With it, their rows are deleted before any write so a
/// failed rerun can never leave a half-old half-new period behind.
#[derive(Clone)]
pub struct RiskService {
    aggregates: Arc<dyn AggregateRepository>,
    risks: Arc<dyn RiskRepository>,
    groups: Arc<dyn SectorGroupRepository>,
    resolver: ParameterResolver,
}

impl RiskService {
    pub fn new(
        aggregates: Arc<dyn AggregateRepository>,
        risks: Arc<dyn RiskRepository>,
        groups: Arc<dyn SectorGroupRepository>,
        resolver: ParameterResolver,
    ) -> Self {
        Self {
            aggregates,
            risks,
            groups,
            resolver,
        }
    }

    pub fn run(&self, request: &RiskRunRequest) -> Result<RiskReport, RiskError> {
        let period = Period::parse(&request.periodo)
            .ok_or_else(|| RiskError::InvalidPeriod(request.periodo.clone()))?;
        let window_months = u32::try_from(request.janela_meses)
            .ok()
            .filter(|w| *w > 0)
            .ok_or(RiskError::InvalidWindow(request.janela_meses))?;
        let scope = self.resolve_scope(request)?;

        let sectors = match &scope {
            RiskScope::Sectors(sectors) => Some(sectors.as_slice()),
            RiskScope::All => None,
        };
        let rows = self.aggregates.rows_for_scope(period, sectors)?;
        let total = rows.len();

        let normalizer =
            FeatureNormalizer::with_open_amount_p95(column_p95(&rows, "valor_total_aberto"));
        let records: Vec<CanonicalRecord> =
            rows.iter().map(|row| normalizer.normalize(row)).collect();

        let mut skipped = 0usize;
        let mut deleted = 0usize;
        let records: Vec<CanonicalRecord> = if request.reprocess {
            let ids: Vec<AccountId> = records.iter().map(|r| r.account_id).collect();
            deleted = self.risks.delete_for_accounts(period, &ids)?;
            records
        } else {
            let existing: HashSet<AccountId> =
                self.risks.existing_accounts(period)?.into_iter().collect();
            let (keep, skip): (Vec<_>, Vec<_>) = records
                .into_iter()
                .partition(|r| !existing.contains(&r.account_id));
            skipped = skip.len();
            keep
        };

        let mut coefficients: HashMap<String, CoefficientSet> = HashMap::new();
        let mut out = Vec::with_capacity(records.len());
        for record in &records {
            if !coefficients.contains_key(&record.sector) {
                let set = self
                    .resolver
                    .resolve(Some(&record.sector), period, window_months)?;
                debug!(sector = %record.sector, "resolved risk coefficients");
                coefficients.insert(record.sector.clone(), set);
            }
            out.push(evaluate_risk(record, &coefficients[&record.sector]));
        }

        self.risks.upsert_batch(&out)?;
        info!(
            periodo = %period.month_key(),
            total,
            written = out.len(),
            skipped,
            deleted,
            "risk batch complete"
        );

        Ok(RiskReport {
            periodo: period.month_key(),
            total,
            written: out.len(),
            skipped,
            deleted,
        })
    }

    fn resolve_scope(&self, request: &RiskRunRequest) -> Result<RiskScope, RiskError> {
        match request.escopo.as_str() {
            "todos" => Ok(RiskScope::All),
            "setor" => {
                if request.identificadores.is_empty() {
                    return Err(RiskError::EmptyIdentifiers(request.escopo.clone()));
                }
                Ok(RiskScope::Sectors(request.identificadores.clone()))
            }
            "grupo" => {
                if request.identificadores.is_empty() {
                    return Err(RiskError::EmptyIdentifiers(request.escopo.clone()));
                }
                let mut sectors = Vec::new();
                for raw in &request.identificadores {
                    let group_id = Uuid::parse_str(raw)
                        .map_err(|_| RiskError::GroupIdNotUuid(raw.clone()))?;
                    sectors.extend(self.groups.sectors_in_group(group_id)?);
                }
                sectors.sort();
                sectors.dedup();
                Ok(RiskScope::Sectors(sectors))
            }
            other => Err(RiskError::InvalidScope(other.to_string())),
        }
    }
}
