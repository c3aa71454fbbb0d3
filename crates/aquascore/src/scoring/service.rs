//! Sector batch orchestration: rows in, calibrated policy, scores out.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::bins::PopulationSummary;
use super::canonical::{
    column_p95, compute_coverage, AccountId, CanonicalRecord, Coverage, FeatureNormalizer, Period,
};
use super::engine::{ScoreOutput, ScoringEngine};
use crate::calibrate::{CalibrationClient, CalibrationError, Calibrator};
use crate::store::{AggregateRepository, ScoreRepository, StoreError};

#[derive(Debug, Error)]
pub enum ScoringError {
    #[error("periodo must be YYYY-MM or YYYY-MM-DD, got '{0}'")]
    InvalidPeriod(String),
    #[error("no aggregate rows for period {0}")]
    EmptyPeriod(Period),
    #[error("no aggregate rows for sector {sector} in period {period}")]
    EmptySector { period: Period, sector: String },
    #[error(transparent)]
    Calibration(#[from] CalibrationError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoringRunReport {
    pub periodo: String,
    pub setor: String,
    pub policy_id: String,
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub coverage: Coverage,
}

/// Structured audit payload stored on a failed row's `error` column.
fn audit_error(
    tipo_erro: &str,
    account_id: AccountId,
    period: Period,
    sector: &str,
    message: &str,
) -> String {
    json!({
        "tipo_erro": tipo_erro,
        "timestamp": Utc::now().to_rfc3339(),
        "imovel_id": account_id.to_string(),
        "periodo": period.month_key(),
        "setor": sector,
        "error_message": message,
    })
    .to_string()
}

/// Scores one sector for one period.
///
/// Calibration always sees the whole period's population, not just the
/// requested sector, so per-sector runs within a month stay comparable.
/// A record that fails validation becomes a persisted failure row instead
/// of aborting the batch; only calibration and store-level failures abort.
pub struct ScoringService<C> {
    aggregates: Arc<dyn AggregateRepository>,
    scores: Arc<dyn ScoreRepository>,
    calibrator: Arc<Calibrator<C>>,
}

impl<C: CalibrationClient> ScoringService<C> {
    pub fn new(
        aggregates: Arc<dyn AggregateRepository>,
        scores: Arc<dyn ScoreRepository>,
        calibrator: Arc<Calibrator<C>>,
    ) -> Self {
        Self {
            aggregates,
            scores,
            calibrator,
        }
    }

    pub async fn run(&self, period: Period, sector: &str) -> Result<ScoringRunReport, ScoringError> {
        let period_rows = self.aggregates.rows_for_period(period)?;
        if period_rows.is_empty() {
            return Err(ScoringError::EmptyPeriod(period));
        }
        let sector_rows = self.aggregates.rows_for_sector(period, sector)?;
        if sector_rows.is_empty() {
            return Err(ScoringError::EmptySector {
                period,
                sector: sector.to_string(),
            });
        }

        let normalizer =
            FeatureNormalizer::with_open_amount_p95(column_p95(&period_rows, "valor_total_aberto"));
        let population: Vec<CanonicalRecord> = period_rows
            .iter()
            .map(|row| normalizer.normalize(row))
            .collect();
        let summary = PopulationSummary::summarize(&population);

        let records: Vec<CanonicalRecord> = sector_rows
            .iter()
            .map(|row| normalizer.normalize(row))
            .collect();
        let coverage = compute_coverage(&records);
        debug!(
            periodo = %period.month_key(),
            setor = sector,
            total = coverage.total,
            cadastro = coverage.families["cadastro"],
            medicao = coverage.families["medicao"],
            inadimplencia = coverage.families["inadimplencia"],
            "feature coverage"
        );

        let policy = self
            .calibrator
            .policy_for(period, Some(sector), &summary)
            .await?;
        let engine = ScoringEngine::new(policy.as_ref().clone());

        let mut outputs = Vec::with_capacity(records.len());
        let mut failed = 0usize;
        for record in &records {
            if record.account_id.0.is_nil() {
                failed += 1;
                outputs.push(ScoreOutput::failure(
                    record.account_id,
                    record.period,
                    record.sector.clone(),
                    audit_error(
                        "validacao",
                        record.account_id,
                        record.period,
                        sector,
                        "account id is the nil UUID",
                    ),
                ));
                continue;
            }
            outputs.push(engine.score(record));
        }

        failed += self.persist(&mut outputs, period, sector)?;
        let total = outputs.len();
        let succeeded = total - failed;
        info!(
            periodo = %period.month_key(),
            setor = sector,
            policy_id = %policy.policy_id,
            total,
            succeeded,
            failed,
            "scoring batch complete"
        );

        Ok(ScoringRunReport {
            periodo: period.month_key(),
            setor: sector.to_string(),
            policy_id: policy.policy_id.clone(),
            total,
            succeeded,
            failed,
            coverage,
        })
    }

    /// Batch write with a row-by-row fallback. A rejected row is replaced
    /// in place by a persisted failure row carrying the audit payload.
    fn persist(
        &self,
        outputs: &mut [ScoreOutput],
        period: Period,
        sector: &str,
    ) -> Result<usize, ScoringError> {
        match self.scores.upsert_batch(outputs) {
            Ok(()) => return Ok(0),
            Err(StoreError::BatchRejected(reason)) => {
                warn!(reason = %reason, "batch upsert rejected, retrying row by row");
            }
            Err(other) => return Err(other.into()),
        }

        let mut failed = 0usize;
        for output in outputs.iter_mut() {
            match self.scores.upsert_one(output) {
                Ok(()) => {}
                Err(StoreError::RowRejected { account_id, reason }) => {
                    failed += 1;
                    *output = ScoreOutput::failure(
                        output.account_id,
                        period,
                        output.sector.clone(),
                        audit_error("persistencia", output.account_id, period, sector, &reason),
                    );
                    if let Err(err) = self.scores.upsert_one(output) {
                        error!(account = %account_id, error = %err, "failure row not persisted");
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(failed)
    }
}
