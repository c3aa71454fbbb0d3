//! Per-record evaluation: the piecewise rule evaluator, the two family
//! score sources, and the engine that turns one canonical record plus one
//! ingested policy into a persisted score row.

use serde::{Deserialize, Serialize};

use super::bins::bin_index;
use super::canonical::{AccountId, CanonicalRecord, Family, Feature, Period};
use super::classify::{classify, pick_template_key, PotentialTier};
use super::composite::{composite_score, round2};
use super::policy::{
    CalibratedPolicy, FamilyWeights, PenaltySpec, PiecewiseRule, Policy, ScoreThresholds,
    Templates,
};
use crate::params::CoefficientSet;

/// One family's sub-score in [0,1] plus its data-completeness flag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FamilyScore {
    pub value: f64,
    pub missing: bool,
}

impl FamilyScore {
    const MISSING: FamilyScore = FamilyScore {
        value: 0.0,
        missing: true,
    };
}

/// Evaluates one rule against one record. An absent feature contributes 0;
/// otherwise the bin containing the value selects the calibrated output,
/// clamped into [0,1]. Bin selection shares [`bin_index`] with the
/// population histograms.
pub fn evaluate_piecewise(rule: &PiecewiseRule, record: &CanonicalRecord) -> f64 {
    let Some(value) = record.feature(rule.feature) else {
        return 0.0;
    };
    let idx = bin_index(value, &rule.breaks);
    rule.values.get(idx).copied().unwrap_or(0.0).clamp(0.0, 1.0)
}

/// Unweighted mean of rule outputs over rules whose feature is present.
/// `missing` flags an empty rule list, any absent contributing feature, or
/// the nothing-evaluable case (which also pins the value to 0).
pub fn aggregate_family(rules: &[PiecewiseRule], record: &CanonicalRecord) -> FamilyScore {
    if rules.is_empty() {
        return FamilyScore::MISSING;
    }

    let mut sum = 0.0;
    let mut used = 0usize;
    let mut any_missing = false;
    for rule in rules {
        if record.feature(rule.feature).is_some() {
            sum += evaluate_piecewise(rule, record);
            used += 1;
        } else {
            any_missing = true;
        }
    }

    if used == 0 {
        FamilyScore::MISSING
    } else {
        FamilyScore {
            value: sum / used as f64,
            missing: any_missing,
        }
    }
}

// Fixed references the compact path normalizes raw values against. These
// are not derived from calibration; they mirror the documented behavior of
// the coefficient-driven calculators.
const METER_AGE_REF_YEARS: f64 = 10.0;
const DELINQUENCY_REF_DAYS: f64 = 90.0;
const OPEN_INVOICES_REF: f64 = 6.0;

/// Coefficient-driven family scoring: each raw value is normalized against
/// a fixed reference, inverted so worse raw values reduce potential, and
/// the weighted mean is bounded into `[pot_min, pot_max]`.
#[derive(Debug, Clone, PartialEq)]
pub struct CompactEvaluator {
    set: CoefficientSet,
}

impl CompactEvaluator {
    pub fn new(set: CoefficientSet) -> Self {
        Self { set }
    }

    pub fn coefficients(&self) -> &CoefficientSet {
        &self.set
    }

    pub fn family_score(&self, family: Family, record: &CanonicalRecord) -> FamilyScore {
        match family {
            Family::Cadastro => match record.inconsistencias_rate {
                None => FamilyScore::MISSING,
                Some(rate) => FamilyScore {
                    value: self.bounded(1.0 - self.z_ramp(rate)),
                    missing: false,
                },
            },
            Family::Medicao => self.weighted(
                record,
                &[
                    (
                        Feature::MeterAgeYears,
                        METER_AGE_REF_YEARS,
                        self.set.w_idade,
                    ),
                    (Feature::AnomalyRate, 1.0, self.set.w_anomalias),
                    (Feature::ConsumptionCv, 1.0, self.set.w_desvio),
                ],
            ),
            Family::Inadimplencia => self.weighted(
                record,
                &[
                    (
                        Feature::DelinquencyDays,
                        DELINQUENCY_REF_DAYS,
                        self.set.w_atraso,
                    ),
                    (
                        Feature::OpenInvoicesCount,
                        OPEN_INVOICES_REF,
                        self.set.w_indice,
                    ),
                    (Feature::OpenAmountRatio, 1.0, self.set.w_valor_aberto),
                ],
            ),
        }
    }

    fn weighted(
        &self,
        record: &CanonicalRecord,
        components: &[(Feature, f64, f64)],
    ) -> FamilyScore {
        let mut sum = 0.0;
        let mut weight_sum = 0.0;
        let mut any_missing = false;
        let mut used = 0usize;

        for (feature, reference, weight) in components {
            match record.feature(*feature) {
                Some(raw) => {
                    let badness = (raw / reference).clamp(0.0, 1.0);
                    sum += weight * (1.0 - badness);
                    weight_sum += weight;
                    used += 1;
                }
                None => any_missing = true,
            }
        }

        if used == 0 {
            return FamilyScore::MISSING;
        }
        let weight_sum = if weight_sum > 0.0 { weight_sum } else { 1.0 };
        FamilyScore {
            value: self.bounded(sum / weight_sum),
            missing: any_missing,
        }
    }

    /// Consistency ramp: 0 below `z_warn`, 1 above `z_risk`, linear between.
    fn z_ramp(&self, value: f64) -> f64 {
        let (warn, risk) = (self.set.z_warn, self.set.z_risk);
        if value <= warn {
            0.0
        } else if value >= risk {
            1.0
        } else {
            (value - warn) / (risk - warn)
        }
    }

    fn bounded(&self, raw01: f64) -> f64 {
        let (lo, hi) = (self.set.pot_min, self.set.pot_max);
        (lo + raw01.clamp(0.0, 1.0) * (hi - lo)).clamp(lo.min(hi), lo.max(hi))
    }
}

/// Where a policy's family sub-scores come from: calibrated piecewise
/// rules or a coefficient set. Selected once at ingestion; scoring never
/// inspects the raw calibration JSON again.
#[derive(Debug, Clone, PartialEq)]
pub enum FamilySource {
    Rich(Policy),
    Compact(CompactEvaluator),
}

impl FamilySource {
    pub fn family_score(&self, family: Family, record: &CanonicalRecord) -> FamilyScore {
        match self {
            FamilySource::Rich(policy) => {
                aggregate_family(policy.mappings.for_family(family), record)
            }
            FamilySource::Compact(evaluator) => evaluator.family_score(family, record),
        }
    }
}

/// A fully ingested, scoring-ready policy.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoringPolicy {
    pub policy_id: String,
    pub weights: FamilyWeights,
    pub source: FamilySource,
    pub penalty: Option<PenaltySpec>,
    pub thresholds: ScoreThresholds,
    pub none_cut: f64,
    pub templates: Option<Templates>,
    pub validity_days: f64,
}

impl ScoringPolicy {
    pub fn from_rich(policy: Policy) -> Self {
        Self {
            policy_id: policy.policy_id.clone(),
            weights: policy.weights,
            penalty: policy
                .penalties
                .as_ref()
                .map(|p| p.inadimplencia_score_penalty.clone()),
            thresholds: policy.classification.score_thresholds,
            none_cut: policy.classification.nenhum_if_all_potentials_below,
            templates: Some(policy.templates.clone()),
            validity_days: policy.meta.validity_days,
            source: FamilySource::Rich(policy),
        }
    }

    pub fn from_coefficients(policy_id: String, set: CoefficientSet) -> Self {
        Self {
            policy_id,
            weights: FamilyWeights {
                cadastro: set.w_fam_cadastro,
                medicao: set.w_fam_medicao,
                inadimplencia: set.w_fam_inad,
            },
            penalty: Some(PenaltySpec {
                trigger_feature: Feature::OpenAmountRatio,
                trigger_threshold: set.pen_trigger_ratio,
                curve: set.pen_curve,
                max_penalty: set.pen_max,
            }),
            thresholds: ScoreThresholds {
                baixo: set.thr_baixo,
                medio: set.thr_medio,
                alto: set.thr_alto,
            },
            none_cut: set.none_cut,
            templates: None,
            validity_days: 365.0,
            source: FamilySource::Compact(CompactEvaluator::new(set)),
        }
    }

    pub fn from_calibrated(calibrated: CalibratedPolicy) -> Self {
        match calibrated {
            CalibratedPolicy::Rich(policy) => Self::from_rich(policy),
            CalibratedPolicy::Compact(compact) => {
                Self::from_coefficients(compact.policy_id.clone(), compact.to_coefficients())
            }
        }
    }

    pub fn family_score(&self, family: Family, record: &CanonicalRecord) -> FamilyScore {
        self.source.family_score(family, record)
    }
}

/// Persisted per account-period result. Score fields are null only on a
/// per-record failure, in which case `error` carries the audit payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreOutput {
    pub account_id: AccountId,
    pub period: Period,
    pub sector: String,
    pub score_total: Option<f64>,
    pub score_cadastro: Option<f64>,
    pub score_medicao: Option<f64>,
    pub score_inadimplencia: Option<f64>,
    pub level: Option<PotentialTier>,
    pub motivo: String,
    pub acao_sugerida: String,
    pub justificativa_curta: String,
    pub error: Option<String>,
}

impl ScoreOutput {
    pub fn failure(account_id: AccountId, period: Period, sector: String, error: String) -> Self {
        Self {
            account_id,
            period,
            sector,
            score_total: None,
            score_cadastro: None,
            score_medicao: None,
            score_inadimplencia: None,
            level: None,
            motivo: String::new(),
            acao_sugerida: String::new(),
            justificativa_curta: String::new(),
            error: Some(error),
        }
    }
}

/// Drives one policy over canonical records.
#[derive(Debug, Clone)]
pub struct ScoringEngine {
    policy: ScoringPolicy,
}

impl ScoringEngine {
    pub fn new(policy: ScoringPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ScoringPolicy {
        &self.policy
    }

    pub fn score(&self, record: &CanonicalRecord) -> ScoreOutput {
        let cad = self.policy.family_score(Family::Cadastro, record);
        let med = self.policy.family_score(Family::Medicao, record);
        let inad = self.policy.family_score(Family::Inadimplencia, record);

        let score100 = composite_score(
            &self.policy.weights,
            cad.value,
            med.value,
            inad.value,
            record,
            self.policy.penalty.as_ref(),
        );

        let tier = classify(
            score100,
            &self.policy.thresholds,
            self.policy.none_cut,
            cad.value,
            med.value,
            inad.value,
        );

        let any_missing = cad.missing || med.missing || inad.missing;
        let key = pick_template_key(cad.value, med.value, inad.value, any_missing);
        let narrative = self
            .policy
            .templates
            .as_ref()
            .map(|t| t.narrative(key))
            .unwrap_or_default();

        ScoreOutput {
            account_id: record.account_id,
            period: record.period,
            sector: record.sector.clone(),
            score_total: Some(round2(score100)),
            score_cadastro: Some(round2(cad.value * 100.0)),
            score_medicao: Some(round2(med.value * 100.0)),
            score_inadimplencia: Some(round2(inad.value * 100.0)),
            level: Some(tier),
            motivo: narrative.motivo,
            acao_sugerida: narrative.acao_sugerida,
            justificativa_curta: narrative.justificativa_curta,
            error: None,
        }
    }
}
