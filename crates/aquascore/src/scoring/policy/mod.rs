//! The externally-calibrated policy model and its ingestion-time
//! validation. A policy that fails validation is never used, not even
//! partially; the calibration cycle that produced it fails closed.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::scoring::canonical::{Family, Feature};

mod compact;
mod remap;

pub use compact::{
    CompactCadastro, CompactClassificacao, CompactFamilias, CompactInadimplencia, CompactMedicao,
    CompactPolicy, CompactPotencial,
};
pub use remap::{policy_from_calibration, CalibratedPolicy};

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("calibration response matches no known policy shape")]
    UnrecognizedShape(#[source] serde_json::Error),
    #[error("breaks must be non-empty and strictly increasing for feature '{feature}'")]
    BadBreaks { feature: &'static str },
    #[error("feature '{feature}' defines {breaks} breaks but {values} values")]
    ValueCountMismatch {
        feature: &'static str,
        breaks: usize,
        values: usize,
    },
    #[error("bin value {value} for feature '{feature}' is outside [0,1]")]
    ValueOutOfRange { feature: &'static str, value: f64 },
    #[error("score thresholds must satisfy baixo < medio <= alto, got {baixo}/{medio}/{alto}")]
    ThresholdOrder { baixo: f64, medio: f64, alto: f64 },
    #[error("no-signal cutoff {0} is outside [0,1]")]
    CutoffOutOfRange(f64),
    #[error("validity_days must be positive, got {0}")]
    NonPositiveValidity(f64),
    #[error("template section '{section}' is missing key {key:?}")]
    MissingTemplate {
        section: &'static str,
        key: TemplateKey,
    },
    #[error("{family} weight triple sums to {sum}, expected 1 within 1e-3")]
    WeightTripleDrift { family: &'static str, sum: f64 },
    #[error("z thresholds inverted: z_warn {z_warn} must be below z_risk {z_risk}")]
    InvertedZ { z_warn: f64, z_risk: f64 },
    #[error("potential bounds inverted: pot_min {pot_min} exceeds pot_max {pot_max}")]
    InvertedBounds { pot_min: f64, pot_max: f64 },
    #[error("compact policy is missing a policy_id")]
    MissingPolicyId,
}

/// Penalty shape applied when the trigger feature crosses its threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PenaltyCurve {
    Linear,
    Log,
}

/// One calibrated rule: N breakpoints and N+1 bin values in [0,1].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PiecewiseRule {
    pub feature: Feature,
    pub breaks: Vec<f64>,
    pub values: Vec<f64>,
    #[serde(default)]
    pub higher_is_risk: bool,
}

/// Top-level weights over the three families. Drift away from sum 1 is
/// tolerated here and renormalized at scoring time.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FamilyWeights {
    pub cadastro: f64,
    pub medicao: f64,
    pub inadimplencia: f64,
}

impl FamilyWeights {
    pub fn get(&self, family: Family) -> f64 {
        match family {
            Family::Cadastro => self.cadastro,
            Family::Medicao => self.medicao,
            Family::Inadimplencia => self.inadimplencia,
        }
    }

    pub const fn equal_thirds() -> Self {
        Self {
            cadastro: 1.0 / 3.0,
            medicao: 1.0 / 3.0,
            inadimplencia: 1.0 / 3.0,
        }
    }
}

/// Per-family rule lists of the rich policy shape.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FamilyRules {
    pub cadastro: Vec<PiecewiseRule>,
    pub medicao: Vec<PiecewiseRule>,
    pub inadimplencia: Vec<PiecewiseRule>,
}

impl FamilyRules {
    pub fn for_family(&self, family: Family) -> &[PiecewiseRule] {
        match family {
            Family::Cadastro => &self.cadastro,
            Family::Medicao => &self.medicao,
            Family::Inadimplencia => &self.inadimplencia,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PenaltySpec {
    pub trigger_feature: Feature,
    pub trigger_threshold: f64,
    pub curve: PenaltyCurve,
    pub max_penalty: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Penalties {
    pub inadimplencia_score_penalty: PenaltySpec,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScoreThresholds {
    pub baixo: f64,
    pub medio: f64,
    pub alto: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub score_thresholds: ScoreThresholds,
    pub nenhum_if_all_potentials_below: f64,
}

/// Closed key set for the narrative templates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TemplateKey {
    MedicaoDominante,
    CadastroDominante,
    InadAlta,
    DadosInsuficientes,
    Balanceado,
}

impl TemplateKey {
    pub const ALL: [TemplateKey; 5] = [
        TemplateKey::MedicaoDominante,
        TemplateKey::CadastroDominante,
        TemplateKey::InadAlta,
        TemplateKey::DadosInsuficientes,
        TemplateKey::Balanceado,
    ];
}

/// The three narrative strings attached to a scored row.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Narrative {
    pub motivo: String,
    pub acao_sugerida: String,
    pub justificativa_curta: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Templates {
    pub motivo: BTreeMap<TemplateKey, String>,
    pub acao_sugerida: BTreeMap<TemplateKey, String>,
    pub justificativa_curta: BTreeMap<TemplateKey, String>,
}

impl Templates {
    pub fn narrative(&self, key: TemplateKey) -> Narrative {
        Narrative {
            motivo: self.motivo.get(&key).cloned().unwrap_or_default(),
            acao_sugerida: self.acao_sugerida.get(&key).cloned().unwrap_or_default(),
            justificativa_curta: self
                .justificativa_curta
                .get(&key)
                .cloned()
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMeta {
    pub validity_days: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

/// The rich policy shape: calibrated piecewise rules per family plus the
/// penalty, classification, and narrative blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub policy_id: String,
    pub periodo: String,
    pub weights: FamilyWeights,
    pub mappings: FamilyRules,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub penalties: Option<Penalties>,
    pub classification: Classification,
    pub templates: Templates,
    pub meta: PolicyMeta,
}

impl Policy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        for family in Family::ALL {
            for rule in self.mappings.for_family(family) {
                validate_rule(rule)?;
            }
        }

        let thr = self.classification.score_thresholds;
        if !(thr.baixo < thr.medio && thr.medio <= thr.alto) {
            return Err(PolicyError::ThresholdOrder {
                baixo: thr.baixo,
                medio: thr.medio,
                alto: thr.alto,
            });
        }

        let cutoff = self.classification.nenhum_if_all_potentials_below;
        if !(0.0..=1.0).contains(&cutoff) {
            return Err(PolicyError::CutoffOutOfRange(cutoff));
        }

        if !(self.meta.validity_days > 0.0) {
            return Err(PolicyError::NonPositiveValidity(self.meta.validity_days));
        }

        let sections: [(&'static str, &BTreeMap<TemplateKey, String>); 3] = [
            ("motivo", &self.templates.motivo),
            ("acao_sugerida", &self.templates.acao_sugerida),
            ("justificativa_curta", &self.templates.justificativa_curta),
        ];
        for (section, map) in sections {
            for key in TemplateKey::ALL {
                if !map.contains_key(&key) {
                    return Err(PolicyError::MissingTemplate { section, key });
                }
            }
        }

        Ok(())
    }
}

fn validate_rule(rule: &PiecewiseRule) -> Result<(), PolicyError> {
    let feature = rule.feature.name();

    let increasing = rule.breaks.windows(2).all(|w| w[0] < w[1]);
    if rule.breaks.is_empty() || !increasing || rule.breaks.iter().any(|b| !b.is_finite()) {
        return Err(PolicyError::BadBreaks { feature });
    }

    if rule.values.len() != rule.breaks.len() + 1 {
        return Err(PolicyError::ValueCountMismatch {
            feature,
            breaks: rule.breaks.len(),
            values: rule.values.len(),
        });
    }

    for value in &rule.values {
        if !value.is_finite() || !(0.0..=1.0).contains(value) {
            return Err(PolicyError::ValueOutOfRange {
                feature,
                value: *value,
            });
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) fn test_policy() -> Policy {
    let rule = |feature: Feature, breaks: &[f64], values: &[f64]| PiecewiseRule {
        feature,
        breaks: breaks.to_vec(),
        values: values.to_vec(),
        higher_is_risk: true,
    };
    let section = || {
        TemplateKey::ALL
            .into_iter()
            .map(|key| (key, format!("{key:?}")))
            .collect::<BTreeMap<_, _>>()
    };

    Policy {
        policy_id: "policy_test".to_string(),
        periodo: "2025-01-01".to_string(),
        weights: FamilyWeights {
            cadastro: 1.0 / 3.0,
            medicao: 1.0 / 3.0,
            inadimplencia: 1.0 / 3.0,
        },
        mappings: FamilyRules {
            cadastro: vec![rule(
                Feature::InconsistenciasRate,
                &[0.10, 0.30, 0.50],
                &[0.1, 0.3, 0.6, 0.9],
            )],
            medicao: vec![
                rule(Feature::MeterAgeYears, &[5.0, 10.0, 15.0], &[0.1, 0.4, 0.7, 0.9]),
                rule(Feature::AnomalyRate, &[0.03, 0.07, 0.12], &[0.1, 0.4, 0.7, 0.9]),
            ],
            inadimplencia: vec![rule(
                Feature::DelinquencyDays,
                &[30.0, 90.0, 180.0],
                &[0.1, 0.4, 0.7, 0.9],
            )],
        },
        penalties: None,
        classification: Classification {
            score_thresholds: ScoreThresholds {
                baixo: 40.0,
                medio: 70.0,
                alto: 100.0,
            },
            nenhum_if_all_potentials_below: 0.05,
        },
        templates: Templates {
            motivo: section(),
            acao_sugerida: section(),
            justificativa_curta: section(),
        },
        meta: PolicyMeta {
            validity_days: 30.0,
            notes: None,
        },
    }
}
