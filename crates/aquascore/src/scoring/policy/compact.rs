//! The compact calibration shape: per-family scalar weights instead of
//! piecewise rules. It degrades gracefully: every missing field falls
//! back to a hard default before the set is normalized and checked.

use serde::{Deserialize, Serialize};

use super::{PenaltyCurve, PolicyError};
use crate::params::CoefficientSet;

const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompactFamilias {
    pub cadastro: Option<f64>,
    pub medicao: Option<f64>,
    pub inadimplencia: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompactInadimplencia {
    #[serde(alias = "w_atraso")]
    pub w_days: Option<f64>,
    #[serde(alias = "w_indice")]
    pub w_open_count: Option<f64>,
    #[serde(alias = "w_valor_aberto")]
    pub w_amount_ratio: Option<f64>,
    pub trigger_ratio: Option<f64>,
    pub penalty_max: Option<f64>,
    pub curve: Option<PenaltyCurve>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompactMedicao {
    pub w_idade: Option<f64>,
    pub w_anomalias: Option<f64>,
    pub w_desvio: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompactCadastro {
    pub z_warn: Option<f64>,
    pub z_risk: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompactPotencial {
    pub pot_min: Option<f64>,
    pub pot_max: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CompactClassificacao {
    pub baixo: Option<f64>,
    pub medio: Option<f64>,
    pub alto: Option<f64>,
    pub nenhum_if_all_potentials_below: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactPolicy {
    pub policy_id: String,
    #[serde(default)]
    pub periodo: Option<String>,
    #[serde(default)]
    pub familias: CompactFamilias,
    #[serde(default)]
    pub inadimplencia: CompactInadimplencia,
    #[serde(default)]
    pub medicao: CompactMedicao,
    #[serde(default)]
    pub cadastro: CompactCadastro,
    #[serde(default)]
    pub potencial: CompactPotencial,
    #[serde(default)]
    pub classificacao: CompactClassificacao,
}

impl CompactPolicy {
    pub fn validate(&self) -> Result<(), PolicyError> {
        if self.policy_id.trim().is_empty() {
            return Err(PolicyError::MissingPolicyId);
        }

        let defaults = CoefficientSet::default();

        // Drifted weight triples fail the whole calibration cycle; gaps
        // are filled from the defaults first so a fully absent section
        // stays valid.
        check_triple(
            "inadimplencia",
            [
                self.inadimplencia.w_days.unwrap_or(defaults.w_atraso),
                self.inadimplencia.w_open_count.unwrap_or(defaults.w_indice),
                self.inadimplencia
                    .w_amount_ratio
                    .unwrap_or(defaults.w_valor_aberto),
            ],
        )?;
        check_triple(
            "medicao",
            [
                self.medicao.w_idade.unwrap_or(defaults.w_idade),
                self.medicao.w_anomalias.unwrap_or(defaults.w_anomalias),
                self.medicao.w_desvio.unwrap_or(defaults.w_desvio),
            ],
        )?;
        if let (Some(cad), Some(med), Some(inad)) = (
            self.familias.cadastro,
            self.familias.medicao,
            self.familias.inadimplencia,
        ) {
            check_triple("familias", [cad, med, inad])?;
        }
        let z_warn = self.cadastro.z_warn.unwrap_or(defaults.z_warn);
        let z_risk = self.cadastro.z_risk.unwrap_or(defaults.z_risk);
        if !(z_warn < z_risk) {
            return Err(PolicyError::InvertedZ { z_warn, z_risk });
        }

        let pot_min = self.potencial.pot_min.unwrap_or(defaults.pot_min);
        let pot_max = self.potencial.pot_max.unwrap_or(defaults.pot_max);
        if !(pot_min <= pot_max) {
            return Err(PolicyError::InvertedBounds { pot_min, pot_max });
        }

        Ok(())
    }

    /// Fills the gaps with defaults, renormalizes the weight triples, and
    /// produces the same coefficient shape the parameter resolver emits.
    pub fn to_coefficients(&self) -> CoefficientSet {
        let mut set = CoefficientSet::default();

        let [cad, med, inad] = normalize_triple([
            self.familias.cadastro.unwrap_or(set.w_fam_cadastro),
            self.familias.medicao.unwrap_or(set.w_fam_medicao),
            self.familias.inadimplencia.unwrap_or(set.w_fam_inad),
        ]);
        set.w_fam_cadastro = cad;
        set.w_fam_medicao = med;
        set.w_fam_inad = inad;

        set.w_atraso = self.inadimplencia.w_days.unwrap_or(set.w_atraso);
        set.w_indice = self.inadimplencia.w_open_count.unwrap_or(set.w_indice);
        set.w_valor_aberto = self
            .inadimplencia
            .w_amount_ratio
            .unwrap_or(set.w_valor_aberto);
        set.pen_trigger_ratio = self
            .inadimplencia
            .trigger_ratio
            .unwrap_or(set.pen_trigger_ratio);
        set.pen_max = self.inadimplencia.penalty_max.unwrap_or(set.pen_max);
        set.pen_curve = self.inadimplencia.curve.unwrap_or(set.pen_curve);

        let [idade, anomalias, desvio] = normalize_triple([
            self.medicao.w_idade.unwrap_or(set.w_idade),
            self.medicao.w_anomalias.unwrap_or(set.w_anomalias),
            self.medicao.w_desvio.unwrap_or(set.w_desvio),
        ]);
        set.w_idade = idade;
        set.w_anomalias = anomalias;
        set.w_desvio = desvio;

        set.z_warn = self.cadastro.z_warn.unwrap_or(set.z_warn);
        set.z_risk = self.cadastro.z_risk.unwrap_or(set.z_risk);
        set.pot_min = self.potencial.pot_min.unwrap_or(set.pot_min);
        set.pot_max = self.potencial.pot_max.unwrap_or(set.pot_max);

        set.thr_baixo = self.classificacao.baixo.unwrap_or(set.thr_baixo);
        set.thr_medio = self.classificacao.medio.unwrap_or(set.thr_medio);
        set.thr_alto = self.classificacao.alto.unwrap_or(set.thr_alto);
        set.none_cut = self
            .classificacao
            .nenhum_if_all_potentials_below
            .unwrap_or(set.none_cut);

        set
    }
}

fn check_triple(family: &'static str, weights: [f64; 3]) -> Result<(), PolicyError> {
    let sum: f64 = weights.iter().sum();
    if !sum.is_finite() || (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(PolicyError::WeightTripleDrift { family, sum });
    }
    Ok(())
}

/// Rescales a weight triple to sum 1. A zero sum is left untouched; the
/// composite scorer handles that case with equal thirds.
fn normalize_triple(weights: [f64; 3]) -> [f64; 3] {
    let sum: f64 = weights.iter().sum();
    if sum == 0.0 || !sum.is_finite() {
        return weights;
    }
    weights.map(|w| w / sum)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_sections_collapse_to_defaults() {
        let compact: CompactPolicy =
            serde_json::from_value(json!({ "policy_id": "p-1" })).expect("minimal compact parses");
        compact.validate().expect("defaults are coherent");

        let set = compact.to_coefficients();
        assert_eq!(set.w_fam_cadastro, 0.3);
        assert_eq!(set.w_fam_medicao, 0.5);
        assert_eq!(set.w_fam_inad, 0.2);
        assert_eq!(set.pen_trigger_ratio, 0.6);
        assert_eq!(set.pen_curve, PenaltyCurve::Linear);
        assert_eq!(set.thr_baixo, 40.0);
        assert_eq!(set.none_cut, 0.05);
    }

    #[test]
    fn legacy_weight_aliases_are_accepted() {
        let compact: CompactPolicy = serde_json::from_value(json!({
            "policy_id": "p-2",
            "inadimplencia": { "w_atraso": 0.5, "w_indice": 0.3, "w_valor_aberto": 0.2 }
        }))
        .expect("aliased names parse");
        let set = compact.to_coefficients();
        assert_eq!(set.w_atraso, 0.5);
        assert_eq!(set.w_indice, 0.3);
        assert_eq!(set.w_valor_aberto, 0.2);
    }

    #[test]
    fn within_tolerance_family_weights_are_renormalized() {
        let compact: CompactPolicy = serde_json::from_value(json!({
            "policy_id": "p-3",
            "familias": { "cadastro": 0.3333, "medicao": 0.3333, "inadimplencia": 0.3333 }
        }))
        .expect("rounded weights parse");
        compact.validate().expect("0.9999 is within tolerance");
        let set = compact.to_coefficients();
        assert!((set.w_fam_cadastro - 1.0 / 3.0).abs() < 1e-9);
        assert!((set.w_fam_cadastro + set.w_fam_medicao + set.w_fam_inad - 1.0).abs() < 1e-9);
    }

    #[test]
    fn drifted_inadimplencia_weights_fail_closed() {
        let compact: CompactPolicy = serde_json::from_value(json!({
            "policy_id": "p-6",
            "inadimplencia": { "w_days": 0.9, "w_open_count": 0.3, "w_amount_ratio": 0.2 }
        }))
        .expect("shape parses");
        assert!(matches!(
            compact.validate(),
            Err(PolicyError::WeightTripleDrift {
                family: "inadimplencia",
                ..
            })
        ));
    }

    #[test]
    fn drifted_medicao_weights_fail_closed() {
        let compact: CompactPolicy = serde_json::from_value(json!({
            "policy_id": "p-7",
            "medicao": { "w_idade": 0.8, "w_anomalias": 0.3, "w_desvio": 0.3 }
        }))
        .expect("shape parses");
        assert!(matches!(
            compact.validate(),
            Err(PolicyError::WeightTripleDrift {
                family: "medicao",
                ..
            })
        ));
    }

    #[test]
    fn fully_supplied_family_triple_must_sum_to_one() {
        let compact: CompactPolicy = serde_json::from_value(json!({
            "policy_id": "p-8",
            "familias": { "cadastro": 0.2, "medicao": 0.2, "inadimplencia": 0.2 }
        }))
        .expect("shape parses");
        assert!(matches!(
            compact.validate(),
            Err(PolicyError::WeightTripleDrift {
                family: "familias",
                ..
            })
        ));

        // a partial section is filled from defaults at conversion instead
        let partial: CompactPolicy = serde_json::from_value(json!({
            "policy_id": "p-9",
            "familias": { "medicao": 0.5 }
        }))
        .expect("shape parses");
        partial.validate().expect("partial familias is not checked");
    }

    #[test]
    fn inverted_z_thresholds_fail_closed() {
        let compact: CompactPolicy = serde_json::from_value(json!({
            "policy_id": "p-4",
            "cadastro": { "z_warn": 0.5, "z_risk": 0.2 }
        }))
        .expect("shape parses");
        assert!(matches!(
            compact.validate(),
            Err(PolicyError::InvertedZ { .. })
        ));
    }

    #[test]
    fn blank_policy_id_is_rejected() {
        let compact: CompactPolicy =
            serde_json::from_value(json!({ "policy_id": "  " })).expect("shape parses");
        assert!(matches!(
            compact.validate(),
            Err(PolicyError::MissingPolicyId)
        ));
    }
}
