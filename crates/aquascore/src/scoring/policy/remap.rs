//! Shape detection for calibration responses. The upstream model is held
//! to a strict schema but has been observed drifting; a handful of known
//! alternates are remapped before the cycle is declared failed.

use serde_json::{json, Value};
use tracing::debug;

use super::{CompactPolicy, Policy, PolicyError};

/// A validated policy in whichever of the two supported shapes the
/// calibration produced. Selected once at ingestion; scoring never
/// branches on the raw JSON again.
#[derive(Debug, Clone, PartialEq)]
pub enum CalibratedPolicy {
    Rich(Policy),
    Compact(CompactPolicy),
}

impl CalibratedPolicy {
    pub fn policy_id(&self) -> &str {
        match self {
            CalibratedPolicy::Rich(policy) => &policy.policy_id,
            CalibratedPolicy::Compact(compact) => &compact.policy_id,
        }
    }

    /// Days this policy stays usable. The compact shape carries no meta
    /// block, so it inherits the rich default of one year.
    pub fn validity_days(&self) -> f64 {
        match self {
            CalibratedPolicy::Rich(policy) => policy.meta.validity_days,
            CalibratedPolicy::Compact(_) => 365.0,
        }
    }
}

/// Parses and validates a calibration response, trying the rich shape,
/// then the compact shape, then the known alternates. Validation failures
/// on a recognized shape are fatal; no best-guess policy ever leaks out.
pub fn policy_from_calibration(raw: &Value) -> Result<CalibratedPolicy, PolicyError> {
    if raw.get("mappings").is_some() {
        let policy: Policy =
            serde_json::from_value(raw.clone()).map_err(PolicyError::UnrecognizedShape)?;
        policy.validate()?;
        return Ok(CalibratedPolicy::Rich(policy));
    }

    if looks_compact(raw) {
        debug!("calibration response uses the compact shape");
        let compact: CompactPolicy =
            serde_json::from_value(raw.clone()).map_err(PolicyError::UnrecognizedShape)?;
        compact.validate()?;
        return Ok(CalibratedPolicy::Compact(compact));
    }

    if raw.get("rules").is_some() {
        debug!("remapping alternate calibration shape with 'rules'");
        let remapped = remap_rules_shape(raw);
        let policy: Policy =
            serde_json::from_value(remapped).map_err(PolicyError::UnrecognizedShape)?;
        policy.validate()?;
        return Ok(CalibratedPolicy::Rich(policy));
    }

    Err(PolicyError::UnrecognizedShape(
        <serde_json::Error as serde::de::Error>::custom(
            "expected 'mappings', 'rules', or a compact parameter object",
        ),
    ))
}

fn looks_compact(raw: &Value) -> bool {
    raw.get("familias").is_some()
        || raw.get("potencial").is_some()
        || (raw.get("classificacao").is_some() && raw.get("rules").is_none())
}

/// Rebuilds the strict rich shape from the drift variant that nests rules
/// under `rules`, the penalty under `penalidade`, and the classification
/// thresholds under `classificacao.thresholds`.
fn remap_rules_shape(raw: &Value) -> Value {
    let rules = &raw["rules"];
    let fallback_weights = json!({ "cadastro": 0.33, "medicao": 0.33, "inadimplencia": 0.34 });

    let penalties = raw.get("penalidade").map(|pen| {
        json!({
            "inadimplencia_score_penalty": {
                "trigger_feature": pen.get("trigger_feature").cloned().unwrap_or(Value::Null),
                "trigger_threshold": pen.get("trigger_threshold").cloned().unwrap_or(Value::Null),
                "curve": pen.get("curve").cloned().unwrap_or(Value::Null),
                "max_penalty": pen.get("max_penalty").cloned().unwrap_or(Value::Null),
            }
        })
    });

    let thresholds = raw
        .get("classificacao")
        .and_then(|c| c.get("thresholds"))
        .cloned()
        .unwrap_or(json!({}));
    let none_below = raw
        .get("classificacao")
        .and_then(|c| c.get("nenhum_if_all_potentials_below"))
        .cloned()
        .unwrap_or(json!(0.2));

    let mut out = json!({
        "policy_id": raw.get("policy_id").cloned().unwrap_or_else(|| {
            let periodo = raw.get("periodo").and_then(Value::as_str).unwrap_or("unknown");
            json!(format!("policy_{periodo}"))
        }),
        "periodo": raw.get("periodo").cloned().unwrap_or(json!("unknown")),
        "weights": raw.get("weights").cloned().unwrap_or(fallback_weights),
        "mappings": {
            "cadastro": rules.get("cadastro").cloned().unwrap_or(json!([])),
            "medicao": rules.get("medicao").cloned().unwrap_or(json!([])),
            "inadimplencia": rules.get("inadimplencia").cloned().unwrap_or(json!([])),
        },
        "classification": {
            "score_thresholds": {
                "baixo": thresholds.get("baixo").cloned().unwrap_or(json!(40.0)),
                "medio": thresholds.get("medio").cloned().unwrap_or(json!(70.0)),
                "alto": thresholds.get("alto").cloned().unwrap_or(json!(100.0)),
            },
            "nenhum_if_all_potentials_below": none_below,
        },
        "templates": raw.get("templates").cloned().unwrap_or(json!({
            "motivo": {},
            "acao_sugerida": {},
            "justificativa_curta": {},
        })),
        "meta": {
            "validity_days": raw
                .get("meta")
                .and_then(|m| m.get("validity_days"))
                .cloned()
                .unwrap_or(json!(365.0)),
        },
    });

    if let Some(penalties) = penalties {
        out["penalties"] = penalties;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::super::{test_policy, PenaltyCurve, TemplateKey};
    use super::*;

    fn template_sections() -> Value {
        let section: serde_json::Map<String, Value> = TemplateKey::ALL
            .into_iter()
            .map(|key| {
                (
                    serde_json::to_value(key)
                        .expect("key serializes")
                        .as_str()
                        .expect("key is a string")
                        .to_string(),
                    json!("texto"),
                )
            })
            .collect();
        json!({
            "motivo": section.clone(),
            "acao_sugerida": section.clone(),
            "justificativa_curta": section,
        })
    }

    #[test]
    fn strict_rich_shape_parses_directly() {
        let raw = serde_json::to_value(test_policy()).expect("policy serializes");
        let parsed = policy_from_calibration(&raw).expect("rich shape accepted");
        assert!(matches!(parsed, CalibratedPolicy::Rich(_)));
        assert_eq!(parsed.policy_id(), "policy_test");
        assert_eq!(parsed.validity_days(), 30.0);
    }

    #[test]
    fn rich_shape_with_invalid_rules_fails_closed() {
        let mut policy = test_policy();
        policy.mappings.medicao[0].values[0] = 7.0;
        let raw = serde_json::to_value(policy).expect("policy serializes");
        assert!(matches!(
            policy_from_calibration(&raw),
            Err(PolicyError::ValueOutOfRange { .. })
        ));
    }

    #[test]
    fn compact_shape_is_detected() {
        let raw = json!({
            "policy_id": "p-compact",
            "familias": { "cadastro": 0.3, "medicao": 0.5, "inadimplencia": 0.2 },
            "inadimplencia": { "w_days": 0.34, "w_open_count": 0.33, "w_amount_ratio": 0.33 },
        });
        let parsed = policy_from_calibration(&raw).expect("compact shape accepted");
        match parsed {
            CalibratedPolicy::Compact(compact) => {
                assert_eq!(compact.to_coefficients().w_atraso, 0.34);
            }
            other => panic!("expected compact policy, got {other:?}"),
        }
    }

    #[test]
    fn compact_shape_with_drifted_weights_fails_closed() {
        let raw = json!({
            "policy_id": "p-drift",
            "familias": { "cadastro": 0.3, "medicao": 0.5, "inadimplencia": 0.2 },
            "inadimplencia": { "w_days": 0.9, "w_open_count": 0.3, "w_amount_ratio": 0.2 },
        });
        assert!(matches!(
            policy_from_calibration(&raw),
            Err(PolicyError::WeightTripleDrift {
                family: "inadimplencia",
                ..
            })
        ));
    }

    #[test]
    fn rules_alternate_is_remapped() {
        let raw = json!({
            "periodo": "2025-01-01",
            "weights": { "cadastro": 0.3, "medicao": 0.5, "inadimplencia": 0.2 },
            "rules": {
                "cadastro": [],
                "medicao": [{
                    "feature": "meter_age_years",
                    "breaks": [5.0, 10.0, 15.0],
                    "values": [0.1, 0.4, 0.7, 0.9],
                    "higher_is_risk": true,
                }],
                "inadimplencia": [],
            },
            "penalidade": {
                "trigger_feature": "open_amount_ratio",
                "trigger_threshold": 0.6,
                "curve": "log",
                "max_penalty": 0.1,
            },
            "classificacao": {
                "thresholds": { "baixo": 35.0, "medio": 65.0, "alto": 100.0 },
                "nenhum_if_all_potentials_below": 0.1,
            },
            "templates": template_sections(),
        });

        let parsed = policy_from_calibration(&raw).expect("alternate shape remapped");
        match parsed {
            CalibratedPolicy::Rich(policy) => {
                assert_eq!(policy.policy_id, "policy_2025-01-01");
                assert_eq!(policy.mappings.medicao.len(), 1);
                assert_eq!(policy.classification.score_thresholds.baixo, 35.0);
                let penalty = policy
                    .penalties
                    .expect("penalidade carried over")
                    .inadimplencia_score_penalty;
                assert_eq!(penalty.curve, PenaltyCurve::Log);
                assert_eq!(policy.meta.validity_days, 365.0);
            }
            other => panic!("expected rich policy, got {other:?}"),
        }
    }

    #[test]
    fn alternate_without_templates_still_fails_validation() {
        let raw = json!({
            "periodo": "2025-01-01",
            "rules": { "cadastro": [], "medicao": [], "inadimplencia": [] },
        });
        assert!(matches!(
            policy_from_calibration(&raw),
            Err(PolicyError::MissingTemplate { .. })
        ));
    }

    #[test]
    fn unknown_shape_is_rejected() {
        let raw = json!({ "foo": "bar" });
        assert!(matches!(
            policy_from_calibration(&raw),
            Err(PolicyError::UnrecognizedShape(_))
        ));
    }
}
