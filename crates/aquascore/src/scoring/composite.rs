use super::canonical::CanonicalRecord;
use super::policy::{FamilyWeights, PenaltyCurve, PenaltySpec};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

/// Brings a weight triple back to sum 1. Drift beyond the tolerance is
/// divided out; a zero or non-finite sum falls back to equal thirds.
pub fn normalize_weights(weights: &FamilyWeights) -> FamilyWeights {
    let sum = weights.cadastro + weights.medicao + weights.inadimplencia;
    if !sum.is_finite() || sum <= 0.0 {
        return FamilyWeights::equal_thirds();
    }
    if (sum - 1.0).abs() <= WEIGHT_SUM_TOLERANCE {
        return *weights;
    }
    FamilyWeights {
        cadastro: weights.cadastro / sum,
        medicao: weights.medicao / sum,
        inadimplencia: weights.inadimplencia / sum,
    }
}

/// Penalty subtracted from the 0..1 base score once the trigger feature
/// crosses its threshold. The overshoot ratio `(v - thr) / thr` is clamped
/// to [0,1], shaped by the curve, and scaled by `max_penalty`.
pub fn penalty_amount(spec: &PenaltySpec, record: &CanonicalRecord) -> f64 {
    let Some(value) = record.feature(spec.trigger_feature).filter(|v| v.is_finite()) else {
        return 0.0;
    };
    if spec.trigger_threshold <= 0.0 || value <= spec.trigger_threshold {
        return 0.0;
    }

    let overshoot = ((value - spec.trigger_threshold) / spec.trigger_threshold).clamp(0.0, 1.0);
    let factor = match spec.curve {
        PenaltyCurve::Linear => overshoot,
        PenaltyCurve::Log => (1.0 + overshoot).ln() / 2.0_f64.ln(),
    };
    let amount = factor * spec.max_penalty;
    if amount.is_finite() {
        amount.max(0.0)
    } else {
        0.0
    }
}

/// Weighted sum of family values, penalty applied, scaled to 0..100.
/// Every input is coerced away from NaN before it can leak into the result.
pub fn composite_score(
    weights: &FamilyWeights,
    cadastro: f64,
    medicao: f64,
    inadimplencia: f64,
    record: &CanonicalRecord,
    penalty: Option<&PenaltySpec>,
) -> f64 {
    let weights = normalize_weights(weights);
    let finite = |v: f64| if v.is_finite() { v } else { 0.0 };

    let mut score01 = weights.cadastro * finite(cadastro)
        + weights.medicao * finite(medicao)
        + weights.inadimplencia * finite(inadimplencia);

    if let Some(spec) = penalty {
        score01 -= penalty_amount(spec, record);
    }

    (score01 * 100.0).clamp(0.0, 100.0)
}

pub fn round2(value: f64) -> f64 {
    if !value.is_finite() {
        return 0.0;
    }
    (value * 100.0).round() / 100.0
}
