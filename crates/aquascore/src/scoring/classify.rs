use serde::{Deserialize, Serialize};

use super::policy::{ScoreThresholds, TemplateKey};

/// Discrete recovery-potential tier attached to every scored row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PotentialTier {
    Nenhum,
    Baixo,
    Medio,
    Alto,
}

impl PotentialTier {
    pub const fn label(self) -> &'static str {
        match self {
            PotentialTier::Nenhum => "NENHUM",
            PotentialTier::Baixo => "BAIXO",
            PotentialTier::Medio => "MEDIO",
            PotentialTier::Alto => "ALTO",
        }
    }
}

/// Maps a 0..100 composite score to a tier. When every family value sits
/// below the no-signal cutoff the tier is NENHUM no matter the score; a
/// family with no usable signal must not read as a real potential.
pub fn classify(
    score: f64,
    thresholds: &ScoreThresholds,
    none_cut: f64,
    cadastro: f64,
    medicao: f64,
    inadimplencia: f64,
) -> PotentialTier {
    let all_below = cadastro < none_cut && medicao < none_cut && inadimplencia < none_cut;
    if all_below {
        return PotentialTier::Nenhum;
    }
    if score < thresholds.baixo {
        PotentialTier::Baixo
    } else if score < thresholds.medio {
        PotentialTier::Medio
    } else {
        PotentialTier::Alto
    }
}

/// Fixed, priority-ordered template selection: degraded data first, then
/// the inadimplência signal, then whichever of cadastro/medição dominates
/// by more than 0.1, else the balanced narrative.
pub fn pick_template_key(
    cadastro: f64,
    medicao: f64,
    inadimplencia: f64,
    any_missing: bool,
) -> TemplateKey {
    if any_missing {
        return TemplateKey::DadosInsuficientes;
    }
    if inadimplencia < 0.3 {
        return TemplateKey::InadAlta;
    }
    if medicao > cadastro && medicao - cadastro > 0.1 {
        return TemplateKey::MedicaoDominante;
    }
    if cadastro > medicao && cadastro - medicao > 0.1 {
        return TemplateKey::CadastroDominante;
    }
    TemplateKey::Balanceado
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLDS: ScoreThresholds = ScoreThresholds {
        baixo: 40.0,
        medio: 70.0,
        alto: 100.0,
    };

    #[test]
    fn tiers_follow_thresholds() {
        assert_eq!(
            classify(10.0, &THRESHOLDS, 0.05, 0.2, 0.2, 0.2),
            PotentialTier::Baixo
        );
        assert_eq!(
            classify(40.0, &THRESHOLDS, 0.05, 0.2, 0.2, 0.2),
            PotentialTier::Medio
        );
        assert_eq!(
            classify(85.0, &THRESHOLDS, 0.05, 0.2, 0.2, 0.2),
            PotentialTier::Alto
        );
    }

    #[test]
    fn no_signal_overrides_even_high_scores() {
        assert_eq!(
            classify(95.0, &THRESHOLDS, 0.05, 0.01, 0.02, 0.04),
            PotentialTier::Nenhum
        );
    }

    #[test]
    fn one_family_at_cutoff_escapes_the_override() {
        assert_eq!(
            classify(95.0, &THRESHOLDS, 0.05, 0.05, 0.02, 0.04),
            PotentialTier::Alto
        );
    }

    #[test]
    fn missing_data_wins_over_every_other_template() {
        assert_eq!(
            pick_template_key(0.9, 0.1, 0.1, true),
            TemplateKey::DadosInsuficientes
        );
    }

    #[test]
    fn low_inad_value_selects_inad_alta() {
        assert_eq!(pick_template_key(0.9, 0.1, 0.2, false), TemplateKey::InadAlta);
    }

    #[test]
    fn dominance_requires_a_clear_margin() {
        assert_eq!(
            pick_template_key(0.2, 0.6, 0.5, false),
            TemplateKey::MedicaoDominante
        );
        assert_eq!(
            pick_template_key(0.6, 0.2, 0.5, false),
            TemplateKey::CadastroDominante
        );
        // 0.1 apart exactly is not dominant
        assert_eq!(
            pick_template_key(0.5, 0.6, 0.5, false),
            TemplateKey::Balanceado
        );
    }
}
