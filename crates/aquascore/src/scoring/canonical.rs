use std::collections::BTreeMap;
use std::fmt;

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Identifier wrapper for scored accounts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountId(pub Uuid);

impl fmt::Display for AccountId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A scoring period, always normalized to the first day of its month.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Period(NaiveDate);

impl Period {
    pub fn new(date: NaiveDate) -> Self {
        Self(date.with_day(1).unwrap_or(date))
    }

    /// Accepts `YYYY-MM` or `YYYY-MM-DD`; any day collapses to the month start.
    pub fn parse(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            return Some(Self::new(date));
        }
        NaiveDate::parse_from_str(&format!("{trimmed}-01"), "%Y-%m-%d")
            .ok()
            .map(Self::new)
    }

    pub fn date(&self) -> NaiveDate {
        self.0
    }

    pub fn month_key(&self) -> String {
        self.0.format("%Y-%m").to_string()
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d"))
    }
}

/// The three score dimensions an account is judged on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Family {
    Cadastro,
    Medicao,
    Inadimplencia,
}

impl Family {
    pub const ALL: [Family; 3] = [Family::Cadastro, Family::Medicao, Family::Inadimplencia];

    pub const fn label(self) -> &'static str {
        match self {
            Family::Cadastro => "cadastro",
            Family::Medicao => "medicao",
            Family::Inadimplencia => "inadimplencia",
        }
    }
}

/// Closed set of canonical metrics every raw aggregate row is reduced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Feature {
    MeterAgeYears,
    AnomalyRate,
    ConsumptionCv,
    InconsistenciasRate,
    DelinquencyDays,
    OpenInvoicesCount,
    OpenAmountRatio,
}

impl Feature {
    pub const ALL: [Feature; 7] = [
        Feature::MeterAgeYears,
        Feature::AnomalyRate,
        Feature::ConsumptionCv,
        Feature::InconsistenciasRate,
        Feature::DelinquencyDays,
        Feature::OpenInvoicesCount,
        Feature::OpenAmountRatio,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Feature::MeterAgeYears => "meter_age_years",
            Feature::AnomalyRate => "anomaly_rate",
            Feature::ConsumptionCv => "consumption_cv",
            Feature::InconsistenciasRate => "inconsistencias_rate",
            Feature::DelinquencyDays => "delinquency_days",
            Feature::OpenInvoicesCount => "open_invoices_count",
            Feature::OpenAmountRatio => "open_amount_ratio",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Feature::ALL.into_iter().find(|f| f.name() == name)
    }

    pub const fn family(self) -> Family {
        match self {
            Feature::InconsistenciasRate => Family::Cadastro,
            Feature::MeterAgeYears | Feature::AnomalyRate | Feature::ConsumptionCv => {
                Family::Medicao
            }
            Feature::DelinquencyDays
            | Feature::OpenInvoicesCount
            | Feature::OpenAmountRatio => Family::Inadimplencia,
        }
    }

    /// Historical column names that may carry this metric, preferred first.
    pub const fn aliases(self) -> &'static [&'static str] {
        match self {
            Feature::MeterAgeYears => &[
                "meter_age_years",
                "hidrometro_idade_anos",
                "idade_hidrometro",
                "meter_age",
                "hidrometro_age",
            ],
            Feature::AnomalyRate => &[
                "anomaly_rate",
                "anomalias_12m",
                "anomalias_rate",
                "anomaly_ratio",
                "taxa_anomalias",
            ],
            Feature::ConsumptionCv => &[
                "consumption_cv",
                "desvio_padrao_consumo",
                "cv_consumo",
                "consumption_variance",
                "coeficiente_variacao",
            ],
            Feature::InconsistenciasRate => &[
                "inconsistencias_rate",
                "inconsistencias_total",
                "taxa_inconsistencias",
                "inconsistency_rate",
                "regras_aplicadas",
            ],
            Feature::DelinquencyDays => &[
                "delinquency_days",
                "dias_atraso_medio",
                "days_delinquency",
                "atraso_dias",
                "dias_atraso",
            ],
            Feature::OpenInvoicesCount => &[
                "open_invoices_count",
                "faturas_abertas",
                "invoices_open",
                "faturas_em_aberto",
                "open_invoices",
            ],
            Feature::OpenAmountRatio => &[
                "open_amount_ratio",
                "valor_aberto_12m",
                "amount_open_ratio",
                "ratio_valor_aberto",
                "valor_aberto_ratio",
            ],
        }
    }
}

/// One raw account-period row as it comes out of the aggregate store.
///
/// Metric columns arrive with legacy names and numerics sometimes encoded
/// as strings, so everything beyond the identifying columns is kept loose.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawAggregateRow {
    pub account_id: AccountId,
    pub period: Period,
    pub sector: String,
    pub window_months: u32,
    #[serde(flatten)]
    pub columns: BTreeMap<String, Value>,
}

/// One normalized account-period observation. Every metric is either a
/// finite number or `None`; NaN and infinities are filtered at construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub account_id: AccountId,
    pub period: Period,
    pub sector: String,
    pub meter_age_years: Option<f64>,
    pub anomaly_rate: Option<f64>,
    pub consumption_cv: Option<f64>,
    pub inconsistencias_rate: Option<f64>,
    pub delinquency_days: Option<f64>,
    pub open_invoices_count: Option<f64>,
    pub open_amount_ratio: Option<f64>,
}

impl CanonicalRecord {
    pub fn feature(&self, feature: Feature) -> Option<f64> {
        match feature {
            Feature::MeterAgeYears => self.meter_age_years,
            Feature::AnomalyRate => self.anomaly_rate,
            Feature::ConsumptionCv => self.consumption_cv,
            Feature::InconsistenciasRate => self.inconsistencias_rate,
            Feature::DelinquencyDays => self.delinquency_days,
            Feature::OpenInvoicesCount => self.open_invoices_count,
            Feature::OpenAmountRatio => self.open_amount_ratio,
        }
    }
}

/// Maps raw aggregate rows onto [`CanonicalRecord`]s.
///
/// Direct computation runs first (months to years, std/mean fallback for the
/// consumption CV, P95-normalized open amount), then the legacy alias table,
/// and anything still unresolved stays `None`. Missing or zero denominators
/// yield `None`, never an error.
#[derive(Debug, Clone, Default)]
pub struct FeatureNormalizer {
    open_amount_p95: Option<f64>,
}

impl FeatureNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// The P95 of `valor_total_aberto` over the population, used to bound
    /// raw open amounts into a 0..1 ratio when no precomputed index exists.
    pub fn with_open_amount_p95(open_amount_p95: Option<f64>) -> Self {
        Self { open_amount_p95 }
    }

    pub fn normalize(&self, row: &RawAggregateRow) -> CanonicalRecord {
        let meter_age_years = numeric(&row.columns, "idade_hidrometro_meses")
            .map(|months| months / 12.0)
            .or_else(|| alias_lookup(&row.columns, Feature::MeterAgeYears));

        let anomaly_rate = numeric(&row.columns, "taxa_anomalias")
            .or_else(|| alias_lookup(&row.columns, Feature::AnomalyRate));

        let consumption_cv = numeric(&row.columns, "coef_var_consumo")
            .or_else(|| {
                let std = numeric(&row.columns, "std_consumo_m3")?;
                let mean = numeric(&row.columns, "media_consumo_m3")?;
                ratio(std, mean)
            })
            .or_else(|| alias_lookup(&row.columns, Feature::ConsumptionCv));

        // No upstream join feeds this yet; only an alias column can supply it.
        let inconsistencias_rate = alias_lookup(&row.columns, Feature::InconsistenciasRate);

        let delinquency_days = numeric(&row.columns, "media_tempo_atraso")
            .or_else(|| alias_lookup(&row.columns, Feature::DelinquencyDays));

        let open_invoices_count = numeric(&row.columns, "qtd_contas_abertas")
            .or_else(|| alias_lookup(&row.columns, Feature::OpenInvoicesCount));

        let open_amount_ratio = numeric(&row.columns, "indice_inadimplencia")
            .or_else(|| {
                let open = numeric(&row.columns, "valor_total_aberto")?;
                let p95 = self.open_amount_p95.filter(|p| *p > 0.0)?;
                Some((open / p95).clamp(0.0, 1.0))
            })
            .or_else(|| alias_lookup(&row.columns, Feature::OpenAmountRatio));

        CanonicalRecord {
            account_id: row.account_id,
            period: row.period,
            sector: row.sector.clone(),
            meter_age_years,
            anomaly_rate,
            consumption_cv,
            inconsistencias_rate,
            delinquency_days,
            open_invoices_count,
            open_amount_ratio,
        }
    }
}

fn numeric(columns: &BTreeMap<String, Value>, name: &str) -> Option<f64> {
    match columns.get(name)? {
        Value::Number(n) => n.as_f64().filter(|v| v.is_finite()),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|v| v.is_finite()),
        _ => None,
    }
}

fn alias_lookup(columns: &BTreeMap<String, Value>, feature: Feature) -> Option<f64> {
    feature
        .aliases()
        .iter()
        .find_map(|name| numeric(columns, name))
}

/// Nearest-rank P95 over the finite values of one raw column. `None` when
/// the scope carries no finite value for it.
pub fn column_p95(rows: &[RawAggregateRow], column: &str) -> Option<f64> {
    let mut values: Vec<f64> = rows
        .iter()
        .filter_map(|row| numeric(&row.columns, column))
        .collect();
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let rank = ((values.len() as f64) * 0.95).ceil() as usize;
    Some(values[rank.clamp(1, values.len()) - 1])
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    if denominator <= 0.0 {
        return None;
    }
    let value = numerator / denominator;
    value.is_finite().then_some(value)
}

/// Fraction of records carrying a finite value, per feature and per family.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Coverage {
    pub total: usize,
    pub fields: BTreeMap<&'static str, f64>,
    pub families: BTreeMap<&'static str, f64>,
}

pub fn compute_coverage(records: &[CanonicalRecord]) -> Coverage {
    let total = records.len();
    let mut fields = BTreeMap::new();
    let mut families = BTreeMap::new();

    if total == 0 {
        for family in Family::ALL {
            families.insert(family.label(), 0.0);
        }
        return Coverage {
            total,
            fields,
            families,
        };
    }

    for feature in Feature::ALL {
        let present = records
            .iter()
            .filter(|r| r.feature(feature).is_some())
            .count();
        fields.insert(feature.name(), present as f64 / total as f64);
    }

    for family in Family::ALL {
        let members: Vec<f64> = Feature::ALL
            .into_iter()
            .filter(|f| f.family() == family)
            .map(|f| fields[f.name()])
            .collect();
        let mean = members.iter().sum::<f64>() / members.len() as f64;
        families.insert(family.label(), mean);
    }

    Coverage {
        total,
        fields,
        families,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(columns: serde_json::Value) -> RawAggregateRow {
        let map = columns
            .as_object()
            .expect("test columns are an object")
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        RawAggregateRow {
            account_id: AccountId(Uuid::new_v4()),
            period: Period::parse("2025-01").expect("valid period"),
            sector: "S01".to_string(),
            window_months: 12,
            columns: map,
        }
    }

    #[test]
    fn period_parse_accepts_month_and_day_forms() {
        let month = Period::parse("2025-03").expect("month form parses");
        let day = Period::parse("2025-03-17").expect("day form parses");
        assert_eq!(month, day);
        assert_eq!(month.month_key(), "2025-03");
        assert!(Period::parse("março/2025").is_none());
    }

    #[test]
    fn direct_computation_beats_aliases() {
        let normalizer = FeatureNormalizer::new();
        let record = normalizer.normalize(&row(json!({
            "idade_hidrometro_meses": 144,
            "idade_hidrometro": 99.0,
        })));
        assert_eq!(record.meter_age_years, Some(12.0));
    }

    #[test]
    fn string_encoded_numerics_are_parsed() {
        let normalizer = FeatureNormalizer::new();
        let record = normalizer.normalize(&row(json!({
            "taxa_anomalias": "0.07",
            "dias_atraso_medio": " 45 ",
        })));
        assert_eq!(record.anomaly_rate, Some(0.07));
        assert_eq!(record.delinquency_days, Some(45.0));
    }

    #[test]
    fn zero_denominator_yields_none_not_error() {
        let normalizer = FeatureNormalizer::new();
        let record = normalizer.normalize(&row(json!({
            "std_consumo_m3": 4.2,
            "media_consumo_m3": 0.0,
        })));
        assert_eq!(record.consumption_cv, None);
    }

    #[test]
    fn consumption_cv_falls_back_to_std_over_mean() {
        let normalizer = FeatureNormalizer::new();
        let record = normalizer.normalize(&row(json!({
            "std_consumo_m3": 3.0,
            "media_consumo_m3": 12.0,
        })));
        assert_eq!(record.consumption_cv, Some(0.25));
    }

    #[test]
    fn open_amount_normalized_by_p95_and_clamped() {
        let normalizer = FeatureNormalizer::with_open_amount_p95(Some(1000.0));
        let record = normalizer.normalize(&row(json!({ "valor_total_aberto": 2500.0 })));
        assert_eq!(record.open_amount_ratio, Some(1.0));

        let record = normalizer.normalize(&row(json!({ "valor_total_aberto": 250.0 })));
        assert_eq!(record.open_amount_ratio, Some(0.25));
    }

    #[test]
    fn precomputed_index_wins_over_p95_ratio() {
        let normalizer = FeatureNormalizer::with_open_amount_p95(Some(1000.0));
        let record = normalizer.normalize(&row(json!({
            "indice_inadimplencia": 0.4,
            "valor_total_aberto": 2500.0,
        })));
        assert_eq!(record.open_amount_ratio, Some(0.4));
    }

    #[test]
    fn alias_table_first_present_wins() {
        let normalizer = FeatureNormalizer::new();
        let record = normalizer.normalize(&row(json!({
            "faturas_em_aberto": 5,
            "open_invoices": 9,
        })));
        // faturas_em_aberto precedes open_invoices in the alias order
        assert_eq!(record.open_invoices_count, Some(5.0));
    }

    #[test]
    fn missing_columns_stay_none() {
        let normalizer = FeatureNormalizer::new();
        let record = normalizer.normalize(&row(json!({})));
        for feature in Feature::ALL {
            assert_eq!(record.feature(feature), None, "{}", feature.name());
        }
    }

    #[test]
    fn p95_uses_nearest_rank_and_skips_junk() {
        let rows: Vec<RawAggregateRow> = (1..=20)
            .map(|i| row(json!({ "valor_total_aberto": (i * 100) as f64 })))
            .chain([row(json!({ "valor_total_aberto": "not a number" }))])
            .collect();
        assert_eq!(column_p95(&rows, "valor_total_aberto"), Some(1900.0));
        assert_eq!(column_p95(&rows, "missing_column"), None);
        assert_eq!(column_p95(&[], "valor_total_aberto"), None);
    }

    #[test]
    fn coverage_over_empty_population_is_zero() {
        let coverage = compute_coverage(&[]);
        assert_eq!(coverage.total, 0);
        assert_eq!(coverage.families["medicao"], 0.0);
    }

    #[test]
    fn coverage_tracks_presence_per_family() {
        let normalizer = FeatureNormalizer::new();
        let records: Vec<CanonicalRecord> = [
            json!({ "idade_hidrometro_meses": 60, "taxa_anomalias": 0.1, "coef_var_consumo": 0.2 }),
            json!({ "idade_hidrometro_meses": 120 }),
        ]
        .into_iter()
        .map(|cols| normalizer.normalize(&row(cols)))
        .collect();

        let coverage = compute_coverage(&records);
        assert_eq!(coverage.fields["meter_age_years"], 1.0);
        assert_eq!(coverage.fields["anomaly_rate"], 0.5);
        assert_eq!(coverage.families["cadastro"], 0.0);
        assert!((coverage.families["medicao"] - 2.0 / 3.0).abs() < 1e-9);
    }
}
