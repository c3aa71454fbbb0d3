//! Hierarchical, versioned coefficient resolution.
//!
//! A coefficient is a single named scalar scoped to a sector or a group,
//! keyed by period month and trailing window length. At the persistence
//! boundary the key is flattened into the legacy string convention
//! `[sector__]key::YYYY-MM::Wm`; everywhere else it is structured.
//! Resolution precedence per key: sector, then the sector's group, then a
//! hard-coded default.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::scoring::canonical::Period;
use crate::scoring::policy::{
    CompactCadastro, CompactClassificacao, CompactInadimplencia, CompactMedicao, CompactPotencial,
    PenaltyCurve,
};
use crate::store::{ParameterRepository, SectorGroupRepository, StoreError};

const WEIGHT_SUM_TOLERANCE: f64 = 1e-3;

#[derive(Debug, Error)]
pub enum ParamsError {
    #[error("escopo must be 'setor' or 'grupo', got '{0}'")]
    InvalidScope(String),
    #[error("grupo escopo requires a valid UUID id, got '{0}'")]
    GroupIdNotUuid(String),
    #[error("setor escopo requires a non-UUID id, got '{0}'")]
    SectorIdIsUuid(String),
    #[error("periodo must be YYYY-MM or YYYY-MM-DD, got '{0}'")]
    InvalidPeriod(String),
    #[error("janela_meses must be a positive number of months, got {0}")]
    InvalidWindow(i64),
    #[error("{family} weights must sum to 1, got {sum}")]
    WeightSum { family: &'static str, sum: f64 },
    #[error("cadastro.z_warn and cadastro.z_risk are required, with z_warn < z_risk")]
    BadZThresholds,
    #[error("potencial.pot_min and potencial.pot_max are required, with pot_min <= pot_max")]
    BadPotentialBounds,
    #[error("classification thresholds must satisfy baixo < medio <= alto")]
    BadClassThresholds,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Closed set of coefficient names the resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoefficientKey {
    WAtraso,
    WIndice,
    WValorAberto,
    WIdade,
    WAnomalias,
    WDesvio,
    ZWarn,
    ZRisk,
    PotMin,
    PotMax,
    WFamCadastro,
    WFamMedicao,
    WFamInad,
    PenTriggerRatio,
    PenMax,
    PenCurve,
    ThrBaixo,
    ThrMedio,
    ThrAlto,
    NoneCut,
    FatorNormalizacao,
}

impl CoefficientKey {
    pub const ALL: [CoefficientKey; 21] = [
        CoefficientKey::WAtraso,
        CoefficientKey::WIndice,
        CoefficientKey::WValorAberto,
        CoefficientKey::WIdade,
        CoefficientKey::WAnomalias,
        CoefficientKey::WDesvio,
        CoefficientKey::ZWarn,
        CoefficientKey::ZRisk,
        CoefficientKey::PotMin,
        CoefficientKey::PotMax,
        CoefficientKey::WFamCadastro,
        CoefficientKey::WFamMedicao,
        CoefficientKey::WFamInad,
        CoefficientKey::PenTriggerRatio,
        CoefficientKey::PenMax,
        CoefficientKey::PenCurve,
        CoefficientKey::ThrBaixo,
        CoefficientKey::ThrMedio,
        CoefficientKey::ThrAlto,
        CoefficientKey::NoneCut,
        CoefficientKey::FatorNormalizacao,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            CoefficientKey::WAtraso => "w_atraso",
            CoefficientKey::WIndice => "w_indice",
            CoefficientKey::WValorAberto => "w_valor_aberto",
            CoefficientKey::WIdade => "w_idade",
            CoefficientKey::WAnomalias => "w_anomalias",
            CoefficientKey::WDesvio => "w_desvio",
            CoefficientKey::ZWarn => "z_warn",
            CoefficientKey::ZRisk => "z_risk",
            CoefficientKey::PotMin => "pot_min",
            CoefficientKey::PotMax => "pot_max",
            CoefficientKey::WFamCadastro => "w_fam_cadastro",
            CoefficientKey::WFamMedicao => "w_fam_medicao",
            CoefficientKey::WFamInad => "w_fam_inad",
            CoefficientKey::PenTriggerRatio => "pen_trigger_ratio",
            CoefficientKey::PenMax => "pen_max",
            CoefficientKey::PenCurve => "pen_curve",
            CoefficientKey::ThrBaixo => "thr_baixo",
            CoefficientKey::ThrMedio => "thr_medio",
            CoefficientKey::ThrAlto => "thr_alto",
            CoefficientKey::NoneCut => "none_cut",
            CoefficientKey::FatorNormalizacao => "fator_normalizacao",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|key| key.as_str() == raw)
    }
}

/// One persisted coefficient row, already flattened to the string name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredParameter {
    pub name: String,
    pub value_num: Option<f64>,
    pub value_text: Option<String>,
    pub active: bool,
}

/// Structured form of a persisted coefficient name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedName {
    pub sector: Option<String>,
    pub key: CoefficientKey,
    pub month: String,
    pub window_months: u32,
}

impl DecodedName {
    /// Strict parse of `[sector__]key::YYYY-MM::Wm`. Anything that does
    /// not match exactly is rejected; a window of 6 never matches a
    /// stored window of 12 for the same month.
    pub fn parse(name: &str) -> Option<Self> {
        let mut parts = name.split("::");
        let head = parts.next()?;
        let month = parts.next()?;
        let window = parts.next()?;
        if parts.next().is_some() {
            return None;
        }

        NaiveDate::parse_from_str(&format!("{month}-01"), "%Y-%m-%d").ok()?;
        let window_months = window.strip_suffix('m')?.parse::<u32>().ok()?;

        let (sector, key_str) = match head.split_once("__") {
            Some((sector, key)) if !sector.is_empty() => (Some(sector.to_string()), key),
            Some(_) => return None,
            None => (None, head),
        };
        let key = CoefficientKey::parse(key_str)?;

        Some(Self {
            sector,
            key,
            month: month.to_string(),
            window_months,
        })
    }
}

pub fn encode_name(
    sector: Option<&str>,
    key: CoefficientKey,
    month: &str,
    window_months: u32,
) -> String {
    match sector {
        Some(sector) => format!("{sector}__{}::{month}::{window_months}m", key.as_str()),
        None => format!("{}::{month}::{window_months}m", key.as_str()),
    }
}

/// The full scalar coefficient bundle both scoring paths consume.
/// Defaults mirror the documented safety values of the compact adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoefficientSet {
    pub w_atraso: f64,
    pub w_indice: f64,
    pub w_valor_aberto: f64,
    pub w_idade: f64,
    pub w_anomalias: f64,
    pub w_desvio: f64,
    pub z_warn: f64,
    pub z_risk: f64,
    pub pot_min: f64,
    pub pot_max: f64,
    pub w_fam_cadastro: f64,
    pub w_fam_medicao: f64,
    pub w_fam_inad: f64,
    pub pen_trigger_ratio: f64,
    pub pen_max: f64,
    pub pen_curve: PenaltyCurve,
    pub thr_baixo: f64,
    pub thr_medio: f64,
    pub thr_alto: f64,
    pub none_cut: f64,
    pub fator_normalizacao: f64,
}

impl Default for CoefficientSet {
    fn default() -> Self {
        Self {
            w_atraso: 0.34,
            w_indice: 0.33,
            w_valor_aberto: 0.33,
            w_idade: 0.4,
            w_anomalias: 0.3,
            w_desvio: 0.3,
            z_warn: 0.10,
            z_risk: 0.30,
            pot_min: 0.0,
            pot_max: 1.0,
            w_fam_cadastro: 0.3,
            w_fam_medicao: 0.5,
            w_fam_inad: 0.2,
            pen_trigger_ratio: 0.6,
            pen_max: 0.1,
            pen_curve: PenaltyCurve::Linear,
            thr_baixo: 40.0,
            thr_medio: 70.0,
            thr_alto: 100.0,
            none_cut: 0.05,
            fator_normalizacao: 10.0,
        }
    }
}

impl CoefficientSet {
    /// Overrides one field from a stored row. Unknown curves and absent
    /// numeric values leave the current value in place.
    pub fn apply(&mut self, key: CoefficientKey, row: &StoredParameter) {
        if key == CoefficientKey::PenCurve {
            match row.value_text.as_deref() {
                Some("linear") => self.pen_curve = PenaltyCurve::Linear,
                Some("log") => self.pen_curve = PenaltyCurve::Log,
                other => warn!(value = ?other, "ignoring unknown pen_curve value"),
            }
            return;
        }

        let Some(value) = row.value_num.filter(|v| v.is_finite()) else {
            return;
        };
        match key {
            CoefficientKey::WAtraso => self.w_atraso = value,
            CoefficientKey::WIndice => self.w_indice = value,
            CoefficientKey::WValorAberto => self.w_valor_aberto = value,
            CoefficientKey::WIdade => self.w_idade = value,
            CoefficientKey::WAnomalias => self.w_anomalias = value,
            CoefficientKey::WDesvio => self.w_desvio = value,
            CoefficientKey::ZWarn => self.z_warn = value,
            CoefficientKey::ZRisk => self.z_risk = value,
            CoefficientKey::PotMin => self.pot_min = value,
            CoefficientKey::PotMax => self.pot_max = value,
            CoefficientKey::WFamCadastro => self.w_fam_cadastro = value,
            CoefficientKey::WFamMedicao => self.w_fam_medicao = value,
            CoefficientKey::WFamInad => self.w_fam_inad = value,
            CoefficientKey::PenTriggerRatio => self.pen_trigger_ratio = value,
            CoefficientKey::PenMax => self.pen_max = value,
            CoefficientKey::PenCurve => unreachable!("handled above"),
            CoefficientKey::ThrBaixo => self.thr_baixo = value,
            CoefficientKey::ThrMedio => self.thr_medio = value,
            CoefficientKey::ThrAlto => self.thr_alto = value,
            CoefficientKey::NoneCut => self.none_cut = value,
            CoefficientKey::FatorNormalizacao => self.fator_normalizacao = value,
        }
    }

    fn numeric(&self, key: CoefficientKey) -> Option<f64> {
        match key {
            CoefficientKey::WAtraso => Some(self.w_atraso),
            CoefficientKey::WIndice => Some(self.w_indice),
            CoefficientKey::WValorAberto => Some(self.w_valor_aberto),
            CoefficientKey::WIdade => Some(self.w_idade),
            CoefficientKey::WAnomalias => Some(self.w_anomalias),
            CoefficientKey::WDesvio => Some(self.w_desvio),
            CoefficientKey::ZWarn => Some(self.z_warn),
            CoefficientKey::ZRisk => Some(self.z_risk),
            CoefficientKey::PotMin => Some(self.pot_min),
            CoefficientKey::PotMax => Some(self.pot_max),
            CoefficientKey::WFamCadastro => Some(self.w_fam_cadastro),
            CoefficientKey::WFamMedicao => Some(self.w_fam_medicao),
            CoefficientKey::WFamInad => Some(self.w_fam_inad),
            CoefficientKey::PenTriggerRatio => Some(self.pen_trigger_ratio),
            CoefficientKey::PenMax => Some(self.pen_max),
            CoefficientKey::PenCurve => None,
            CoefficientKey::ThrBaixo => Some(self.thr_baixo),
            CoefficientKey::ThrMedio => Some(self.thr_medio),
            CoefficientKey::ThrAlto => Some(self.thr_alto),
            CoefficientKey::NoneCut => Some(self.none_cut),
            CoefficientKey::FatorNormalizacao => Some(self.fator_normalizacao),
        }
    }

    /// Flattens the full set into persisted rows for one scope.
    pub fn to_rows(&self, sector: Option<&str>, month: &str, window_months: u32) -> Vec<StoredParameter> {
        CoefficientKey::ALL
            .into_iter()
            .map(|key| {
                let (value_num, value_text) = if key == CoefficientKey::PenCurve {
                    let curve = match self.pen_curve {
                        PenaltyCurve::Linear => "linear",
                        PenaltyCurve::Log => "log",
                    };
                    (None, Some(curve.to_string()))
                } else {
                    (self.numeric(key), None)
                };
                StoredParameter {
                    name: encode_name(sector, key, month, window_months),
                    value_num,
                    value_text,
                    active: true,
                }
            })
            .collect()
    }

    /// Final coherence check before the set is persisted or scored with.
    pub fn validate(&self) -> Result<(), ParamsError> {
        let inad = self.w_atraso + self.w_indice + self.w_valor_aberto;
        if (inad - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ParamsError::WeightSum {
                family: "inadimplencia",
                sum: inad,
            });
        }
        let med = self.w_idade + self.w_anomalias + self.w_desvio;
        if (med - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(ParamsError::WeightSum {
                family: "medicao",
                sum: med,
            });
        }
        if !(self.z_warn < self.z_risk) {
            return Err(ParamsError::BadZThresholds);
        }
        if !(self.pot_min <= self.pot_max) {
            return Err(ParamsError::BadPotentialBounds);
        }
        if !(self.thr_baixo < self.thr_medio && self.thr_medio <= self.thr_alto) {
            return Err(ParamsError::BadClassThresholds);
        }
        Ok(())
    }
}

/// Merges stored coefficients over the defaults, per key. A sector value
/// beats a group value, a group value beats the default, and a partial
/// set at any level falls through key by key.
#[derive(Clone)]
pub struct ParameterResolver {
    params: Arc<dyn ParameterRepository>,
    groups: Arc<dyn SectorGroupRepository>,
}

impl ParameterResolver {
    pub fn new(
        params: Arc<dyn ParameterRepository>,
        groups: Arc<dyn SectorGroupRepository>,
    ) -> Self {
        Self { params, groups }
    }

    pub fn resolve(
        &self,
        sector: Option<&str>,
        period: Period,
        window_months: u32,
    ) -> Result<CoefficientSet, StoreError> {
        let month = period.month_key();
        let mut set = CoefficientSet::default();

        let Some(sector) = sector else {
            return Ok(set);
        };

        if let Some(group_id) = self.groups.group_for_sector(sector)? {
            for row in self.params.group_params(group_id, &month, window_months)? {
                apply_row(&mut set, &row, None, &month, window_months);
            }
        }
        for row in self.params.sector_params(sector, &month, window_months)? {
            apply_row(&mut set, &row, Some(sector), &month, window_months);
        }

        Ok(set)
    }

    pub fn resolve_group(
        &self,
        group_id: Uuid,
        period: Period,
        window_months: u32,
    ) -> Result<CoefficientSet, StoreError> {
        let month = period.month_key();
        let mut set = CoefficientSet::default();
        for row in self.params.group_params(group_id, &month, window_months)? {
            apply_row(&mut set, &row, None, &month, window_months);
        }
        Ok(set)
    }
}

fn apply_row(
    set: &mut CoefficientSet,
    row: &StoredParameter,
    sector: Option<&str>,
    month: &str,
    window_months: u32,
) {
    if !row.active {
        return;
    }
    let Some(decoded) = DecodedName::parse(&row.name) else {
        warn!(name = %row.name, "skipping undecodable parameter name");
        return;
    };
    // Repositories filter by suffix already; re-check so a lax adapter can
    // never smuggle a neighboring month or window in.
    if decoded.month != month
        || decoded.window_months != window_months
        || decoded.sector.as_deref() != sector
    {
        return;
    }
    set.apply(decoded.key, row);
}

/// Scope discriminator for manual coefficient reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParamScopeKind {
    Setor,
    Grupo,
}

/// Validates a scope/id pair. The returned UUID is `Some` exactly when
/// the scope is `grupo`.
fn parse_scope(escopo: &str, id: &str) -> Result<(ParamScopeKind, Option<Uuid>), ParamsError> {
    let scope = match escopo {
        "setor" => ParamScopeKind::Setor,
        "grupo" => ParamScopeKind::Grupo,
        other => return Err(ParamsError::InvalidScope(other.to_string())),
    };
    match (scope, Uuid::parse_str(id).ok()) {
        (ParamScopeKind::Grupo, Some(group_id)) => Ok((scope, Some(group_id))),
        (ParamScopeKind::Grupo, None) => Err(ParamsError::GroupIdNotUuid(id.to_string())),
        (ParamScopeKind::Setor, Some(_)) => Err(ParamsError::SectorIdIsUuid(id.to_string())),
        (ParamScopeKind::Setor, None) => Ok((scope, None)),
    }
}

/// Manual coefficient persistence, bypassing calibration.
#[derive(Debug, Clone, Deserialize)]
pub struct SaveParamsRequest {
    pub escopo: String,
    pub id: String,
    pub periodo: String,
    pub janela_meses: i64,
    #[serde(default)]
    pub inadimplencia: CompactInadimplencia,
    #[serde(default)]
    pub medicao: CompactMedicao,
    #[serde(default)]
    pub cadastro: CompactCadastro,
    #[serde(default)]
    pub potencial: CompactPotencial,
    #[serde(default)]
    pub classificacao: Option<CompactClassificacao>,
}

/// Stored rows for one scope, regrouped into the compact request
/// sections. Only keys a caller can also write through the save request
/// are grouped; family weights and the risk normalization factor stay
/// visible in the raw rows.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct GroupedParams {
    pub inadimplencia: CompactInadimplencia,
    pub medicao: CompactMedicao,
    pub cadastro: CompactCadastro,
    pub potencial: CompactPotencial,
    pub classificacao: CompactClassificacao,
}

impl GroupedParams {
    fn apply(&mut self, key: CoefficientKey, row: &StoredParameter) {
        if key == CoefficientKey::PenCurve {
            self.inadimplencia.curve = match row.value_text.as_deref() {
                Some("linear") => Some(PenaltyCurve::Linear),
                Some("log") => Some(PenaltyCurve::Log),
                _ => None,
            };
            return;
        }

        let Some(value) = row.value_num.filter(|v| v.is_finite()) else {
            return;
        };
        match key {
            CoefficientKey::WAtraso => self.inadimplencia.w_days = Some(value),
            CoefficientKey::WIndice => self.inadimplencia.w_open_count = Some(value),
            CoefficientKey::WValorAberto => self.inadimplencia.w_amount_ratio = Some(value),
            CoefficientKey::PenTriggerRatio => self.inadimplencia.trigger_ratio = Some(value),
            CoefficientKey::PenMax => self.inadimplencia.penalty_max = Some(value),
            CoefficientKey::WIdade => self.medicao.w_idade = Some(value),
            CoefficientKey::WAnomalias => self.medicao.w_anomalias = Some(value),
            CoefficientKey::WDesvio => self.medicao.w_desvio = Some(value),
            CoefficientKey::ZWarn => self.cadastro.z_warn = Some(value),
            CoefficientKey::ZRisk => self.cadastro.z_risk = Some(value),
            CoefficientKey::PotMin => self.potencial.pot_min = Some(value),
            CoefficientKey::PotMax => self.potencial.pot_max = Some(value),
            CoefficientKey::ThrBaixo => self.classificacao.baixo = Some(value),
            CoefficientKey::ThrMedio => self.classificacao.medio = Some(value),
            CoefficientKey::ThrAlto => self.classificacao.alto = Some(value),
            CoefficientKey::NoneCut => {
                self.classificacao.nenhum_if_all_potentials_below = Some(value)
            }
            CoefficientKey::WFamCadastro
            | CoefficientKey::WFamMedicao
            | CoefficientKey::WFamInad
            | CoefficientKey::FatorNormalizacao
            | CoefficientKey::PenCurve => {}
        }
    }
}

/// Read view of one scope's active coefficient rows.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamsListing {
    pub escopo: ParamScopeKind,
    pub id: String,
    pub periodo: String,
    pub janela_meses: u32,
    pub count: usize,
    pub params: GroupedParams,
    pub raw: Vec<StoredParameter>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SaveParamsSummary {
    pub escopo: ParamScopeKind,
    pub id: String,
    pub periodo: String,
    pub janela_meses: u32,
    pub rows_written: usize,
}

/// Manual coefficient reads and writes. A save validates the supplied
/// set and persists it as one atomic replace for its
/// `(scope, period, window)`; a list reads the active rows back.
#[derive(Clone)]
pub struct ParamsService {
    params: Arc<dyn ParameterRepository>,
}

impl ParamsService {
    pub fn new(params: Arc<dyn ParameterRepository>) -> Self {
        Self { params }
    }

    pub fn save(&self, request: &SaveParamsRequest) -> Result<SaveParamsSummary, ParamsError> {
        let (scope, group_id) = parse_scope(&request.escopo, &request.id)?;

        let period = Period::parse(&request.periodo)
            .ok_or_else(|| ParamsError::InvalidPeriod(request.periodo.clone()))?;
        let window_months = u32::try_from(request.janela_meses)
            .ok()
            .filter(|w| *w > 0)
            .ok_or(ParamsError::InvalidWindow(request.janela_meses))?;

        validate_weights(request)?;

        let mut set = CoefficientSet::default();
        let get = |opt: Option<f64>, current: f64| opt.unwrap_or(current);
        set.w_atraso = get(request.inadimplencia.w_days, set.w_atraso);
        set.w_indice = get(request.inadimplencia.w_open_count, set.w_indice);
        set.w_valor_aberto = get(request.inadimplencia.w_amount_ratio, set.w_valor_aberto);
        set.pen_trigger_ratio = get(request.inadimplencia.trigger_ratio, set.pen_trigger_ratio);
        set.pen_max = get(request.inadimplencia.penalty_max, set.pen_max);
        set.pen_curve = request.inadimplencia.curve.unwrap_or(set.pen_curve);
        set.w_idade = get(request.medicao.w_idade, set.w_idade);
        set.w_anomalias = get(request.medicao.w_anomalias, set.w_anomalias);
        set.w_desvio = get(request.medicao.w_desvio, set.w_desvio);
        set.z_warn = get(request.cadastro.z_warn, set.z_warn);
        set.z_risk = get(request.cadastro.z_risk, set.z_risk);
        set.pot_min = get(request.potencial.pot_min, set.pot_min);
        set.pot_max = get(request.potencial.pot_max, set.pot_max);
        if let Some(classificacao) = &request.classificacao {
            set.thr_baixo = get(classificacao.baixo, set.thr_baixo);
            set.thr_medio = get(classificacao.medio, set.thr_medio);
            set.thr_alto = get(classificacao.alto, set.thr_alto);
            set.none_cut = get(classificacao.nenhum_if_all_potentials_below, set.none_cut);
        }
        set.validate()?;

        let month = period.month_key();
        let rows = match group_id {
            None => {
                let rows = set.to_rows(Some(&request.id), &month, window_months);
                self.params
                    .replace_sector_params(&request.id, &month, window_months, rows.clone())?;
                rows
            }
            Some(group_id) => {
                let rows = set.to_rows(None, &month, window_months);
                self.params
                    .replace_group_params(group_id, &month, window_months, rows.clone())?;
                rows
            }
        };

        Ok(SaveParamsSummary {
            escopo: scope,
            id: request.id.clone(),
            periodo: month,
            janela_meses: window_months,
            rows_written: rows.len(),
        })
    }

    /// Reads one scope's active rows back, regrouped into sections. Rows
    /// whose names fail to decode are left in the raw list only.
    pub fn list(
        &self,
        escopo: &str,
        id: &str,
        periodo: &str,
        janela_meses: i64,
    ) -> Result<ParamsListing, ParamsError> {
        let (scope, group_id) = parse_scope(escopo, id)?;
        let period = Period::parse(periodo)
            .ok_or_else(|| ParamsError::InvalidPeriod(periodo.to_string()))?;
        let window_months = u32::try_from(janela_meses)
            .ok()
            .filter(|w| *w > 0)
            .ok_or(ParamsError::InvalidWindow(janela_meses))?;

        let month = period.month_key();
        let rows = match group_id {
            None => self.params.sector_params(id, &month, window_months)?,
            Some(group_id) => self.params.group_params(group_id, &month, window_months)?,
        };

        let mut grouped = GroupedParams::default();
        for row in &rows {
            if let Some(decoded) = DecodedName::parse(&row.name) {
                grouped.apply(decoded.key, row);
            }
        }

        Ok(ParamsListing {
            escopo: scope,
            id: id.to_string(),
            periodo: month,
            janela_meses: window_months,
            count: rows.len(),
            params: grouped,
            raw: rows,
        })
    }
}

fn validate_weights(request: &SaveParamsRequest) -> Result<(), ParamsError> {
    let inad = request.inadimplencia.w_days.unwrap_or(0.0)
        + request.inadimplencia.w_open_count.unwrap_or(0.0)
        + request.inadimplencia.w_amount_ratio.unwrap_or(0.0);
    if (inad - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(ParamsError::WeightSum {
            family: "inadimplencia",
            sum: inad,
        });
    }

    let med = request.medicao.w_idade.unwrap_or(0.0)
        + request.medicao.w_anomalias.unwrap_or(0.0)
        + request.medicao.w_desvio.unwrap_or(0.0);
    if (med - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(ParamsError::WeightSum {
            family: "medicao",
            sum: med,
        });
    }

    match (request.cadastro.z_warn, request.cadastro.z_risk) {
        (Some(warn), Some(risk)) if warn.is_finite() && risk.is_finite() && warn < risk => {}
        _ => return Err(ParamsError::BadZThresholds),
    }
    match (request.potencial.pot_min, request.potencial.pot_max) {
        (Some(min), Some(max)) if min.is_finite() && max.is_finite() && min <= max => {}
        _ => return Err(ParamsError::BadPotentialBounds),
    }

    Ok(())
}
