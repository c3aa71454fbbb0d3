use crate::infra::AppState;
use aquascore::error::AppError;
use aquascore::groups::{GroupSummary, SaveGroupRequest};
use aquascore::params::{ParamsListing, SaveParamsRequest, SaveParamsSummary};
use aquascore::scoring::canonical::Period;
use aquascore::scoring::risk::{RiskReport, RiskRunRequest};
use aquascore::scoring::service::{ScoringError, ScoringRunReport};
use axum::extract::Path;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Extension, Json};
use serde_json::json;

pub(crate) fn router() -> axum::Router {
    axum::Router::new()
        .route("/health", get(healthcheck))
        .route("/ready", get(readiness_endpoint))
        .route("/metrics", get(metrics_endpoint))
        .route("/api/v1/score/:periodo/:setor", get(score_endpoint))
        .route("/api/v1/risk", post(risk_endpoint))
        .route("/api/v1/params", post(params_endpoint))
        .route(
            "/api/v1/params/:escopo/:id/:periodo/:janela_meses",
            get(params_list_endpoint),
        )
        .route("/api/v1/grupos", post(grupos_endpoint))
}

pub(crate) async fn healthcheck() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

pub(crate) async fn readiness_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    let ready = state.readiness.load(std::sync::atomic::Ordering::Relaxed);
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let payload = if ready {
        json!({ "status": "ready" })
    } else {
        json!({ "status": "initializing" })
    };

    (status, Json(payload))
}

pub(crate) async fn metrics_endpoint(Extension(state): Extension<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

/// Scores one sector for one period and persists the batch. Always 200
/// with a summary when the batch ran; per-record failures are rows in the
/// store, not an HTTP failure.
pub(crate) async fn score_endpoint(
    Extension(state): Extension<AppState>,
    Path((periodo, setor)): Path<(String, String)>,
) -> Result<Json<ScoringRunReport>, AppError> {
    let period =
        Period::parse(&periodo).ok_or_else(|| ScoringError::InvalidPeriod(periodo.clone()))?;
    let report = state.scoring.run(period, &setor).await?;
    Ok(Json(report))
}

pub(crate) async fn risk_endpoint(
    Extension(state): Extension<AppState>,
    Json(request): Json<RiskRunRequest>,
) -> Result<Json<RiskReport>, AppError> {
    let report = state.risk.run(&request)?;
    Ok(Json(report))
}

pub(crate) async fn params_endpoint(
    Extension(state): Extension<AppState>,
    Json(request): Json<SaveParamsRequest>,
) -> Result<Json<SaveParamsSummary>, AppError> {
    let summary = state.params.save(&request)?;
    Ok(Json(summary))
}

pub(crate) async fn params_list_endpoint(
    Extension(state): Extension<AppState>,
    Path((escopo, id, periodo, janela_meses)): Path<(String, String, String, i64)>,
) -> Result<Json<ParamsListing>, AppError> {
    let listing = state.params.list(&escopo, &id, &periodo, janela_meses)?;
    Ok(Json(listing))
}

pub(crate) async fn grupos_endpoint(
    Extension(state): Extension<AppState>,
    Json(request): Json<SaveGroupRequest>,
) -> Result<Json<GroupSummary>, AppError> {
    let summary = state.groups.save(&request)?;
    Ok(Json(summary))
}
