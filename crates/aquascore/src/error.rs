use crate::calibrate::CalibrationError;
use crate::config::ConfigError;
use crate::groups::GroupsError;
use crate::params::ParamsError;
use crate::scoring::risk::RiskError;
use crate::scoring::service::ScoringError;
use crate::telemetry::TelemetryError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::fmt;

#[derive(Debug)]
pub enum AppError {
    Config(ConfigError),
    Telemetry(TelemetryError),
    Io(std::io::Error),
    Server(axum::Error),
    Scoring(ScoringError),
    Params(ParamsError),
    Groups(GroupsError),
    Risk(RiskError),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Config(err) => write!(f, "configuration error: {}", err),
            AppError::Telemetry(err) => write!(f, "telemetry error: {}", err),
            AppError::Io(err) => write!(f, "io error: {}", err),
            AppError::Server(err) => write!(f, "server error: {}", err),
            AppError::Scoring(err) => write!(f, "scoring error: {}", err),
            AppError::Params(err) => write!(f, "parameter error: {}", err),
            AppError::Groups(err) => write!(f, "group error: {}", err),
            AppError::Risk(err) => write!(f, "risk error: {}", err),
        }
    }
}

impl std::error::Error for AppError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AppError::Config(err) => Some(err),
            AppError::Telemetry(err) => Some(err),
            AppError::Io(err) => Some(err),
            AppError::Server(err) => Some(err),
            AppError::Scoring(err) => Some(err),
            AppError::Params(err) => Some(err),
            AppError::Groups(err) => Some(err),
            AppError::Risk(err) => Some(err),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Scoring(ScoringError::InvalidPeriod(_)) => StatusCode::BAD_REQUEST,
            AppError::Scoring(ScoringError::EmptyPeriod(_))
            | AppError::Scoring(ScoringError::EmptySector { .. }) => StatusCode::NOT_FOUND,
            AppError::Scoring(ScoringError::Calibration(CalibrationError::Timeout { .. }))
            | AppError::Scoring(ScoringError::Calibration(CalibrationError::Failed(_)))
            | AppError::Scoring(ScoringError::Calibration(CalibrationError::Transport(_))) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Scoring(ScoringError::Calibration(CalibrationError::Policy(_))) => {
                StatusCode::BAD_GATEWAY
            }
            AppError::Params(_) => StatusCode::BAD_REQUEST,
            AppError::Groups(GroupsError::EmptySectors) => StatusCode::BAD_REQUEST,
            AppError::Groups(GroupsError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Risk(RiskError::Store(_)) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Risk(_) => StatusCode::BAD_REQUEST,
            AppError::Config(_)
            | AppError::Telemetry(_)
            | AppError::Io(_)
            | AppError::Server(_)
            | AppError::Scoring(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(json!({ "error": self.to_string() }));
        (status, body).into_response()
    }
}

impl From<ConfigError> for AppError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

impl From<TelemetryError> for AppError {
    fn from(value: TelemetryError) -> Self {
        Self::Telemetry(value)
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<axum::Error> for AppError {
    fn from(value: axum::Error) -> Self {
        Self::Server(value)
    }
}

impl From<ScoringError> for AppError {
    fn from(value: ScoringError) -> Self {
        Self::Scoring(value)
    }
}

impl From<ParamsError> for AppError {
    fn from(value: ParamsError) -> Self {
        Self::Params(value)
    }
}

impl From<GroupsError> for AppError {
    fn from(value: GroupsError) -> Self {
        Self::Groups(value)
    }
}

impl From<RiskError> for AppError {
    fn from(value: RiskError) -> Self {
        Self::Risk(value)
    }
}
