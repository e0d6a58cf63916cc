use crate::history::HistoryError;
use crate::ingest::IngestError;
use crate::source::CommandError;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(StatusCode::SERVICE_UNAVAILABLE, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.message }))).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(_) => {
                tracing::warn!(error = %err, "store unavailable");
                Self::unavailable("Store unavailable")
            }
            StoreError::Database(_) | StoreError::Corrupt(_) => {
                tracing::error!(error = %err, "database error");
                Self::internal("Database error")
            }
        }
    }
}

impl From<HistoryError> for AppError {
    fn from(err: HistoryError) -> Self {
        match err {
            HistoryError::UnknownMetric(metric) => {
                Self::not_found(format!("Unknown metric: {metric}"))
            }
            HistoryError::InvalidRange { .. } | HistoryError::InvalidLimit => {
                Self::bad_request(err.to_string())
            }
            HistoryError::Store(err) => err.into(),
        }
    }
}

impl From<IngestError> for AppError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::UnknownMetric(metric) => {
                Self::not_found(format!("Unknown metric: {metric}"))
            }
            IngestError::Store(err) => err.into(),
            IngestError::Source(err) => Self::new(StatusCode::BAD_GATEWAY, err.to_string()),
        }
    }
}

impl From<CommandError> for AppError {
    fn from(err: CommandError) -> Self {
        match err {
            CommandError::Invalid(_) => Self::bad_request(err.to_string()),
            CommandError::NotConnected | CommandError::Busy => {
                tracing::warn!(error = %err, "command not delivered");
                Self::unavailable(err.to_string())
            }
        }
    }
}
