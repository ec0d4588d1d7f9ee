use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Invalid request: {0}")]
    BadRequest(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    #[error("Forbidden: {0}")]
    Forbidden(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Conflict: {0}")]
    Conflict(String),
    #[error("Account is locked. Try again in {minutes_remaining} minute(s)")]
    Locked { minutes_remaining: u32 },
    #[error("Internal server error: {0}")]
    Internal(String),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    minutes_remaining: Option<u32>,
}

impl AppError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::Unauthorized(message.into())
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        Self::Forbidden(message.into())
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }
}

impl From<idp_core::Error> for AppError {
    fn from(error: idp_core::Error) -> Self {
        match error {
            idp_core::Error::InvalidInput(message) => Self::BadRequest(message),
            idp_core::Error::NotFound(message) => Self::NotFound(message),
            idp_core::Error::Conflict(message) => Self::Conflict(message),
            other => {
                tracing::error!("Local store failure: {other}");
                Self::Internal("local store failure".to_string())
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Locked { .. } => StatusCode::LOCKED,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let minutes_remaining = match self {
            Self::Locked { minutes_remaining } => Some(minutes_remaining),
            _ => None,
        };
        let body = ErrorBody {
            error: self.to_string(),
            minutes_remaining,
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_errors_map_to_client_statuses() {
        let conflict: AppError = idp_core::Error::Conflict("email taken".to_string()).into();
        assert_eq!(conflict.into_response().status(), StatusCode::CONFLICT);

        let invalid: AppError = idp_core::Error::InvalidInput("bad email".to_string()).into();
        assert_eq!(invalid.into_response().status(), StatusCode::BAD_REQUEST);

        let store: AppError = idp_core::Error::Database("disk".to_string()).into();
        assert_eq!(store.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn locked_error_reports_minutes_remaining() {
        let error = AppError::Locked {
            minutes_remaining: 7,
        };
        assert_eq!(
            error.to_string(),
            "Account is locked. Try again in 7 minute(s)"
        );
        assert_eq!(error.into_response().status(), StatusCode::LOCKED);
    }
}
