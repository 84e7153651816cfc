//! API Error Handling
//!
//! Maps scheduler errors to HTTP status codes and the error-code strings
//! clients switch on.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::error::SchedulerError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Validation(String),
    BadRequest(String),
    /// The job's state no longer allows the request
    Conflict(String),
    VersionMismatch(String),
    ResourceExhausted(String),
    TimeOut(String),
    DatastoreFailure(String),
    InternalError(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Validation(_) | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Conflict(_) | ApiError::VersionMismatch(_) => StatusCode::CONFLICT,
            ApiError::ResourceExhausted(_) => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::TimeOut(_) => StatusCode::GATEWAY_TIMEOUT,
            ApiError::DatastoreFailure(_) | ApiError::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Error-code string carried in the response body
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::NotFound(_) => "NotFound",
            ApiError::Validation(_) => "ValidationError",
            ApiError::BadRequest(_) => "BadRequest",
            ApiError::Conflict(_) => "ResourceInUse",
            ApiError::VersionMismatch(_) => "VersionMismatch",
            ApiError::ResourceExhausted(_) => "ResourceExhausted",
            ApiError::TimeOut(_) => "TimeOut",
            ApiError::DatastoreFailure(_) => "DatastoreFailure",
            ApiError::InternalError(_) => "InternalError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();
        let message = match self {
            ApiError::DatastoreFailure(msg) => {
                tracing::error!("Datastore error: {}", msg);
                "Internal server error".to_string()
            }
            ApiError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                msg
            }
            ApiError::NotFound(msg)
            | ApiError::Validation(msg)
            | ApiError::BadRequest(msg)
            | ApiError::Conflict(msg)
            | ApiError::VersionMismatch(msg)
            | ApiError::ResourceExhausted(msg)
            | ApiError::TimeOut(msg) => msg,
        };

        (
            status,
            Json(serde_json::json!({ "error": message, "code": code })),
        )
            .into_response()
    }
}

impl From<SchedulerError> for ApiError {
    fn from(err: SchedulerError) -> Self {
        let message = err.to_string();
        match err {
            SchedulerError::Validation(msg) => ApiError::Validation(msg),
            SchedulerError::NotFound(_) => ApiError::NotFound(message),
            SchedulerError::Rejected(msg) => ApiError::BadRequest(msg),
            SchedulerError::Terminal { .. } => ApiError::Conflict(message),
            SchedulerError::StoreWriteConflict { .. } => ApiError::VersionMismatch(message),
            SchedulerError::NoEligibleNodes(_) => ApiError::ResourceExhausted(message),
            SchedulerError::BidTimeout(_)
            | SchedulerError::AckTimeout { .. }
            | SchedulerError::ResultTimeout { .. } => ApiError::TimeOut(message),
            SchedulerError::Store(msg) => ApiError::DatastoreFailure(msg),
            SchedulerError::InvalidTransition { .. } => ApiError::InternalError(message),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use keel_core::domain::job::JobPhase;
    use uuid::Uuid;

    #[test]
    fn test_scheduler_error_mapping() {
        let id = Uuid::new_v4();
        let cases = [
            (SchedulerError::Validation("bad".into()), StatusCode::BAD_REQUEST, "ValidationError"),
            (SchedulerError::NotFound(id), StatusCode::NOT_FOUND, "NotFound"),
            (
                SchedulerError::Terminal {
                    job_id: id,
                    phase: JobPhase::Completed,
                },
                StatusCode::CONFLICT,
                "ResourceInUse",
            ),
            (SchedulerError::Store("down".into()), StatusCode::INTERNAL_SERVER_ERROR, "DatastoreFailure"),
        ];

        for (err, status, code) in cases {
            let api = ApiError::from(err);
            assert_eq!(api.status(), status);
            assert_eq!(api.code(), code);
        }
    }
}
