//! API Error Handling
//!
//! Unified error types and conversion for API responses.

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use quill_store::StoreError;

/// API error type
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    /// The job is not in a state that allows the request (overriding a
    /// completed job)
    Conflict(String),
    StoreError(StoreError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            ApiError::StoreError(err) => {
                tracing::error!("Store error: {:?}", err);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
        };

        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => ApiError::NotFound(format!("Job {} not found", id)),
            StoreError::InvalidTransition { .. } | StoreError::ClaimLost(_) => {
                ApiError::Conflict(err.to_string())
            }
            other => ApiError::StoreError(other),
        }
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

#[cfg(test)]
mod tests {
    use super::*;
    use quill_core::domain::job::JobStatus;
    use uuid::Uuid;

    #[test]
    fn test_store_errors_map_to_status_codes() {
        let id = Uuid::new_v4();
        let response = ApiError::from(StoreError::NotFound(id)).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = ApiError::from(StoreError::InvalidTransition {
            job_id: id,
            from: JobStatus::Completed,
            to: JobStatus::Failed,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let parse_err = serde_json::from_str::<u8>("x").unwrap_err();
        let response = ApiError::from(StoreError::Serialization(parse_err)).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
