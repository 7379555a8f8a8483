//! Unified server error type.
//!
//! Every handler returns `Result<T, ServerError>`, which implements
//! [`axum::response::IntoResponse`] so errors become a JSON body
//! `{"error": "..."}` with a matching status code. Dispatcher failures that
//! point at a server bug are logged in full and reported to the client with a
//! generic message.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use lectern_core::{DispatchError, StoreError};
use serde_json::json;
use thiserror::Error;
use tracing::error;

#[derive(Debug, Error)]
pub enum ServerError {
    /// Propagated from the job dispatcher.
    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("bad request: {0}")]
    BadRequest(String),
}

impl From<StoreError> for ServerError {
    fn from(e: StoreError) -> Self {
        ServerError::Dispatch(e.into())
    }
}

impl From<validator::ValidationErrors> for ServerError {
    fn from(e: validator::ValidationErrors) -> Self {
        ServerError::BadRequest(e.to_string())
    }
}

fn dispatch_status(e: &DispatchError) -> StatusCode {
    match e {
        DispatchError::Overloaded { .. }
        | DispatchError::NoBackendForKind { .. }
        | DispatchError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        DispatchError::UnknownBackendClass { .. } | DispatchError::InvalidSubmission { .. } => {
            StatusCode::BAD_REQUEST
        }
        DispatchError::Store(StoreError::NotFound { .. }) => StatusCode::NOT_FOUND,
        DispatchError::Store(
            StoreError::StaleTransition { .. } | StoreError::IllegalTransition { .. },
        ) => StatusCode::CONFLICT,
        DispatchError::Store(StoreError::DuplicateId { .. }) | DispatchError::InvalidConfig { .. } => {
            StatusCode::INTERNAL_SERVER_ERROR
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, client_message) = match &self {
            ServerError::BadRequest(m) => (StatusCode::BAD_REQUEST, m.clone()),
            ServerError::Dispatch(e) => {
                let status = dispatch_status(e);
                if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
                    error!(error = %e, "dispatcher error");
                    (status, "internal server error".to_owned())
                } else {
                    (status, e.to_string())
                }
            }
        };
        (status, Json(json!({ "error": client_message }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use lectern_core::{BackendClass, JobId, JobStatus};

    use super::*;

    fn status_of(err: ServerError) -> StatusCode {
        err.into_response().status()
    }

    #[test]
    fn dispatcher_errors_map_to_http_statuses() {
        let overloaded = DispatchError::Overloaded {
            backend_class: BackendClass::from("generation"),
            capacity: 4,
        };
        assert_eq!(status_of(overloaded.into()), StatusCode::SERVICE_UNAVAILABLE);

        let not_found = StoreError::NotFound { id: JobId::new() };
        assert_eq!(status_of(not_found.into()), StatusCode::NOT_FOUND);

        let illegal = StoreError::IllegalTransition {
            id: JobId::new(),
            from: JobStatus::Running,
            transition: "acknowledge",
        };
        assert_eq!(status_of(illegal.into()), StatusCode::CONFLICT);

        let invalid = DispatchError::InvalidSubmission {
            reason: "prompt is empty".into(),
        };
        assert_eq!(status_of(invalid.into()), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn server_faults_hide_details() {
        let duplicate = StoreError::DuplicateId { id: JobId::new() };
        let response = ServerError::from(duplicate).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "internal server error");
    }

    #[test]
    fn validation_errors_are_bad_requests() {
        let mut errors = validator::ValidationErrors::new();
        errors.add("prompt", validator::ValidationError::new("length"));
        let err = ServerError::from(errors);
        assert!(matches!(err, ServerError::BadRequest(_)));
        assert_eq!(status_of(err), StatusCode::BAD_REQUEST);
    }
}
