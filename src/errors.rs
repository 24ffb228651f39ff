use crate::services::store::StoreError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Every way a request can fail. Each variant maps to exactly one response.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The client sent an incomplete or malformed request.
    #[error("{0}")]
    InvalidRequest(String),

    /// The requested key is not in the store.
    #[error("object not found")]
    NotFound,

    /// No route matches the method and path.
    #[error("no route for request")]
    RouteNotFound,

    /// The store failed; never retried here.
    #[error("object store failure: {0}")]
    StoreFailure(#[from] StoreError),
}

impl GatewayError {
    /// Shortcut for an `InvalidRequest` with the given reason.
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::InvalidRequest(reason.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::NotFound | Self::RouteNotFound => StatusCode::NOT_FOUND,
            Self::StoreFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        match self {
            Self::InvalidRequest(reason) => (status, Json(json!({ "error": reason }))).into_response(),
            Self::NotFound | Self::RouteNotFound => (status, "Not found").into_response(),
            Self::StoreFailure(err) => {
                // Store details stay in the log.
                tracing::error!("object store operation failed: {}", err);
                (status, Json(json!({ "error": "storage failure" }))).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::header;
    use std::io;

    #[test]
    fn statuses_follow_taxonomy() {
        assert_eq!(
            GatewayError::invalid("No file provided").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(GatewayError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(GatewayError::RouteNotFound.status(), StatusCode::NOT_FOUND);
        assert!(
            GatewayError::from(StoreError::Io(io::Error::other("disk full")))
                .status()
                .is_server_error()
        );
    }

    #[test]
    fn not_found_is_plain_text() {
        let response = GatewayError::NotFound.into_response();
        let content_type = response.headers()[header::CONTENT_TYPE].to_str().unwrap();
        assert!(content_type.starts_with("text/plain"));
    }

    #[test]
    fn invalid_request_is_json() {
        let response = GatewayError::invalid("No file provided").into_response();
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "application/json"
        );
    }
}
