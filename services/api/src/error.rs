use axum::{
    extract::rejection::{JsonRejection, PathRejection, QueryRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use models::PanicStatus;
use serde_json::json;

use crate::{store::StoreError, tenant::retry::Retryable};

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("authentication required")]
    Unauthenticated,
    #[error("session is not bound to a residential complex")]
    UnresolvedTenant,
    #[error("insufficient permissions")]
    Forbidden,
    #[error("residential complex `{0}` not found")]
    TenantNotFound(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("cannot move from {from} to {to}")]
    InvalidTransition { from: PanicStatus, to: PanicStatus },
    #[error("resident has {pending} pending fee(s)")]
    OutstandingBalance { pending: usize },
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    BadRequest(String),
    #[error("payment callback signature does not match")]
    InvalidSignature,
    #[error("service temporarily saturated, retry later")]
    ConnectionExhausted,
    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl ApiError {
    fn status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::Unauthenticated => (StatusCode::UNAUTHORIZED, "UNAUTHENTICATED"),
            ApiError::UnresolvedTenant => (StatusCode::FORBIDDEN, "UNRESOLVED_TENANT"),
            ApiError::Forbidden => (StatusCode::FORBIDDEN, "FORBIDDEN"),
            ApiError::TenantNotFound(_) => (StatusCode::NOT_FOUND, "TENANT_NOT_FOUND"),
            ApiError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND"),
            ApiError::InvalidTransition { .. } => (StatusCode::CONFLICT, "INVALID_TRANSITION"),
            ApiError::OutstandingBalance { .. } => (StatusCode::CONFLICT, "OUTSTANDING_BALANCE"),
            ApiError::Conflict(_) => (StatusCode::CONFLICT, "CONFLICT"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::InvalidSignature => (StatusCode::BAD_REQUEST, "INVALID_SIGNATURE"),
            ApiError::ConnectionExhausted => {
                (StatusCode::SERVICE_UNAVAILABLE, "CONNECTION_EXHAUSTED")
            }
            ApiError::Unexpected(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL"),
        }
    }
}

impl From<StoreError> for ApiError {
    fn from(error: StoreError) -> Self {
        match error {
            StoreError::TenantNotFound(schema) => ApiError::TenantNotFound(schema),
            StoreError::NotFound => ApiError::NotFound("record".into()),
            StoreError::Exhausted => ApiError::ConnectionExhausted,
            StoreError::Conflict(message) => ApiError::Conflict(message),
            other => ApiError::Unexpected(other.into()),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<PathRejection> for ApiError {
    fn from(rejection: PathRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl From<QueryRejection> for ApiError {
    fn from(rejection: QueryRejection) -> Self {
        ApiError::BadRequest(rejection.body_text())
    }
}

impl Retryable for ApiError {
    fn is_exhausted(&self) -> bool {
        matches!(self, ApiError::ConnectionExhausted)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.status_and_code();
        let message = match &self {
            ApiError::Unexpected(error) => {
                tracing::error!(?error, "unexpected api error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        let body = json!({
            "success": false,
            "error": { "code": code, "message": message },
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_errors_map_onto_the_http_taxonomy() {
        let cases = [
            (StoreError::TenantNotFound("t9".into()), StatusCode::NOT_FOUND),
            (StoreError::NotFound, StatusCode::NOT_FOUND),
            (StoreError::Exhausted, StatusCode::SERVICE_UNAVAILABLE),
            (StoreError::Conflict("dup".into()), StatusCode::CONFLICT),
            (StoreError::Corrupt("bad".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (store, expected) in cases {
            let api = ApiError::from(store);
            assert_eq!(api.status_and_code().0, expected, "{api:?}");
        }
    }

    #[test]
    fn unexpected_errors_hide_their_detail() {
        let response =
            ApiError::Unexpected(anyhow::anyhow!("password=hunter2 in DSN")).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
