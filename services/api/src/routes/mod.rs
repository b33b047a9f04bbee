mod auth;
mod complexes;
mod finances;
mod panic;
mod reconciliation;
mod reports;

use axum::{
    extract::Path,
    http::{header, HeaderValue, Method},
    routing::get,
    Json, Router,
};
use axum_extra::extract::WithRejection;
use dto::ApiResponse;
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};

use crate::{error::ApiError, state::AppState};

/// JSON request body whose decoding errors render as [`ApiError`].
type Body<T> = WithRejection<Json<T>, ApiError>;
type PathParam<T> = WithRejection<Path<T>, ApiError>;
type ApiResult<T> = Result<Json<ApiResponse<T>>, ApiError>;

fn ok<T>(data: T) -> ApiResult<T> {
    Ok(Json(ApiResponse::success(data)))
}

/// Lightweight health probe used by readiness checks.
async fn health() -> Json<serde_json::Value> {
    Json(json!({"status":"ok"}))
}

fn cors(allow_origin: Option<&str>) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    // credentials (the session cookie) need an explicit origin
    match allow_origin.and_then(|origin| HeaderValue::from_str(origin).ok()) {
        Some(origin) => layer
            .allow_origin(AllowOrigin::exact(origin))
            .allow_credentials(true),
        None => layer.allow_origin(Any),
    }
}

pub fn router(state: AppState, allow_origin: Option<&str>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(auth::routes())
        .merge(panic::routes())
        .merge(reconciliation::routes())
        .merge(finances::routes())
        .merge(reports::routes())
        .merge(complexes::routes())
        .layer(cors(allow_origin))
        .with_state(state)
}
