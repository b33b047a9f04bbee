use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{delete, post},
    Json, Router,
};
use axum_extra::extract::WithRejection;
use dto::{ApiResponse, CreateComplexRequest, MessageResponse};
use models::Complex;

use super::{ok, ApiResult, Body, PathParam};
use crate::{auth::Session, error::ApiError, state::AppState, tenant::SchemaName};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/complexes", post(create_complex))
        .route("/complexes/:schemaName", delete(deactivate_complex))
}

fn schema_param(raw: &str) -> Result<SchemaName, ApiError> {
    SchemaName::parse(raw).map_err(|error| ApiError::BadRequest(error.to_string()))
}

async fn create_complex(
    State(state): State<AppState>,
    session: Session,
    WithRejection(Json(body), _): Body<CreateComplexRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Complex>>), ApiError> {
    session.require_global_admin()?;
    let schema = schema_param(&body.schema_name)?;
    let complex = state.complexes().provision(&body.name, &schema).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(complex))))
}

async fn deactivate_complex(
    State(state): State<AppState>,
    session: Session,
    WithRejection(Path(schema_name), _): PathParam<String>,
) -> ApiResult<MessageResponse> {
    session.require_global_admin()?;
    let schema = schema_param(&schema_name)?;
    state.complexes().deactivate(&schema).await?;
    ok(MessageResponse {
        message: format!("complex {schema} deactivated"),
    })
}
