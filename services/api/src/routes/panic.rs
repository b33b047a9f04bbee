use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, patch, post},
    Json, Router,
};
use axum_extra::extract::WithRejection;
use dto::{ApiResponse, CreatePanicAlertRequest, CreatePanicResponseRequest, UpdatePanicStatusRequest};
use models::{PanicAlert, PanicResponse};

use super::{ok, ApiResult, Body, PathParam};
use crate::{
    auth::SECURITY_ROLES,
    error::ApiError,
    services::panic::{AlertDetail, StatusUpdate},
    state::AppState,
    store::NewPanicAlert,
    tenant::TenantContext,
};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/panic/alerts", post(create_alert))
        .route("/panic/alerts/active", get(active_alerts))
        .route("/panic/alerts/:id", get(alert_detail))
        .route("/panic/alerts/:id/status", patch(update_status))
        .route("/panic/alerts/:id/responses", post(add_response))
}

/// Any member of the complex may raise an alert.
async fn create_alert(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Json(body), _): Body<CreatePanicAlertRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PanicAlert>>), ApiError> {
    let alert = state
        .panic()
        .create(
            &ctx.schema,
            NewPanicAlert {
                user_id: ctx.user_id(),
                property_id: body.property_id,
                alert_type: body.alert_type,
                location: body.location,
                description: body.description,
            },
        )
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(alert))))
}

async fn active_alerts(State(state): State<AppState>, ctx: TenantContext) -> ApiResult<Vec<PanicAlert>> {
    ctx.require_role(SECURITY_ROLES)?;
    ok(state.panic().list_active(&ctx.schema).await?)
}

async fn alert_detail(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Path(id), _): PathParam<i64>,
) -> ApiResult<AlertDetail> {
    ctx.require_role(SECURITY_ROLES)?;
    ok(state.panic().get(&ctx.schema, id).await?)
}

async fn update_status(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Path(id), _): PathParam<i64>,
    WithRejection(Json(body), _): Body<UpdatePanicStatusRequest>,
) -> ApiResult<StatusUpdate> {
    ctx.require_role(SECURITY_ROLES)?;
    ok(state
        .panic()
        .update_status(&ctx.schema, id, body.status, ctx.user_id())
        .await?)
}

async fn add_response(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Path(id), _): PathParam<i64>,
    WithRejection(Json(body), _): Body<CreatePanicResponseRequest>,
) -> Result<(StatusCode, Json<ApiResponse<PanicResponse>>), ApiError> {
    ctx.require_role(SECURITY_ROLES)?;
    let response = state
        .panic()
        .respond(
            &ctx.schema,
            id,
            ctx.user_id(),
            &body.action_taken,
            body.notes.as_deref(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(response))))
}
