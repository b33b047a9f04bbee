use axum::{
    extract::{Path, State},
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use axum_extra::extract::WithRejection;
use dto::Role;

use super::PathParam;
use crate::{error::ApiError, state::AppState, tenant::TenantContext};

const FULL_ACCESS: &[Role] = &[Role::Admin, Role::SuperAdmin, Role::Staff];

pub(super) fn routes() -> Router<AppState> {
    Router::new().route(
        "/reports/peace-and-safe/pdf/:residentId",
        get(peace_and_safe_pdf),
    )
}

async fn peace_and_safe_pdf(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Path(resident_id), _): PathParam<i64>,
) -> Result<Response, ApiError> {
    let own_only = if ctx.require_role(FULL_ACCESS).is_ok() {
        None
    } else {
        ctx.require_role(&[Role::Resident])?;
        Some(ctx.session.claims.email.as_str())
    };
    let pdf = state
        .reports()
        .peace_and_safe(&ctx.schema, resident_id, own_only)
        .await?;

    let disposition = format!("attachment; filename=\"paz-y-salvo-{resident_id}.pdf\"");
    Ok((
        [
            (header::CONTENT_TYPE, "application/pdf".to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        pdf,
    )
        .into_response())
}
