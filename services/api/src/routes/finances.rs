use axum::{
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use axum_extra::extract::WithRejection;
use dto::{InitiatePaymentRequest, InitiatePaymentResponse, Role, VerifyPaymentRequest};
use models::Payment;
use uuid::Uuid;

use super::{ok, ApiResult, Body, PathParam};
use crate::{auth::ADMIN_ROLES, state::AppState, tenant::TenantContext};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/finances/payments/initiate", post(initiate_payment))
        .route(
            "/finances/payments/verify/:transactionId",
            post(verify_payment),
        )
}

/// Residents pay their own fees; administrators may open a checkout for any.
async fn initiate_payment(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Json(body), _): Body<InitiatePaymentRequest>,
) -> ApiResult<InitiatePaymentResponse> {
    let payer = if ctx.require_role(ADMIN_ROLES).is_ok() {
        None
    } else {
        ctx.require_role(&[Role::Resident])?;
        Some(ctx.session.claims.email.as_str())
    };
    ok(state
        .payments()
        .initiate(&ctx.schema, body.fee_id, payer)
        .await?)
}

/// Gateway return leg. The signature, not the caller's role, authorises the
/// state change.
async fn verify_payment(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Path(transaction_id), _): PathParam<Uuid>,
    WithRejection(Json(body), _): Body<VerifyPaymentRequest>,
) -> ApiResult<Payment> {
    ok(state
        .payments()
        .verify(
            &ctx.schema,
            transaction_id,
            body.status,
            &body.gateway_reference,
            &body.signature,
        )
        .await?)
}
