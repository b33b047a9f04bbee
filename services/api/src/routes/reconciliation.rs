use axum::{
    extract::{Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use axum_extra::extract::WithRejection;
use chrono::NaiveDate;
use dto::{
    ApiResponse, BulkReconciliationOutcome, BulkReconciliationRequest, ManualReconciliationRequest,
    PagedResponse, ProcessReconciliationRequest, ReconciliationResult, ReconciliationStats,
    UploadStatementRequest,
};
use models::{BankTransaction, ReconciliationStatus};
use serde::Deserialize;
use serde_json::json;

use super::{ok, ApiResult, Body};
use crate::{
    auth::ADMIN_ROLES,
    error::ApiError,
    services::{reconciliation::DEFAULT_PAGE_SIZE, ReconciliationConfig},
    state::AppState,
    store::Period,
    tenant::TenantContext,
};

pub(super) fn routes() -> Router<AppState> {
    Router::new()
        .route("/bank-reconciliation/upload", post(upload_statement))
        .route("/bank-reconciliation/reconcile", post(reconcile))
        .route(
            "/bank-reconciliation/manual-reconciliation",
            post(manual_reconciliation),
        )
        .route("/bank-reconciliation/bulk-reconciliation", post(bulk_reconciliation))
        .route("/bank-reconciliation/results", get(results))
        .route("/bank-reconciliation/stats", get(stats))
        .route("/bank-reconciliation/config", get(config))
        .route("/bank-reconciliation/health", get(health))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PeriodQuery {
    period_start: Option<NaiveDate>,
    period_end: Option<NaiveDate>,
}

impl From<&PeriodQuery> for Period {
    fn from(query: &PeriodQuery) -> Self {
        Period {
            start: query.period_start,
            end: query.period_end,
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResultsQuery {
    status: Option<ReconciliationStatus>,
    period_start: Option<NaiveDate>,
    period_end: Option<NaiveDate>,
    page: Option<u32>,
    limit: Option<u32>,
}

async fn upload_statement(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Json(body), _): Body<UploadStatementRequest>,
) -> Result<(StatusCode, Json<ApiResponse<Vec<BankTransaction>>>), ApiError> {
    ctx.require_role(ADMIN_ROLES)?;
    let stored = state
        .reconciliation()
        .upload(&ctx.schema, body.transactions)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(stored))))
}

async fn reconcile(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Json(body), _): Body<ProcessReconciliationRequest>,
) -> ApiResult<Vec<ReconciliationResult>> {
    ctx.require_role(ADMIN_ROLES)?;
    if let (Some(start), Some(end)) = (body.period_start, body.period_end) {
        if start > end {
            return Err(ApiError::BadRequest("periodStart is after periodEnd".into()));
        }
    }
    ok(state.reconciliation().reconcile(&ctx.schema, &body).await?)
}

async fn manual_reconciliation(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Json(body), _): Body<ManualReconciliationRequest>,
) -> ApiResult<BankTransaction> {
    ctx.require_role(ADMIN_ROLES)?;
    ok(state
        .reconciliation()
        .manual(
            &ctx.schema,
            body.bank_transaction_id,
            body.payment_id,
            ctx.user_id(),
        )
        .await?)
}

async fn stats(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Query(query), _): WithRejection<Query<PeriodQuery>, ApiError>,
) -> ApiResult<ReconciliationStats> {
    ctx.require_role(ADMIN_ROLES)?;
    ok(state.reconciliation().stats(&ctx.schema, Period::from(&query)).await?)
}

async fn bulk_reconciliation(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Json(body), _): Body<BulkReconciliationRequest>,
) -> ApiResult<BulkReconciliationOutcome> {
    ctx.require_role(ADMIN_ROLES)?;
    ok(state
        .reconciliation()
        .bulk(&ctx.schema, &body.reconciliations, ctx.user_id())
        .await?)
}

async fn results(
    State(state): State<AppState>,
    ctx: TenantContext,
    WithRejection(Query(query), _): WithRejection<Query<ResultsQuery>, ApiError>,
) -> Result<Json<PagedResponse<BankTransaction>>, ApiError> {
    ctx.require_role(ADMIN_ROLES)?;
    if let (Some(start), Some(end)) = (query.period_start, query.period_end) {
        if start > end {
            return Err(ApiError::BadRequest("periodStart is after periodEnd".into()));
        }
    }
    let (data, pagination) = state
        .reconciliation()
        .results(
            &ctx.schema,
            query.status,
            Period {
                start: query.period_start,
                end: query.period_end,
            },
            query.page.unwrap_or(1),
            query.limit.unwrap_or(DEFAULT_PAGE_SIZE),
        )
        .await?;
    Ok(Json(PagedResponse::page(data, pagination)))
}

async fn config(State(state): State<AppState>, ctx: TenantContext) -> ApiResult<ReconciliationConfig> {
    ctx.require_role(ADMIN_ROLES)?;
    ok(state.reconciliation().config().clone())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status":"ok","service":"bank-reconciliation"}))
}
