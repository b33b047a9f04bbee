use chrono::NaiveDate;
use models::{PanicStatus, PanicType, ReconciliationStatus};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    SuperAdmin,
    Admin,
    Reception,
    Staff,
    Resident,
    #[serde(other)]
    Unknown,
}

/// Session payload carried by the JWT the frontend receives at login.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionClaims {
    pub id: i64, // user id
    pub email: String,
    pub role: Role,
    #[serde(default)]
    pub complex_id: Option<i64>,
    #[serde(default)]
    pub schema_name: Option<String>,
    #[serde(default)]
    pub is_global_admin: bool,
    pub exp: usize,
    pub iat: usize,
}

/// Success envelope shared by every JSON endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePanicAlertRequest {
    #[serde(rename = "type")]
    pub alert_type: PanicType,
    #[serde(default)]
    pub property_id: Option<i64>,
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpdatePanicStatusRequest {
    pub status: PanicStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePanicResponseRequest {
    pub action_taken: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentRequest {
    pub fee_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiatePaymentResponse {
    pub transaction_id: Uuid,
    pub redirect_url: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GatewayOutcome {
    Approved,
    Declined,
}

impl GatewayOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Approved => "APPROVED",
            Self::Declined => "DECLINED",
        }
    }
}

/// Callback the payment gateway posts once the resident finishes checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyPaymentRequest {
    pub status: GatewayOutcome,
    pub gateway_reference: String,
    pub signature: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatementLine {
    pub posted_on: NaiveDate,
    pub amount_cents: i64,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadStatementRequest {
    pub transactions: Vec<StatementLine>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReconciliationRequest {
    #[serde(default)]
    pub period_start: Option<NaiveDate>,
    #[serde(default)]
    pub period_end: Option<NaiveDate>,
    #[serde(default)]
    pub amount_tolerance_cents: Option<i64>,
    #[serde(default)]
    pub date_tolerance_days: Option<i64>,
    #[serde(default)]
    pub auto_match: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualReconciliationRequest {
    pub bank_transaction_id: i64,
    pub payment_id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BulkReconciliationRequest {
    pub reconciliations: Vec<ManualReconciliationRequest>,
}

/// How many manual matches of a batch were applied and how many were refused.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkReconciliationOutcome {
    pub success: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    /// Matching records across all pages.
    pub total: usize,
}

/// Envelope for listings served one page at a time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PagedResponse<T> {
    pub success: bool,
    pub data: Vec<T>,
    pub pagination: Pagination,
}

impl<T> PagedResponse<T> {
    pub fn page(data: Vec<T>, pagination: Pagination) -> Self {
        Self {
            success: true,
            data,
            pagination,
        }
    }
}

/// Outcome of matching one bank statement line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationResult {
    pub bank_transaction_id: i64,
    pub status: ReconciliationStatus,
    pub payment_id: Option<i64>,
    pub confidence: f64,
    pub rule: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationStats {
    pub total_transactions: usize,
    pub matched_transactions: usize,
    pub unmatched_transactions: usize,
    pub review_transactions: usize,
    pub total_amount_cents: i64,
    pub matched_amount_cents: i64,
    pub unmatched_amount_cents: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateComplexRequest {
    pub name: String,
    pub schema_name: String,
}
