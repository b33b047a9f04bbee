//! Tenant-scoped persistence.
//!
//! A [`SchemaBackend`] opens one [`TenantClient`] per tenant schema. A client
//! only ever sees the tables of the schema it was opened for, so every method
//! below is implicitly filtered to a single residential complex.

pub mod memory;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::NaiveDate;
use models::{
    BankTransaction, Complex, Fee, PanicAlert, PanicResponse, PanicStatus, PanicType, Payment,
    PaymentStatus, ReconciliationStatus, Resident,
};
use uuid::Uuid;

use crate::tenant::{retry::Retryable, SchemaName};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("tenant schema `{0}` not found")]
    TenantNotFound(String),
    #[error("record not found")]
    NotFound,
    #[error("connections exhausted")]
    Exhausted,
    #[error("conflicting write: {0}")]
    Conflict(String),
    #[error("stored value is corrupt: {0}")]
    Corrupt(String),
    #[error(transparent)]
    Database(sqlx::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(error: sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => StoreError::Exhausted,
            sqlx::Error::RowNotFound => StoreError::NotFound,
            sqlx::Error::Database(ref db) if db.code().as_deref() == Some("3F000") => {
                // invalid_schema_name: the schema was dropped under a live pool
                StoreError::TenantNotFound(db.message().to_string())
            }
            other => StoreError::Database(other),
        }
    }
}

impl From<models::ParseEnumError> for StoreError {
    fn from(error: models::ParseEnumError) -> Self {
        StoreError::Corrupt(error.to_string())
    }
}

impl Retryable for StoreError {
    fn is_exhausted(&self) -> bool {
        matches!(self, StoreError::Exhausted)
    }
}

#[derive(Debug, Clone)]
pub struct NewPanicAlert {
    pub user_id: i64,
    pub property_id: Option<i64>,
    pub alert_type: PanicType,
    pub location: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub transaction_id: Uuid,
    pub resident_id: i64,
    pub fee_id: Option<i64>,
    pub amount_cents: i64,
    pub currency: String,
}

#[derive(Debug, Clone)]
pub struct NewBankTransaction {
    pub posted_on: NaiveDate,
    pub amount_cents: i64,
    pub reference: Option<String>,
    pub description: Option<String>,
}

/// Inclusive date window; open ends are unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Period {
    pub start: Option<NaiveDate>,
    pub end: Option<NaiveDate>,
}

impl Period {
    pub fn contains(&self, day: NaiveDate) -> bool {
        self.start.map_or(true, |start| day >= start) && self.end.map_or(true, |end| day <= end)
    }
}

/// Result of matching a bank line, written back in one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchRecord {
    pub status: ReconciliationStatus,
    pub payment_id: Option<i64>,
    pub confidence: Option<f64>,
    pub reconciled_by: Option<i64>,
}

/// Data-access handle bound to exactly one tenant schema.
#[async_trait]
pub trait TenantClient: Send + Sync {
    fn schema(&self) -> &SchemaName;

    async fn insert_panic_alert(&self, alert: &NewPanicAlert) -> Result<PanicAlert, StoreError>;
    /// Alerts that are neither resolved nor cancelled, newest first.
    async fn open_panic_alerts(&self) -> Result<Vec<PanicAlert>, StoreError>;
    async fn find_panic_alert(&self, id: i64) -> Result<Option<PanicAlert>, StoreError>;
    /// Moves an alert out of `from`. Returns `None` when the stored status
    /// no longer equals `from`.
    async fn transition_panic_alert(
        &self,
        id: i64,
        from: PanicStatus,
        to: PanicStatus,
        actor: i64,
    ) -> Result<Option<PanicAlert>, StoreError>;
    async fn insert_panic_response(
        &self,
        alert_id: i64,
        responded_by: i64,
        action_taken: &str,
        notes: Option<&str>,
    ) -> Result<PanicResponse, StoreError>;
    async fn panic_responses(&self, alert_id: i64) -> Result<Vec<PanicResponse>, StoreError>;

    async fn find_resident(&self, id: i64) -> Result<Option<Resident>, StoreError>;
    async fn resident_fees(&self, resident_id: i64) -> Result<Vec<Fee>, StoreError>;
    async fn find_fee(&self, id: i64) -> Result<Option<Fee>, StoreError>;

    async fn insert_payment(&self, payment: &NewPayment) -> Result<Payment, StoreError>;
    async fn find_payment(&self, id: i64) -> Result<Option<Payment>, StoreError>;
    async fn find_payment_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Payment>, StoreError>;
    /// Finalises a pending payment; approving it also marks its fee paid.
    /// Returns `None` when the payment was no longer pending.
    async fn settle_payment(
        &self,
        transaction_id: Uuid,
        outcome: PaymentStatus,
        gateway_reference: &str,
    ) -> Result<Option<Payment>, StoreError>;
    /// Completed payments no bank line has been matched to yet.
    async fn unreconciled_payments(&self) -> Result<Vec<Payment>, StoreError>;

    async fn insert_bank_transactions(
        &self,
        lines: &[NewBankTransaction],
    ) -> Result<Vec<BankTransaction>, StoreError>;
    async fn bank_transactions(
        &self,
        status: Option<ReconciliationStatus>,
        period: Period,
    ) -> Result<Vec<BankTransaction>, StoreError>;
    async fn find_bank_transaction(&self, id: i64) -> Result<Option<BankTransaction>, StoreError>;
    async fn record_match(
        &self,
        bank_transaction_id: i64,
        record: &MatchRecord,
    ) -> Result<BankTransaction, StoreError>;

    /// Releases the underlying connections.
    async fn close(&self);
}

/// Opens tenant clients and manages the control-plane record of complexes.
#[async_trait]
pub trait SchemaBackend: Send + Sync {
    /// Fails with [`StoreError::TenantNotFound`] for unknown, inactive or
    /// missing schemas, without leaving anything behind.
    async fn open(&self, schema: &SchemaName) -> Result<Arc<dyn TenantClient>, StoreError>;
    /// Registers a complex and creates its schema. Safe to repeat.
    async fn provision(&self, name: &str, schema: &SchemaName) -> Result<Complex, StoreError>;
    async fn deactivate(&self, schema: &SchemaName) -> Result<(), StoreError>;
}
