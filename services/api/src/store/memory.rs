//! In-process backend. Each tenant gets its own isolated data set, mirroring
//! the schema-per-tenant layout of the PostgreSQL backend.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveTime, Utc};
use models::{
    BankTransaction, Complex, Fee, FeeStatus, PanicAlert, PanicResponse, PanicStatus, Payment,
    PaymentStatus, ReconciliationStatus, Resident,
};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{
    MatchRecord, NewBankTransaction, NewPanicAlert, NewPayment, Period, SchemaBackend, StoreError,
    TenantClient,
};
use crate::tenant::SchemaName;

#[derive(Default)]
struct TenantData {
    next_id: i64,
    residents: Vec<Resident>,
    fees: Vec<Fee>,
    payments: Vec<Payment>,
    bank_transactions: Vec<BankTransaction>,
    panic_alerts: Vec<PanicAlert>,
    panic_responses: Vec<PanicResponse>,
}

impl TenantData {
    fn next_id(&mut self) -> i64 {
        self.next_id += 1;
        self.next_id
    }

    /// Keeps generated ids clear of explicitly seeded ones.
    fn observe_id(&mut self, id: i64) {
        self.next_id = self.next_id.max(id);
    }
}

struct Slot {
    complex: Complex,
    data: Arc<Mutex<TenantData>>,
}

#[derive(Default)]
pub struct MemoryBackend {
    tenants: Mutex<HashMap<SchemaName, Slot>>,
    opens: AtomicUsize,
    closes: Arc<AtomicUsize>,
    exhausted_opens: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of clients opened so far.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Number of clients closed so far, by the registry or anyone else.
    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// Makes the next `n` opens fail as if the connection pool were saturated.
    pub fn exhaust_next_opens(&self, n: usize) {
        self.exhausted_opens.store(n, Ordering::SeqCst);
    }

    /// Direct access to a tenant's data for seeding fixtures.
    pub fn seed(&self, schema: &SchemaName) -> Option<TenantSeed> {
        self.tenants.lock().get(schema).map(|slot| TenantSeed {
            data: slot.data.clone(),
        })
    }

    fn take_exhaustion(&self) -> bool {
        self.exhausted_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SchemaBackend for MemoryBackend {
    async fn open(&self, schema: &SchemaName) -> Result<Arc<dyn TenantClient>, StoreError> {
        if self.take_exhaustion() {
            return Err(StoreError::Exhausted);
        }
        let tenants = self.tenants.lock();
        let slot = tenants
            .get(schema)
            .filter(|slot| slot.complex.is_active)
            .ok_or_else(|| StoreError::TenantNotFound(schema.to_string()))?;
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryClient {
            schema: schema.clone(),
            data: slot.data.clone(),
            closes: self.closes.clone(),
        }))
    }

    async fn provision(&self, name: &str, schema: &SchemaName) -> Result<Complex, StoreError> {
        let mut tenants = self.tenants.lock();
        let next_id = tenants.len() as i64 + 1;
        let slot = tenants.entry(schema.clone()).or_insert_with(|| Slot {
            complex: Complex {
                id: next_id,
                name: name.to_string(),
                schema_name: schema.to_string(),
                is_active: true,
                created_at: Utc::now(),
            },
            data: Arc::default(),
        });
        slot.complex.name = name.to_string();
        slot.complex.is_active = true;
        Ok(slot.complex.clone())
    }

    async fn deactivate(&self, schema: &SchemaName) -> Result<(), StoreError> {
        let mut tenants = self.tenants.lock();
        let slot = tenants
            .get_mut(schema)
            .ok_or_else(|| StoreError::TenantNotFound(schema.to_string()))?;
        slot.complex.is_active = false;
        Ok(())
    }
}

/// Fixture writer for one tenant.
pub struct TenantSeed {
    data: Arc<Mutex<TenantData>>,
}

impl TenantSeed {
    pub fn resident(&self, resident: Resident) -> &Self {
        let mut data = self.data.lock();
        data.observe_id(resident.id);
        data.residents.push(resident);
        self
    }

    pub fn fee(&self, fee: Fee) -> &Self {
        let mut data = self.data.lock();
        data.observe_id(fee.id);
        data.fees.push(fee);
        self
    }

    pub fn payment(&self, payment: Payment) -> &Self {
        let mut data = self.data.lock();
        data.observe_id(payment.id);
        data.payments.push(payment);
        self
    }

    pub fn panic_alert(&self, alert: PanicAlert) -> &Self {
        let mut data = self.data.lock();
        data.observe_id(alert.id);
        data.panic_alerts.push(alert);
        self
    }
}

pub struct MemoryClient {
    schema: SchemaName,
    data: Arc<Mutex<TenantData>>,
    closes: Arc<AtomicUsize>,
}

#[async_trait]
impl TenantClient for MemoryClient {
    fn schema(&self) -> &SchemaName {
        &self.schema
    }

    async fn insert_panic_alert(&self, alert: &NewPanicAlert) -> Result<PanicAlert, StoreError> {
        let mut data = self.data.lock();
        let stored = PanicAlert {
            id: data.next_id(),
            user_id: alert.user_id,
            property_id: alert.property_id,
            alert_type: alert.alert_type,
            location: alert.location.clone(),
            description: alert.description.clone(),
            status: PanicStatus::Active,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        };
        data.panic_alerts.push(stored.clone());
        Ok(stored)
    }

    async fn open_panic_alerts(&self) -> Result<Vec<PanicAlert>, StoreError> {
        let data = self.data.lock();
        let mut open: Vec<PanicAlert> = data
            .panic_alerts
            .iter()
            .filter(|alert| !alert.status.is_terminal())
            .cloned()
            .collect();
        open.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(open)
    }

    async fn find_panic_alert(&self, id: i64) -> Result<Option<PanicAlert>, StoreError> {
        let data = self.data.lock();
        Ok(data.panic_alerts.iter().find(|alert| alert.id == id).cloned())
    }

    async fn transition_panic_alert(
        &self,
        id: i64,
        from: PanicStatus,
        to: PanicStatus,
        actor: i64,
    ) -> Result<Option<PanicAlert>, StoreError> {
        let mut data = self.data.lock();
        let Some(alert) = data
            .panic_alerts
            .iter_mut()
            .find(|alert| alert.id == id && alert.status == from)
        else {
            return Ok(None);
        };
        alert.status = to;
        if to == PanicStatus::Resolved {
            alert.resolved_at = Some(Utc::now());
            alert.resolved_by = Some(actor);
        }
        Ok(Some(alert.clone()))
    }

    async fn insert_panic_response(
        &self,
        alert_id: i64,
        responded_by: i64,
        action_taken: &str,
        notes: Option<&str>,
    ) -> Result<PanicResponse, StoreError> {
        let mut data = self.data.lock();
        if !data.panic_alerts.iter().any(|alert| alert.id == alert_id) {
            return Err(StoreError::NotFound);
        }
        let response = PanicResponse {
            id: data.next_id(),
            alert_id,
            responded_by,
            action_taken: action_taken.to_string(),
            notes: notes.map(str::to_string),
            created_at: Utc::now(),
        };
        data.panic_responses.push(response.clone());
        Ok(response)
    }

    async fn panic_responses(&self, alert_id: i64) -> Result<Vec<PanicResponse>, StoreError> {
        let data = self.data.lock();
        Ok(data
            .panic_responses
            .iter()
            .filter(|response| response.alert_id == alert_id)
            .cloned()
            .collect())
    }

    async fn find_resident(&self, id: i64) -> Result<Option<Resident>, StoreError> {
        let data = self.data.lock();
        Ok(data.residents.iter().find(|r| r.id == id).cloned())
    }

    async fn resident_fees(&self, resident_id: i64) -> Result<Vec<Fee>, StoreError> {
        let data = self.data.lock();
        Ok(data
            .fees
            .iter()
            .filter(|fee| fee.resident_id == resident_id)
            .cloned()
            .collect())
    }

    async fn find_fee(&self, id: i64) -> Result<Option<Fee>, StoreError> {
        let data = self.data.lock();
        Ok(data.fees.iter().find(|fee| fee.id == id).cloned())
    }

    async fn insert_payment(&self, payment: &NewPayment) -> Result<Payment, StoreError> {
        let mut data = self.data.lock();
        if data
            .payments
            .iter()
            .any(|p| p.transaction_id == payment.transaction_id)
        {
            return Err(StoreError::Conflict("duplicate transaction id".into()));
        }
        let stored = Payment {
            id: data.next_id(),
            transaction_id: payment.transaction_id,
            resident_id: payment.resident_id,
            fee_id: payment.fee_id,
            amount_cents: payment.amount_cents,
            currency: payment.currency.clone(),
            status: PaymentStatus::Pending,
            gateway_reference: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        data.payments.push(stored.clone());
        Ok(stored)
    }

    async fn find_payment(&self, id: i64) -> Result<Option<Payment>, StoreError> {
        let data = self.data.lock();
        Ok(data.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Payment>, StoreError> {
        let data = self.data.lock();
        Ok(data
            .payments
            .iter()
            .find(|p| p.transaction_id == transaction_id)
            .cloned())
    }

    async fn settle_payment(
        &self,
        transaction_id: Uuid,
        outcome: PaymentStatus,
        gateway_reference: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let mut data = self.data.lock();
        let Some(payment) = data
            .payments
            .iter_mut()
            .find(|p| p.transaction_id == transaction_id && p.status == PaymentStatus::Pending)
        else {
            return Ok(None);
        };
        payment.status = outcome;
        payment.gateway_reference = Some(gateway_reference.to_string());
        payment.completed_at = Some(Utc::now());
        let settled = payment.clone();

        if outcome == PaymentStatus::Completed {
            if let Some(fee_id) = settled.fee_id {
                if let Some(fee) = data.fees.iter_mut().find(|fee| fee.id == fee_id) {
                    fee.status = FeeStatus::Paid;
                }
            }
        }
        Ok(Some(settled))
    }

    async fn unreconciled_payments(&self) -> Result<Vec<Payment>, StoreError> {
        let data = self.data.lock();
        Ok(data
            .payments
            .iter()
            .filter(|p| p.status == PaymentStatus::Completed)
            .filter(|p| {
                !data
                    .bank_transactions
                    .iter()
                    .any(|tx| tx.matched_payment_id == Some(p.id))
            })
            .cloned()
            .collect())
    }

    async fn insert_bank_transactions(
        &self,
        lines: &[NewBankTransaction],
    ) -> Result<Vec<BankTransaction>, StoreError> {
        let mut data = self.data.lock();
        let mut stored = Vec::with_capacity(lines.len());
        for line in lines {
            let tx = BankTransaction {
                id: data.next_id(),
                posted_on: line.posted_on,
                amount_cents: line.amount_cents,
                reference: line.reference.clone(),
                description: line.description.clone(),
                status: ReconciliationStatus::Unmatched,
                matched_payment_id: None,
                confidence: None,
                reconciled_by: None,
            };
            data.bank_transactions.push(tx.clone());
            stored.push(tx);
        }
        Ok(stored)
    }

    async fn bank_transactions(
        &self,
        status: Option<ReconciliationStatus>,
        period: Period,
    ) -> Result<Vec<BankTransaction>, StoreError> {
        let data = self.data.lock();
        let mut lines: Vec<BankTransaction> = data
            .bank_transactions
            .iter()
            .filter(|tx| status.map_or(true, |wanted| tx.status == wanted))
            .filter(|tx| period.contains(tx.posted_on))
            .cloned()
            .collect();
        lines.sort_by_key(|tx| (tx.posted_on, tx.id));
        Ok(lines)
    }

    async fn find_bank_transaction(&self, id: i64) -> Result<Option<BankTransaction>, StoreError> {
        let data = self.data.lock();
        Ok(data.bank_transactions.iter().find(|tx| tx.id == id).cloned())
    }

    async fn record_match(
        &self,
        bank_transaction_id: i64,
        record: &MatchRecord,
    ) -> Result<BankTransaction, StoreError> {
        let mut data = self.data.lock();
        if let Some(payment_id) = record.payment_id {
            let taken = data.bank_transactions.iter().any(|tx| {
                tx.id != bank_transaction_id && tx.matched_payment_id == Some(payment_id)
            });
            if taken {
                return Err(StoreError::Conflict(format!(
                    "payment {payment_id} is already reconciled"
                )));
            }
        }
        let tx = data
            .bank_transactions
            .iter_mut()
            .find(|tx| tx.id == bank_transaction_id)
            .ok_or(StoreError::NotFound)?;
        tx.status = record.status;
        tx.matched_payment_id = record.payment_id;
        tx.confidence = record.confidence;
        tx.reconciled_by = record.reconciled_by;
        Ok(tx.clone())
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

/// Fixture helpers used by tests that build records by hand.
pub mod fixtures {
    use super::*;

    pub fn resident(id: i64, full_name: &str, email: &str, unit: &str) -> Resident {
        Resident {
            id,
            full_name: full_name.to_string(),
            email: email.to_string(),
            unit: unit.to_string(),
        }
    }

    pub fn fee(
        id: i64,
        resident_id: i64,
        amount_cents: i64,
        due_date: NaiveDate,
        status: FeeStatus,
    ) -> Fee {
        Fee {
            id,
            resident_id,
            concept: "Cuota de administración".to_string(),
            amount_cents,
            due_date,
            status,
        }
    }

    pub fn active_alert(id: i64, user_id: i64) -> PanicAlert {
        PanicAlert {
            id,
            user_id,
            property_id: None,
            alert_type: models::PanicType::Emergency,
            location: Some("Torre 2, apto 301".to_string()),
            description: None,
            status: PanicStatus::Active,
            created_at: Utc::now(),
            resolved_at: None,
            resolved_by: None,
        }
    }

    pub fn completed_payment(id: i64, amount_cents: i64, settled_on: NaiveDate) -> Payment {
        let settled_at = settled_on.and_time(NaiveTime::MIN).and_utc();
        Payment {
            id,
            transaction_id: Uuid::new_v4(),
            resident_id: 1,
            fee_id: None,
            amount_cents,
            currency: "COP".to_string(),
            status: PaymentStatus::Completed,
            gateway_reference: Some(format!("GW-{id}")),
            created_at: settled_at,
            completed_at: Some(settled_at),
        }
    }
}
