use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use models::{
    BankTransaction, Complex, Fee, PanicAlert, PanicResponse, PanicStatus, Payment, PaymentStatus,
    ReconciliationStatus, Resident,
};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions, PgRow},
    Executor, Pool, Postgres, Row,
};
use uuid::Uuid;

use super::{
    MatchRecord, NewBankTransaction, NewPanicAlert, NewPayment, Period, SchemaBackend, StoreError,
    TenantClient,
};
use crate::{config::RegistryConfig, tenant::SchemaName};

/// Opens one pool per tenant. Every connection in a tenant pool starts with
/// `search_path` set to that tenant's schema, so queries below never name a
/// schema and cannot reach another tenant's tables.
pub struct PgBackend {
    control: Pool<Postgres>,
    connect_options: PgConnectOptions,
    max_connections: u32,
    acquire_timeout: Duration,
}

impl PgBackend {
    pub fn new(control: Pool<Postgres>, connect_options: PgConnectOptions, config: &RegistryConfig) -> Self {
        Self {
            control,
            connect_options,
            max_connections: config.pool_max_connections,
            acquire_timeout: config.pool_acquire_timeout,
        }
    }

    async fn schema_is_live(&self, schema: &SchemaName) -> Result<bool, StoreError> {
        let live: bool = sqlx::query_scalar(
            r#"
                SELECT EXISTS (
                    SELECT 1
                    FROM residential_complexes c
                    JOIN information_schema.schemata s ON s.schema_name = c.schema_name
                    WHERE c.schema_name = $1 AND c.is_active
                )
            "#,
        )
        .bind(schema.as_str())
        .fetch_one(&self.control)
        .await?;
        Ok(live)
    }
}

#[async_trait]
impl SchemaBackend for PgBackend {
    async fn open(&self, schema: &SchemaName) -> Result<Arc<dyn TenantClient>, StoreError> {
        if !self.schema_is_live(schema).await? {
            return Err(StoreError::TenantNotFound(schema.to_string()));
        }

        let options = self
            .connect_options
            .clone()
            .options([("search_path", schema.as_str())]);
        let pool = PgPoolOptions::new()
            .max_connections(self.max_connections)
            .acquire_timeout(self.acquire_timeout)
            .connect_lazy_with(options);

        Ok(Arc::new(PgTenantClient {
            schema: schema.clone(),
            pool,
        }))
    }

    async fn provision(&self, name: &str, schema: &SchemaName) -> Result<Complex, StoreError> {
        let mut tx = self.control.begin().await?;
        let row = sqlx::query(
            r#"
                INSERT INTO residential_complexes (name, schema_name, is_active)
                VALUES ($1, $2, TRUE)
                ON CONFLICT (schema_name)
                DO UPDATE SET name = EXCLUDED.name, is_active = TRUE
                RETURNING id, name, schema_name, is_active, created_at
            "#,
        )
        .bind(name)
        .bind(schema.as_str())
        .fetch_one(&mut *tx)
        .await?;

        for statement in schema_ddl(schema) {
            (&mut *tx).execute(statement.as_str()).await?;
        }
        tx.commit().await?;

        tracing::info!(tenant = %schema, "provisioned tenant schema");
        Ok(Complex {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            schema_name: row.try_get("schema_name")?,
            is_active: row.try_get("is_active")?,
            created_at: row.try_get("created_at")?,
        })
    }

    async fn deactivate(&self, schema: &SchemaName) -> Result<(), StoreError> {
        let updated = sqlx::query(
            r#"UPDATE residential_complexes SET is_active = FALSE WHERE schema_name = $1"#,
        )
        .bind(schema.as_str())
        .execute(&self.control)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::TenantNotFound(schema.to_string()));
        }
        Ok(())
    }
}

/// Idempotent DDL creating a tenant schema and its tables.
fn schema_ddl(schema: &SchemaName) -> Vec<String> {
    let s = schema.as_str();
    vec![
        format!(r#"CREATE SCHEMA IF NOT EXISTS "{s}""#),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{s}".residents (
                id          BIGSERIAL PRIMARY KEY,
                full_name   TEXT NOT NULL,
                email       TEXT NOT NULL,
                unit        TEXT NOT NULL,
                created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{s}".fees (
                id            BIGSERIAL PRIMARY KEY,
                resident_id   BIGINT NOT NULL REFERENCES "{s}".residents(id),
                concept       TEXT NOT NULL,
                amount_cents  BIGINT NOT NULL,
                due_date      DATE NOT NULL,
                status        TEXT NOT NULL DEFAULT 'PENDING',
                created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{s}".payments (
                id                 BIGSERIAL PRIMARY KEY,
                transaction_id     UUID NOT NULL UNIQUE,
                resident_id        BIGINT NOT NULL REFERENCES "{s}".residents(id),
                fee_id             BIGINT REFERENCES "{s}".fees(id),
                amount_cents       BIGINT NOT NULL,
                currency           TEXT NOT NULL DEFAULT 'COP',
                status             TEXT NOT NULL DEFAULT 'PENDING',
                gateway_reference  TEXT,
                created_at         TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                completed_at       TIMESTAMPTZ
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{s}".bank_transactions (
                id                  BIGSERIAL PRIMARY KEY,
                posted_on           DATE NOT NULL,
                amount_cents        BIGINT NOT NULL,
                reference           TEXT,
                description         TEXT,
                status              TEXT NOT NULL DEFAULT 'UNMATCHED',
                matched_payment_id  BIGINT UNIQUE REFERENCES "{s}".payments(id),
                confidence          DOUBLE PRECISION,
                reconciled_by       BIGINT,
                created_at          TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{s}".panic_alerts (
                id           BIGSERIAL PRIMARY KEY,
                user_id      BIGINT NOT NULL,
                property_id  BIGINT,
                alert_type   TEXT NOT NULL,
                location     TEXT,
                description  TEXT,
                status       TEXT NOT NULL DEFAULT 'ACTIVE',
                created_at   TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                resolved_at  TIMESTAMPTZ,
                resolved_by  BIGINT
            )"#
        ),
        format!(
            r#"CREATE TABLE IF NOT EXISTS "{s}".panic_responses (
                id            BIGSERIAL PRIMARY KEY,
                alert_id      BIGINT NOT NULL REFERENCES "{s}".panic_alerts(id),
                responded_by  BIGINT NOT NULL,
                action_taken  TEXT NOT NULL,
                notes         TEXT,
                created_at    TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )"#
        ),
        format!(
            r#"CREATE INDEX IF NOT EXISTS panic_alerts_status_idx ON "{s}".panic_alerts (status)"#
        ),
    ]
}

pub struct PgTenantClient {
    schema: SchemaName,
    pool: Pool<Postgres>,
}

const ALERT_COLUMNS: &str = "id, user_id, property_id, alert_type, location, description, status, created_at, resolved_at, resolved_by";
const PAYMENT_COLUMNS: &str = "id, transaction_id, resident_id, fee_id, amount_cents, currency, status, gateway_reference, created_at, completed_at";
const BANK_COLUMNS: &str = "id, posted_on, amount_cents, reference, description, status, matched_payment_id, confidence, reconciled_by";

fn alert_from_row(row: &PgRow) -> Result<PanicAlert, StoreError> {
    let alert_type: String = row.try_get("alert_type")?;
    let status: String = row.try_get("status")?;
    Ok(PanicAlert {
        id: row.try_get("id")?,
        user_id: row.try_get("user_id")?,
        property_id: row.try_get("property_id")?,
        alert_type: alert_type.parse()?,
        location: row.try_get("location")?,
        description: row.try_get("description")?,
        status: status.parse()?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
        resolved_by: row.try_get("resolved_by")?,
    })
}

fn response_from_row(row: &PgRow) -> Result<PanicResponse, StoreError> {
    Ok(PanicResponse {
        id: row.try_get("id")?,
        alert_id: row.try_get("alert_id")?,
        responded_by: row.try_get("responded_by")?,
        action_taken: row.try_get("action_taken")?,
        notes: row.try_get("notes")?,
        created_at: row.try_get("created_at")?,
    })
}

fn fee_from_row(row: &PgRow) -> Result<Fee, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Fee {
        id: row.try_get("id")?,
        resident_id: row.try_get("resident_id")?,
        concept: row.try_get("concept")?,
        amount_cents: row.try_get("amount_cents")?,
        due_date: row.try_get::<NaiveDate, _>("due_date")?,
        status: status.parse()?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(Payment {
        id: row.try_get("id")?,
        transaction_id: row.try_get("transaction_id")?,
        resident_id: row.try_get("resident_id")?,
        fee_id: row.try_get("fee_id")?,
        amount_cents: row.try_get("amount_cents")?,
        currency: row.try_get("currency")?,
        status: status.parse()?,
        gateway_reference: row.try_get("gateway_reference")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn bank_from_row(row: &PgRow) -> Result<BankTransaction, StoreError> {
    let status: String = row.try_get("status")?;
    Ok(BankTransaction {
        id: row.try_get("id")?,
        posted_on: row.try_get("posted_on")?,
        amount_cents: row.try_get("amount_cents")?,
        reference: row.try_get("reference")?,
        description: row.try_get("description")?,
        status: status.parse()?,
        matched_payment_id: row.try_get("matched_payment_id")?,
        confidence: row.try_get("confidence")?,
        reconciled_by: row.try_get("reconciled_by")?,
    })
}

#[async_trait]
impl TenantClient for PgTenantClient {
    fn schema(&self) -> &SchemaName {
        &self.schema
    }

    async fn insert_panic_alert(&self, alert: &NewPanicAlert) -> Result<PanicAlert, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO panic_alerts (user_id, property_id, alert_type, location, description, status)
             VALUES ($1, $2, $3, $4, $5, 'ACTIVE')
             RETURNING {ALERT_COLUMNS}"
        ))
        .bind(alert.user_id)
        .bind(alert.property_id)
        .bind(alert.alert_type.as_str())
        .bind(&alert.location)
        .bind(&alert.description)
        .fetch_one(&self.pool)
        .await?;
        alert_from_row(&row)
    }

    async fn open_panic_alerts(&self) -> Result<Vec<PanicAlert>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {ALERT_COLUMNS} FROM panic_alerts
             WHERE status NOT IN ('RESOLVED', 'CANCELLED')
             ORDER BY created_at DESC, id DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn find_panic_alert(&self, id: i64) -> Result<Option<PanicAlert>, StoreError> {
        let row = sqlx::query(&format!("SELECT {ALERT_COLUMNS} FROM panic_alerts WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn transition_panic_alert(
        &self,
        id: i64,
        from: PanicStatus,
        to: PanicStatus,
        actor: i64,
    ) -> Result<Option<PanicAlert>, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE panic_alerts
             SET status = $3,
                 resolved_at = CASE WHEN $4 THEN NOW() ELSE resolved_at END,
                 resolved_by = CASE WHEN $4 THEN $5 ELSE resolved_by END
             WHERE id = $1 AND status = $2
             RETURNING {ALERT_COLUMNS}"
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(to == PanicStatus::Resolved)
        .bind(actor)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn insert_panic_response(
        &self,
        alert_id: i64,
        responded_by: i64,
        action_taken: &str,
        notes: Option<&str>,
    ) -> Result<PanicResponse, StoreError> {
        let row = sqlx::query(
            r#"
                INSERT INTO panic_responses (alert_id, responded_by, action_taken, notes)
                SELECT id, $2, $3, $4 FROM panic_alerts WHERE id = $1
                RETURNING id, alert_id, responded_by, action_taken, notes, created_at
            "#,
        )
        .bind(alert_id)
        .bind(responded_by)
        .bind(action_taken)
        .bind(notes)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref()
            .map(response_from_row)
            .transpose()?
            .ok_or(StoreError::NotFound)
    }

    async fn panic_responses(&self, alert_id: i64) -> Result<Vec<PanicResponse>, StoreError> {
        let rows = sqlx::query(
            r#"
                SELECT id, alert_id, responded_by, action_taken, notes, created_at
                FROM panic_responses
                WHERE alert_id = $1
                ORDER BY created_at, id
            "#,
        )
        .bind(alert_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(response_from_row).collect()
    }

    async fn find_resident(&self, id: i64) -> Result<Option<Resident>, StoreError> {
        let row = sqlx::query(r#"SELECT id, full_name, email, unit FROM residents WHERE id = $1"#)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| {
            Ok::<_, StoreError>(Resident {
                id: row.try_get("id")?,
                full_name: row.try_get("full_name")?,
                email: row.try_get("email")?,
                unit: row.try_get("unit")?,
            })
        })
        .transpose()
    }

    async fn resident_fees(&self, resident_id: i64) -> Result<Vec<Fee>, StoreError> {
        let rows = sqlx::query(
            r#"
                SELECT id, resident_id, concept, amount_cents, due_date, status
                FROM fees
                WHERE resident_id = $1
                ORDER BY due_date
            "#,
        )
        .bind(resident_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(fee_from_row).collect()
    }

    async fn find_fee(&self, id: i64) -> Result<Option<Fee>, StoreError> {
        let row = sqlx::query(
            r#"SELECT id, resident_id, concept, amount_cents, due_date, status FROM fees WHERE id = $1"#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(fee_from_row).transpose()
    }

    async fn insert_payment(&self, payment: &NewPayment) -> Result<Payment, StoreError> {
        let row = sqlx::query(&format!(
            "INSERT INTO payments (transaction_id, resident_id, fee_id, amount_cents, currency, status)
             VALUES ($1, $2, $3, $4, $5, 'PENDING')
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(payment.transaction_id)
        .bind(payment.resident_id)
        .bind(payment.fee_id)
        .bind(payment.amount_cents)
        .bind(&payment.currency)
        .fetch_one(&self.pool)
        .await?;
        payment_from_row(&row)
    }

    async fn find_payment(&self, id: i64) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn find_payment_by_transaction(
        &self,
        transaction_id: Uuid,
    ) -> Result<Option<Payment>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments WHERE transaction_id = $1"
        ))
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn settle_payment(
        &self,
        transaction_id: Uuid,
        outcome: PaymentStatus,
        gateway_reference: &str,
    ) -> Result<Option<Payment>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(&format!(
            "UPDATE payments
             SET status = $2, gateway_reference = $3, completed_at = NOW()
             WHERE transaction_id = $1 AND status = 'PENDING'
             RETURNING {PAYMENT_COLUMNS}"
        ))
        .bind(transaction_id)
        .bind(outcome.as_str())
        .bind(gateway_reference)
        .fetch_optional(&mut *tx)
        .await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let payment = payment_from_row(&row)?;

        if let (PaymentStatus::Completed, Some(fee_id)) = (outcome, payment.fee_id) {
            sqlx::query(r#"UPDATE fees SET status = 'PAID' WHERE id = $1"#)
                .bind(fee_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(Some(payment))
    }

    async fn unreconciled_payments(&self) -> Result<Vec<Payment>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {PAYMENT_COLUMNS} FROM payments p
             WHERE p.status = 'COMPLETED'
               AND NOT EXISTS (
                   SELECT 1 FROM bank_transactions b WHERE b.matched_payment_id = p.id
               )
             ORDER BY p.completed_at, p.id"
        ))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(payment_from_row).collect()
    }

    async fn insert_bank_transactions(
        &self,
        lines: &[NewBankTransaction],
    ) -> Result<Vec<BankTransaction>, StoreError> {
        let mut tx = self.pool.begin().await?;
        let mut stored = Vec::with_capacity(lines.len());
        for line in lines {
            let row = sqlx::query(&format!(
                "INSERT INTO bank_transactions (posted_on, amount_cents, reference, description, status)
                 VALUES ($1, $2, $3, $4, 'UNMATCHED')
                 RETURNING {BANK_COLUMNS}"
            ))
            .bind(line.posted_on)
            .bind(line.amount_cents)
            .bind(&line.reference)
            .bind(&line.description)
            .fetch_one(&mut *tx)
            .await?;
            stored.push(bank_from_row(&row)?);
        }
        tx.commit().await?;
        Ok(stored)
    }

    async fn bank_transactions(
        &self,
        status: Option<ReconciliationStatus>,
        period: Period,
    ) -> Result<Vec<BankTransaction>, StoreError> {
        let rows = sqlx::query(&format!(
            "SELECT {BANK_COLUMNS} FROM bank_transactions
             WHERE ($1::TEXT IS NULL OR status = $1)
               AND ($2::DATE IS NULL OR posted_on >= $2)
               AND ($3::DATE IS NULL OR posted_on <= $3)
             ORDER BY posted_on, id"
        ))
        .bind(status.map(ReconciliationStatus::as_str))
        .bind(period.start)
        .bind(period.end)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bank_from_row).collect()
    }

    async fn find_bank_transaction(&self, id: i64) -> Result<Option<BankTransaction>, StoreError> {
        let row = sqlx::query(&format!(
            "SELECT {BANK_COLUMNS} FROM bank_transactions WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(bank_from_row).transpose()
    }

    async fn record_match(
        &self,
        bank_transaction_id: i64,
        record: &MatchRecord,
    ) -> Result<BankTransaction, StoreError> {
        let row = sqlx::query(&format!(
            "UPDATE bank_transactions
             SET status = $2, matched_payment_id = $3, confidence = $4, reconciled_by = $5
             WHERE id = $1
             RETURNING {BANK_COLUMNS}"
        ))
        .bind(bank_transaction_id)
        .bind(record.status.as_str())
        .bind(record.payment_id)
        .bind(record.confidence)
        .bind(record.reconciled_by)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| match error {
            sqlx::Error::Database(ref db) if db.is_unique_violation() => StoreError::Conflict(
                format!("payment {:?} is already reconciled", record.payment_id),
            ),
            other => other.into(),
        })?;
        row.as_ref()
            .map(bank_from_row)
            .transpose()?
            .ok_or(StoreError::NotFound)
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
