use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Raised when a status column holds a value none of the enums recognise.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind} value `{value}`")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

macro_rules! text_enum {
    ($name:ident, $kind:literal, { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = ParseEnumError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok(Self::$variant),)+
                    other => Err(ParseEnumError {
                        kind: $kind,
                        value: other.to_string(),
                    }),
                }
            }
        }
    };
}

/// A residential complex registered in the control plane. Each one owns a
/// PostgreSQL schema holding all of its domain tables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Complex {
    pub id: i64,
    pub name: String,
    pub schema_name: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PanicType {
    Emergency,
    Medical,
    Fire,
    Security,
    Other,
}

text_enum!(PanicType, "panic type", {
    Emergency => "EMERGENCY",
    Medical => "MEDICAL",
    Fire => "FIRE",
    Security => "SECURITY",
    Other => "OTHER",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PanicStatus {
    Active,
    InProgress,
    Resolved,
    Cancelled,
}

text_enum!(PanicStatus, "panic status", {
    Active => "ACTIVE",
    InProgress => "IN_PROGRESS",
    Resolved => "RESOLVED",
    Cancelled => "CANCELLED",
});

impl PanicStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Cancelled)
    }

    /// Whether reception may move an alert from `self` to `next`. Staying in
    /// the same status is not a transition and is handled by the caller.
    pub fn can_transition_to(self, next: Self) -> bool {
        use PanicStatus::*;
        matches!(
            (self, next),
            (Active, InProgress | Resolved | Cancelled) | (InProgress, Resolved | Cancelled)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanicAlert {
    pub id: i64,
    pub user_id: i64,
    pub property_id: Option<i64>,
    #[serde(rename = "type")]
    pub alert_type: PanicType,
    pub location: Option<String>,
    pub description: Option<String>,
    pub status: PanicStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PanicResponse {
    pub id: i64,
    pub alert_id: i64,
    pub responded_by: i64,
    pub action_taken: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Resident {
    pub id: i64,
    pub full_name: String,
    pub email: String,
    pub unit: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeStatus {
    Pending,
    Paid,
}

text_enum!(FeeStatus, "fee status", {
    Pending => "PENDING",
    Paid => "PAID",
});

/// An administration fee owed by a resident. Amounts are in minor units.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fee {
    pub id: i64,
    pub resident_id: i64,
    pub concept: String,
    pub amount_cents: i64,
    pub due_date: NaiveDate,
    pub status: FeeStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PaymentStatus {
    Pending,
    Completed,
    Failed,
}

text_enum!(PaymentStatus, "payment status", {
    Pending => "PENDING",
    Completed => "COMPLETED",
    Failed => "FAILED",
});

impl PaymentStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payment {
    pub id: i64,
    pub transaction_id: Uuid,
    pub resident_id: i64,
    pub fee_id: Option<i64>,
    pub amount_cents: i64,
    pub currency: String,
    pub status: PaymentStatus,
    pub gateway_reference: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Payment {
    /// Day the money moved, as a bank statement would report it.
    pub fn settled_on(&self) -> NaiveDate {
        self.completed_at.unwrap_or(self.created_at).date_naive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReconciliationStatus {
    Unmatched,
    Matched,
    ManualReview,
}

text_enum!(ReconciliationStatus, "reconciliation status", {
    Unmatched => "UNMATCHED",
    Matched => "MATCHED",
    ManualReview => "MANUAL_REVIEW",
});

/// One line of an uploaded bank statement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankTransaction {
    pub id: i64,
    pub posted_on: NaiveDate,
    pub amount_cents: i64,
    pub reference: Option<String>,
    pub description: Option<String>,
    pub status: ReconciliationStatus,
    pub matched_payment_id: Option<i64>,
    pub confidence: Option<f64>,
    pub reconciled_by: Option<i64>,
}
