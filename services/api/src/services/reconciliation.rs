use std::{collections::HashSet, sync::Arc};

use dto::{
    BulkReconciliationOutcome, ManualReconciliationRequest, Pagination,
    ProcessReconciliationRequest, ReconciliationResult, ReconciliationStats, StatementLine,
};
use models::{BankTransaction, Payment, PaymentStatus, ReconciliationStatus};
use serde::{Deserialize, Serialize};

use crate::{
    error::ApiError,
    store::{MatchRecord, NewBankTransaction, Period},
    tenant::{
        registry::{ClientRegistry, ScopedClient},
        SchemaName,
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchingRule {
    ReferenceMatch,
    ExactAmountDate,
    AmountTolerance,
    PartialMatch,
}

impl MatchingRule {
    fn name(self) -> &'static str {
        match self {
            Self::ReferenceMatch => "reference_match",
            Self::ExactAmountDate => "exact_amount_date",
            Self::AmountTolerance => "amount_tolerance",
            Self::PartialMatch => "partial_match",
        }
    }

    /// Lower ranks win when two candidates score the same confidence.
    fn rank(self) -> u8 {
        match self {
            Self::ReferenceMatch => 0,
            Self::ExactAmountDate => 1,
            Self::AmountTolerance => 2,
            Self::PartialMatch => 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReconciliationConfig {
    pub amount_tolerance_cents: i64,
    pub date_tolerance_days: i64,
    pub auto_match: bool,
    pub matching_rules: Vec<MatchingRule>,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            amount_tolerance_cents: 1,
            date_tolerance_days: 3,
            auto_match: true,
            matching_rules: vec![
                MatchingRule::ExactAmountDate,
                MatchingRule::AmountTolerance,
                MatchingRule::ReferenceMatch,
                MatchingRule::PartialMatch,
            ],
        }
    }
}

impl ReconciliationConfig {
    fn with_overrides(&self, request: &ProcessReconciliationRequest) -> Self {
        Self {
            amount_tolerance_cents: request
                .amount_tolerance_cents
                .unwrap_or(self.amount_tolerance_cents)
                .max(0),
            date_tolerance_days: request
                .date_tolerance_days
                .unwrap_or(self.date_tolerance_days)
                .max(0),
            auto_match: request.auto_match.unwrap_or(self.auto_match),
            matching_rules: self.matching_rules.clone(),
        }
    }
}

/// Matches at or above this confidence are applied without review.
const AUTO_MATCH_CONFIDENCE: f64 = 0.9;
/// Partial matches accept amounts within this fraction of the payment.
const PARTIAL_AMOUNT_RATIO: f64 = 0.10;
/// Largest statement amount accepted, in either direction.
pub const MAX_STATEMENT_AMOUNT_CENTS: i64 = 1_000_000_000_000_000;
pub const MAX_BULK_RECONCILIATIONS: usize = 500;
pub const DEFAULT_PAGE_SIZE: u32 = 10;
pub const MAX_PAGE_SIZE: u32 = 100;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub payment_id: i64,
    pub rule: MatchingRule,
    pub confidence: f64,
    day_gap: i64,
}

fn score(
    line: &BankTransaction,
    payment: &Payment,
    config: &ReconciliationConfig,
) -> Option<(MatchingRule, f64)> {
    let amount_gap = line.amount_cents.abs_diff(payment.amount_cents);
    let day_gap = (line.posted_on - payment.settled_on()).num_days().abs();
    let enabled = |rule| config.matching_rules.contains(&rule);

    let reference_hit = line.reference.as_deref().map(str::trim).is_some_and(|reference| {
        !reference.is_empty()
            && (reference.eq_ignore_ascii_case(&payment.transaction_id.to_string())
                || payment
                    .gateway_reference
                    .as_deref()
                    .is_some_and(|gateway| gateway.eq_ignore_ascii_case(reference)))
    });

    if enabled(MatchingRule::ReferenceMatch) && reference_hit {
        return Some((MatchingRule::ReferenceMatch, 1.0));
    }
    if enabled(MatchingRule::ExactAmountDate) && amount_gap == 0 && day_gap == 0 {
        return Some((MatchingRule::ExactAmountDate, 1.0));
    }
    let within_days = day_gap <= config.date_tolerance_days;
    if enabled(MatchingRule::AmountTolerance)
        && within_days
        && amount_gap <= config.amount_tolerance_cents.max(0).unsigned_abs()
    {
        return Some((MatchingRule::AmountTolerance, AUTO_MATCH_CONFIDENCE));
    }
    let partial_limit = (payment.amount_cents.unsigned_abs() as f64 * PARTIAL_AMOUNT_RATIO).round() as u64;
    if enabled(MatchingRule::PartialMatch) && within_days && amount_gap <= partial_limit {
        return Some((MatchingRule::PartialMatch, 0.5));
    }
    None
}

/// Picks the best payment for a statement line. Ties go to the stronger rule,
/// then the closest date, then the oldest payment.
pub fn best_candidate<'a>(
    line: &BankTransaction,
    payments: impl IntoIterator<Item = &'a Payment>,
    config: &ReconciliationConfig,
) -> Option<Candidate> {
    payments
        .into_iter()
        .filter(|payment| payment.status == PaymentStatus::Completed)
        .filter_map(|payment| {
            score(line, payment, config).map(|(rule, confidence)| Candidate {
                payment_id: payment.id,
                rule,
                confidence,
                day_gap: (line.posted_on - payment.settled_on()).num_days().abs(),
            })
        })
        .min_by(|a, b| {
            b.confidence
                .total_cmp(&a.confidence)
                .then(a.rule.rank().cmp(&b.rule.rank()))
                .then(a.day_gap.cmp(&b.day_gap))
                .then(a.payment_id.cmp(&b.payment_id))
        })
}

fn outcome_for(
    candidate: Option<Candidate>,
    config: &ReconciliationConfig,
) -> (ReconciliationStatus, Option<i64>) {
    match candidate {
        Some(c) if c.confidence >= AUTO_MATCH_CONFIDENCE && config.auto_match => {
            (ReconciliationStatus::Matched, Some(c.payment_id))
        }
        Some(_) => (ReconciliationStatus::ManualReview, None),
        None => (ReconciliationStatus::Unmatched, None),
    }
}

#[derive(Clone)]
pub struct ReconciliationService {
    registry: Arc<ClientRegistry>,
    config: ReconciliationConfig,
}

impl ReconciliationService {
    pub fn new(registry: Arc<ClientRegistry>, config: ReconciliationConfig) -> Self {
        Self { registry, config }
    }

    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    pub async fn upload(
        &self,
        tenant: &SchemaName,
        lines: Vec<StatementLine>,
    ) -> Result<Vec<BankTransaction>, ApiError> {
        if lines.is_empty() {
            return Err(ApiError::BadRequest("statement has no transactions".into()));
        }
        let out_of_range = |amount: i64| {
            amount == 0 || amount.unsigned_abs() > MAX_STATEMENT_AMOUNT_CENTS.unsigned_abs()
        };
        if let Some(index) = lines.iter().position(|line| out_of_range(line.amount_cents)) {
            return Err(ApiError::BadRequest(format!(
                "transaction {index}: amountCents must be non-zero and within ±{MAX_STATEMENT_AMOUNT_CENTS}"
            )));
        }
        let lines: Vec<NewBankTransaction> = lines
            .into_iter()
            .map(|line| NewBankTransaction {
                posted_on: line.posted_on,
                amount_cents: line.amount_cents,
                reference: line.reference,
                description: line.description,
            })
            .collect();
        let lines = &lines;
        let stored = self
            .registry
            .with_client(tenant, |client| async move {
                Ok::<_, ApiError>(client.insert_bank_transactions(lines).await?)
            })
            .await?;
        tracing::info!(tenant = %tenant, count = stored.len(), "bank statement uploaded");
        Ok(stored)
    }

    /// Matches every unmatched statement line in the period against completed
    /// payments that no line has claimed yet.
    pub async fn reconcile(
        &self,
        tenant: &SchemaName,
        request: &ProcessReconciliationRequest,
    ) -> Result<Vec<ReconciliationResult>, ApiError> {
        let config = self.config.with_overrides(request);
        let period = Period {
            start: request.period_start,
            end: request.period_end,
        };
        // one client for the whole run: a rerun after partial progress would
        // skip the lines already recorded
        let client = self.registry.acquire(tenant).await?;
        let lines = client
            .bank_transactions(Some(ReconciliationStatus::Unmatched), period)
            .await?;
        let payments = client.unreconciled_payments().await?;
        let mut claimed = HashSet::new();
        let mut results = Vec::with_capacity(lines.len());

        for line in &lines {
            let candidate = best_candidate(
                line,
                payments.iter().filter(|p| !claimed.contains(&p.id)),
                &config,
            );
            let (status, payment_id) = outcome_for(candidate, &config);
            if let Some(id) = payment_id {
                claimed.insert(id);
            }
            if status != ReconciliationStatus::Unmatched {
                client
                    .record_match(
                        line.id,
                        &MatchRecord {
                            status,
                            payment_id,
                            confidence: candidate.map(|c| c.confidence),
                            reconciled_by: None,
                        },
                    )
                    .await?;
            }
            results.push(ReconciliationResult {
                bank_transaction_id: line.id,
                status,
                payment_id: candidate.map(|c| c.payment_id),
                confidence: candidate.map_or(0.0, |c| c.confidence),
                rule: candidate.map(|c| c.rule.name().to_string()),
            });
        }

        let matched = results
            .iter()
            .filter(|r| r.status == ReconciliationStatus::Matched)
            .count();
        tracing::info!(tenant = %tenant, matched, total = results.len(), "reconciliation completed");
        Ok(results)
    }

    pub async fn manual(
        &self,
        tenant: &SchemaName,
        bank_transaction_id: i64,
        payment_id: i64,
        actor: i64,
    ) -> Result<BankTransaction, ApiError> {
        self.registry
            .with_client(tenant, |client| async move {
                apply_manual(&client, bank_transaction_id, payment_id, actor).await
            })
            .await
    }

    /// Applies each manual match on its own. Refused items are counted;
    /// anything else aborts the batch.
    pub async fn bulk(
        &self,
        tenant: &SchemaName,
        items: &[ManualReconciliationRequest],
        actor: i64,
    ) -> Result<BulkReconciliationOutcome, ApiError> {
        if items.is_empty() {
            return Err(ApiError::BadRequest("no reconciliations given".into()));
        }
        if items.len() > MAX_BULK_RECONCILIATIONS {
            return Err(ApiError::BadRequest(format!(
                "at most {MAX_BULK_RECONCILIATIONS} reconciliations per batch"
            )));
        }

        let client = self.registry.acquire(tenant).await?;
        let mut outcome = BulkReconciliationOutcome::default();
        for item in items {
            match apply_manual(&client, item.bank_transaction_id, item.payment_id, actor).await {
                Ok(_) => outcome.success += 1,
                Err(error @ (ApiError::NotFound(_) | ApiError::Conflict(_))) => {
                    tracing::warn!(
                        tenant = %tenant,
                        bank_transaction_id = item.bank_transaction_id,
                        payment_id = item.payment_id,
                        %error,
                        "manual match refused"
                    );
                    outcome.failed += 1;
                }
                Err(error) => return Err(error),
            }
        }
        tracing::info!(tenant = %tenant, success = outcome.success, failed = outcome.failed, "bulk reconciliation completed");
        Ok(outcome)
    }

    /// One page of statement lines, filtered by status and posting date.
    pub async fn results(
        &self,
        tenant: &SchemaName,
        status: Option<ReconciliationStatus>,
        period: Period,
        page: u32,
        limit: u32,
    ) -> Result<(Vec<BankTransaction>, Pagination), ApiError> {
        let page = page.max(1);
        let limit = limit.clamp(1, MAX_PAGE_SIZE);
        let lines = self
            .registry
            .with_client(tenant, |client| async move {
                Ok::<_, ApiError>(client.bank_transactions(status, period).await?)
            })
            .await?;

        let total = lines.len();
        let skip = (page as usize - 1).saturating_mul(limit as usize);
        let data = lines.into_iter().skip(skip).take(limit as usize).collect();
        Ok((data, Pagination { page, limit, total }))
    }

    pub async fn stats(&self, tenant: &SchemaName, period: Period) -> Result<ReconciliationStats, ApiError> {
        let lines = self
            .registry
            .with_client(tenant, |client| async move {
                Ok::<_, ApiError>(client.bank_transactions(None, period).await?)
            })
            .await?;
        Ok(summarize(&lines))
    }
}

async fn apply_manual(
    client: &ScopedClient,
    bank_transaction_id: i64,
    payment_id: i64,
    actor: i64,
) -> Result<BankTransaction, ApiError> {
    let line = client
        .find_bank_transaction(bank_transaction_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("bank transaction {bank_transaction_id}")))?;
    if line.status == ReconciliationStatus::Matched {
        return Err(ApiError::Conflict(format!(
            "bank transaction {bank_transaction_id} is already matched"
        )));
    }
    let payment = client
        .find_payment(payment_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("payment {payment_id}")))?;
    if payment.status != PaymentStatus::Completed {
        return Err(ApiError::Conflict(format!(
            "payment {payment_id} is {}",
            payment.status
        )));
    }
    Ok(client
        .record_match(
            line.id,
            &MatchRecord {
                status: ReconciliationStatus::Matched,
                payment_id: Some(payment.id),
                confidence: Some(1.0),
                reconciled_by: Some(actor),
            },
        )
        .await?)
}

/// Totals saturate instead of overflowing.
pub fn summarize(lines: &[BankTransaction]) -> ReconciliationStats {
    lines.iter().fold(ReconciliationStats::default(), |mut stats, line| {
        stats.total_transactions += 1;
        stats.total_amount_cents = stats.total_amount_cents.saturating_add(line.amount_cents);
        match line.status {
            ReconciliationStatus::Matched => {
                stats.matched_transactions += 1;
                stats.matched_amount_cents =
                    stats.matched_amount_cents.saturating_add(line.amount_cents);
            }
            ReconciliationStatus::Unmatched => {
                stats.unmatched_transactions += 1;
                stats.unmatched_amount_cents =
                    stats.unmatched_amount_cents.saturating_add(line.amount_cents);
            }
            ReconciliationStatus::ManualReview => {
                stats.review_transactions += 1;
                stats.unmatched_amount_cents =
                    stats.unmatched_amount_cents.saturating_add(line.amount_cents);
            }
        }
        stats
    })
}
