use std::sync::Arc;

use dto::{GatewayOutcome, InitiatePaymentResponse};
use hmac::{Hmac, Mac};
use models::{FeeStatus, Payment, PaymentStatus};
use sha2::Sha256;
use uuid::Uuid;

use crate::{
    config::PaymentConfig,
    error::ApiError,
    store::NewPayment,
    tenant::{registry::ClientRegistry, SchemaName},
};

type HmacSha256 = Hmac<Sha256>;

const CURRENCY: &str = "COP";

fn callback_mac(
    secret: &str,
    transaction_id: Uuid,
    outcome: GatewayOutcome,
    gateway_reference: &str,
) -> anyhow::Result<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| anyhow::anyhow!("gateway secret rejected as hmac key"))?;
    mac.update(format!("{transaction_id}:{}:{gateway_reference}", outcome.as_str()).as_bytes());
    Ok(mac)
}

/// Hex signature the gateway attaches to its callback.
pub fn sign_callback(
    secret: &str,
    transaction_id: Uuid,
    outcome: GatewayOutcome,
    gateway_reference: &str,
) -> anyhow::Result<String> {
    let mac = callback_mac(secret, transaction_id, outcome, gateway_reference)?;
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn signature_matches(
    secret: &str,
    transaction_id: Uuid,
    outcome: GatewayOutcome,
    gateway_reference: &str,
    signature: &str,
) -> bool {
    let Ok(raw) = hex::decode(signature.trim()) else {
        return false;
    };
    callback_mac(secret, transaction_id, outcome, gateway_reference)
        .is_ok_and(|mac| mac.verify_slice(&raw).is_ok())
}

#[derive(Clone)]
pub struct PaymentService {
    registry: Arc<ClientRegistry>,
    config: PaymentConfig,
}

impl PaymentService {
    pub fn new(registry: Arc<ClientRegistry>, config: PaymentConfig) -> Self {
        Self { registry, config }
    }

    /// Opens a checkout for a pending fee. When `payer_email` is set the fee
    /// must belong to the resident with that email.
    pub async fn initiate(
        &self,
        tenant: &SchemaName,
        fee_id: i64,
        payer_email: Option<&str>,
    ) -> Result<InitiatePaymentResponse, ApiError> {
        let payment = self
            .registry
            .with_client(tenant, |client| async move {
                let fee = client
                    .find_fee(fee_id)
                    .await?
                    .ok_or_else(|| ApiError::NotFound(format!("fee {fee_id}")))?;
                if let Some(email) = payer_email {
                    let owner = client.find_resident(fee.resident_id).await?;
                    if !owner.is_some_and(|r| r.email.eq_ignore_ascii_case(email)) {
                        return Err(ApiError::Forbidden);
                    }
                }
                if fee.status != FeeStatus::Pending {
                    return Err(ApiError::Conflict(format!("fee {fee_id} is already {}", fee.status)));
                }
                let payment = NewPayment {
                    transaction_id: Uuid::new_v4(),
                    resident_id: fee.resident_id,
                    fee_id: Some(fee.id),
                    amount_cents: fee.amount_cents,
                    currency: CURRENCY.to_string(),
                };
                Ok(client.insert_payment(&payment).await?)
            })
            .await?;

        tracing::info!(
            tenant = %tenant,
            transaction_id = %payment.transaction_id,
            amount_cents = payment.amount_cents,
            "payment initiated"
        );
        Ok(InitiatePaymentResponse {
            transaction_id: payment.transaction_id,
            redirect_url: format!(
                "{}/{}",
                self.config.checkout_url.trim_end_matches('/'),
                payment.transaction_id
            ),
        })
    }

    pub async fn verify(
        &self,
        tenant: &SchemaName,
        transaction_id: Uuid,
        outcome: GatewayOutcome,
        gateway_reference: &str,
        signature: &str,
    ) -> Result<Payment, ApiError> {
        if !signature_matches(
            &self.config.gateway_secret,
            transaction_id,
            outcome,
            gateway_reference,
            signature,
        ) {
            tracing::warn!(tenant = %tenant, %transaction_id, "payment callback with bad signature");
            return Err(ApiError::InvalidSignature);
        }
        let status = match outcome {
            GatewayOutcome::Approved => PaymentStatus::Completed,
            GatewayOutcome::Declined => PaymentStatus::Failed,
        };

        self.registry
            .with_client(tenant, |client| async move {
                let payment = client
                    .find_payment_by_transaction(transaction_id)
                    .await?
                    .ok_or_else(|| ApiError::NotFound(format!("payment {transaction_id}")))?;
                if payment.status.is_final() {
                    return Ok(payment);
                }
                match client
                    .settle_payment(transaction_id, status, gateway_reference)
                    .await?
                {
                    Some(settled) => {
                        tracing::info!(%transaction_id, status = %settled.status, "payment settled");
                        Ok(settled)
                    }
                    // settled concurrently by a duplicate callback
                    None => client
                        .find_payment_by_transaction(transaction_id)
                        .await?
                        .ok_or_else(|| ApiError::NotFound(format!("payment {transaction_id}"))),
                }
            })
            .await
    }
}
