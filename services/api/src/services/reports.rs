use std::sync::Arc;

use chrono::NaiveDate;
use models::{Fee, FeeStatus, Resident};

use crate::{
    error::ApiError,
    services::pdf::{Face, Page},
    tenant::{registry::ClientRegistry, SchemaName},
};

/// Renders cents as Colombian pesos, e.g. `$1.250.000,00`.
pub fn format_cop(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let cents = cents.unsigned_abs();
    let digits = (cents / 100).to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, digit) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            grouped.push('.');
        }
        grouped.push(digit);
    }
    format!("{sign}${grouped},{:02}", cents % 100)
}

fn certificate(resident: &Resident, fees: &[Fee], issued_on: NaiveDate) -> Vec<u8> {
    let paid_total: i64 = fees.iter().map(|fee| fee.amount_cents).sum();
    let mut page = Page::default();
    page.line(Face::Bold, 20, "Certificado de Paz y Salvo")
        .gap(18)
        .line(Face::Regular, 11, format!("Fecha de expedición: {}", issued_on.format("%d/%m/%Y")))
        .gap(12)
        .line(Face::Bold, 12, resident.full_name.as_str())
        .line(Face::Regular, 11, format!("Unidad: {}", resident.unit))
        .line(Face::Regular, 11, format!("Correo: {}", resident.email))
        .gap(12)
        .paragraph(
            11,
            85,
            &format!(
                "La administración certifica que {} se encuentra a paz y salvo por concepto de \
                 cuotas de administración y demás obligaciones a la fecha de expedición.",
                resident.full_name
            ),
        )
        .gap(12)
        .line(Face::Regular, 11, format!("Cuotas pagadas: {}", fees.len()))
        .line(Face::Regular, 11, format!("Total pagado: {}", format_cop(paid_total)));
    page.render()
}

#[derive(Clone)]
pub struct ReportService {
    registry: Arc<ClientRegistry>,
}

impl ReportService {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    /// PDF certifying the resident owes nothing. When `requester_email` is
    /// set, only that resident's own certificate may be issued.
    pub async fn peace_and_safe(
        &self,
        tenant: &SchemaName,
        resident_id: i64,
        requester_email: Option<&str>,
    ) -> Result<Vec<u8>, ApiError> {
        let (resident, fees) = self
            .registry
            .with_client(tenant, |client| async move {
                let resident = client
                    .find_resident(resident_id)
                    .await?
                    .ok_or_else(|| ApiError::NotFound(format!("resident {resident_id}")))?;
                let fees = client.resident_fees(resident_id).await?;
                Ok::<_, ApiError>((resident, fees))
            })
            .await?;

        if let Some(email) = requester_email {
            if !resident.email.eq_ignore_ascii_case(email) {
                return Err(ApiError::Forbidden);
            }
        }
        let pending = fees.iter().filter(|fee| fee.status == FeeStatus::Pending).count();
        if pending > 0 {
            return Err(ApiError::OutstandingBalance { pending });
        }

        tracing::info!(tenant = %tenant, resident_id, "peace-and-safe certificate issued");
        Ok(certificate(&resident, &fees, chrono::Local::now().date_naive()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::RegistryConfig,
        store::{
            memory::{fixtures, MemoryBackend},
            SchemaBackend,
        },
    };

    fn schema() -> SchemaName {
        SchemaName::parse("t1").unwrap()
    }

    fn due(month: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, month, 5).unwrap()
    }

    async fn service() -> ReportService {
        let backend = Arc::new(MemoryBackend::new());
        backend.provision("Torres del Parque", &schema()).await.unwrap();
        backend
            .seed(&schema())
            .unwrap()
            .resident(fixtures::resident(1, "Ana Gómez", "ana@example.co", "T2-301"))
            .resident(fixtures::resident(2, "Luis Pérez", "luis@example.co", "T1-102"))
            .fee(fixtures::fee(10, 1, 350_000_00, due(4), FeeStatus::Paid))
            .fee(fixtures::fee(11, 1, 350_000_00, due(5), FeeStatus::Paid))
            .fee(fixtures::fee(12, 2, 350_000_00, due(5), FeeStatus::Pending));
        ReportService::new(Arc::new(ClientRegistry::new(backend, &RegistryConfig::default())))
    }

    #[test]
    fn pesos_use_dot_thousands_and_comma_decimals() {
        assert_eq!(format_cop(125_000_000), "$1.250.000,00");
        assert_eq!(format_cop(99_950), "$999,50");
        assert_eq!(format_cop(-1_000_05), "-$1.000,05");
    }

    #[tokio::test]
    async fn settled_resident_gets_a_pdf() {
        let pdf = service().await.peace_and_safe(&schema(), 1, None).await.unwrap();
        assert!(pdf.starts_with(b"%PDF-1.4"));
        let text = String::from_utf8(pdf).unwrap();
        assert!(text.contains("Certificado de Paz y Salvo"));
        assert!(text.contains("$700.000,00"));
    }

    #[tokio::test]
    async fn pending_fees_block_the_certificate() {
        let err = service().await.peace_and_safe(&schema(), 2, None).await.unwrap_err();
        assert!(matches!(err, ApiError::OutstandingBalance { pending: 1 }));
    }

    #[tokio::test]
    async fn residents_only_get_their_own_certificate() {
        let service = service().await;
        assert!(service
            .peace_and_safe(&schema(), 1, Some("ANA@example.co"))
            .await
            .is_ok());
        let err = service
            .peace_and_safe(&schema(), 1, Some("luis@example.co"))
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Forbidden));

        let err = service.peace_and_safe(&schema(), 404, None).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
    }
}
