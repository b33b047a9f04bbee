use std::sync::Arc;

use models::{PanicAlert, PanicResponse, PanicStatus};
use serde::Serialize;

use crate::{
    error::ApiError,
    store::NewPanicAlert,
    tenant::{registry::ClientRegistry, SchemaName},
};

/// Result of a status update. `changed` is false when the alert already had
/// the requested status, which makes retries of the same update harmless.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusUpdate {
    pub alert: PanicAlert,
    pub changed: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertDetail {
    #[serde(flatten)]
    pub alert: PanicAlert,
    pub responses: Vec<PanicResponse>,
}

#[derive(Clone)]
pub struct PanicAlertService {
    registry: Arc<ClientRegistry>,
}

impl PanicAlertService {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    pub async fn create(&self, tenant: &SchemaName, alert: NewPanicAlert) -> Result<PanicAlert, ApiError> {
        let alert = &alert;
        let created = self
            .registry
            .with_client(tenant, |client| async move {
                Ok::<_, ApiError>(client.insert_panic_alert(alert).await?)
            })
            .await?;
        tracing::warn!(
            tenant = %tenant,
            alert_id = created.id,
            alert_type = %created.alert_type,
            "panic alert raised"
        );
        Ok(created)
    }

    /// Alerts still awaiting an outcome, newest first.
    pub async fn list_active(&self, tenant: &SchemaName) -> Result<Vec<PanicAlert>, ApiError> {
        self.registry
            .with_client(tenant, |client| async move {
                Ok::<_, ApiError>(client.open_panic_alerts().await?)
            })
            .await
    }

    pub async fn get(&self, tenant: &SchemaName, alert_id: i64) -> Result<AlertDetail, ApiError> {
        self.registry
            .with_client(tenant, |client| async move {
                let alert = client
                    .find_panic_alert(alert_id)
                    .await?
                    .ok_or_else(|| alert_not_found(alert_id))?;
                let responses = client.panic_responses(alert_id).await?;
                Ok::<_, ApiError>(AlertDetail { alert, responses })
            })
            .await
    }

    pub async fn update_status(
        &self,
        tenant: &SchemaName,
        alert_id: i64,
        status: PanicStatus,
        actor: i64,
    ) -> Result<StatusUpdate, ApiError> {
        let update = self
            .registry
            .with_client(tenant, |client| async move {
                let current = client
                    .find_panic_alert(alert_id)
                    .await?
                    .ok_or_else(|| alert_not_found(alert_id))?;
                if current.status == status {
                    return Ok(StatusUpdate {
                        alert: current,
                        changed: false,
                    });
                }
                if !current.status.can_transition_to(status) {
                    return Err(ApiError::InvalidTransition {
                        from: current.status,
                        to: status,
                    });
                }

                if let Some(alert) = client
                    .transition_panic_alert(alert_id, current.status, status, actor)
                    .await?
                {
                    return Ok(StatusUpdate {
                        alert,
                        changed: true,
                    });
                }

                // lost a race with another responder; report what they did
                let latest = client
                    .find_panic_alert(alert_id)
                    .await?
                    .ok_or_else(|| alert_not_found(alert_id))?;
                if latest.status == status {
                    Ok(StatusUpdate {
                        alert: latest,
                        changed: false,
                    })
                } else {
                    Err(ApiError::InvalidTransition {
                        from: latest.status,
                        to: status,
                    })
                }
            })
            .await?;

        if update.changed {
            tracing::info!(tenant = %tenant, alert_id, status = %status, actor, "panic alert updated");
        }
        Ok(update)
    }

    pub async fn respond(
        &self,
        tenant: &SchemaName,
        alert_id: i64,
        responder: i64,
        action_taken: &str,
        notes: Option<&str>,
    ) -> Result<PanicResponse, ApiError> {
        if action_taken.trim().is_empty() {
            return Err(ApiError::BadRequest("actionTaken must not be empty".into()));
        }
        self.registry
            .with_client(tenant, |client| async move {
                let alert = client
                    .find_panic_alert(alert_id)
                    .await?
                    .ok_or_else(|| alert_not_found(alert_id))?;
                if alert.status.is_terminal() {
                    return Err(ApiError::Conflict(format!(
                        "panic alert {alert_id} is already {}",
                        alert.status
                    )));
                }
                Ok(client
                    .insert_panic_response(alert_id, responder, action_taken, notes)
                    .await?)
            })
            .await
    }
}

fn alert_not_found(alert_id: i64) -> ApiError {
    ApiError::NotFound(format!("panic alert {alert_id}"))
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
    use models::PanicType;

    fn schema(name: &str) -> SchemaName {
        SchemaName::parse(name).unwrap()
    }

    async fn service() -> (PanicAlertService, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new());
        backend.provision("Torres del Parque", &schema("t1")).await.unwrap();
        backend.provision("Mirador", &schema("t2")).await.unwrap();
        let registry = Arc::new(ClientRegistry::new(backend.clone(), &RegistryConfig::default()));
        (PanicAlertService::new(registry), backend)
    }

    #[tokio::test]
    async fn resolving_removes_alert_from_active_list() {
        let (service, backend) = service().await;
        backend
            .seed(&schema("t1"))
            .unwrap()
            .panic_alert(fixtures::active_alert(42, 7));

        let update = service
            .update_status(&schema("t1"), 42, PanicStatus::Resolved, 99)
            .await
            .unwrap();
        assert!(update.changed);
        assert_eq!(update.alert.resolved_by, Some(99));
        assert!(update.alert.resolved_at.is_some());

        let active = service.list_active(&schema("t1")).await.unwrap();
        assert!(active.iter().all(|alert| alert.id != 42));
    }

    #[tokio::test]
    async fn repeating_a_resolution_is_a_no_op() {
        let (service, backend) = service().await;
        backend
            .seed(&schema("t1"))
            .unwrap()
            .panic_alert(fixtures::active_alert(42, 7));

        let first = service
            .update_status(&schema("t1"), 42, PanicStatus::Resolved, 99)
            .await
            .unwrap();
        let second = service
            .update_status(&schema("t1"), 42, PanicStatus::Resolved, 100)
            .await
            .unwrap();
        assert!(first.changed);
        assert!(!second.changed);
        assert_eq!(second.alert.resolved_by, Some(99));
    }

    #[tokio::test]
    async fn terminal_alerts_reject_other_transitions() {
        let (service, backend) = service().await;
        backend
            .seed(&schema("t1"))
            .unwrap()
            .panic_alert(fixtures::active_alert(42, 7));
        let cancelled = service
            .update_status(&schema("t1"), 42, PanicStatus::Cancelled, 99)
            .await
            .unwrap();
        assert!(cancelled.alert.resolved_at.is_none());
        assert!(cancelled.alert.resolved_by.is_none());

        let err = service
            .update_status(&schema("t1"), 42, PanicStatus::Resolved, 99)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ApiError::InvalidTransition {
                from: PanicStatus::Cancelled,
                to: PanicStatus::Resolved
            }
        ));
    }

    #[tokio::test]
    async fn another_tenants_alert_is_not_found() {
        let (service, backend) = service().await;
        backend
            .seed(&schema("t1"))
            .unwrap()
            .panic_alert(fixtures::active_alert(42, 7));

        let err = service
            .update_status(&schema("t2"), 42, PanicStatus::Resolved, 99)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));

        let still_active = service.list_active(&schema("t1")).await.unwrap();
        assert_eq!(still_active.len(), 1);
        assert_eq!(still_active[0].status, PanicStatus::Active);
    }

    #[tokio::test]
    async fn responses_are_attached_until_the_alert_closes() {
        let (service, _) = service().await;
        let alert = service
            .create(
                &schema("t1"),
                NewPanicAlert {
                    user_id: 7,
                    property_id: Some(301),
                    alert_type: PanicType::Medical,
                    location: Some("Portería".into()),
                    description: None,
                },
            )
            .await
            .unwrap();

        service
            .respond(&schema("t1"), alert.id, 99, "Ambulancia en camino", None)
            .await
            .unwrap();
        let detail = service.get(&schema("t1"), alert.id).await.unwrap();
        assert_eq!(detail.responses.len(), 1);
        assert_eq!(detail.responses[0].action_taken, "Ambulancia en camino");

        service
            .update_status(&schema("t1"), alert.id, PanicStatus::Resolved, 99)
            .await
            .unwrap();
        let err = service
            .respond(&schema("t1"), alert.id, 99, "Seguimiento", None)
            .await
            .unwrap_err();
        assert!(matches!(err, ApiError::Conflict(_)));
    }
}
