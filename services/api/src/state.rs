use std::sync::Arc;

use crate::{
    auth::{revocation::RevocationList, SessionVerifier},
    config::Config,
    services::{
        ComplexService, PanicAlertService, PaymentService, ReconciliationConfig,
        ReconciliationService, ReportService,
    },
    store::SchemaBackend,
    tenant::registry::ClientRegistry,
};

#[derive(Clone)]
pub struct AppState {
    registry: Arc<ClientRegistry>,
    verifier: SessionVerifier,
    revocations: RevocationList,
    panic: PanicAlertService,
    reconciliation: ReconciliationService,
    payments: PaymentService,
    reports: ReportService,
    complexes: ComplexService,
}

impl AppState {
    pub fn new(config: &Config, backend: Arc<dyn SchemaBackend>, revocations: RevocationList) -> Self {
        let registry = Arc::new(ClientRegistry::new(backend, &config.registry));
        Self {
            verifier: SessionVerifier::new(&config.jwt_secret),
            revocations,
            panic: PanicAlertService::new(registry.clone()),
            reconciliation: ReconciliationService::new(
                registry.clone(),
                ReconciliationConfig::default(),
            ),
            payments: PaymentService::new(registry.clone(), config.payments.clone()),
            reports: ReportService::new(registry.clone()),
            complexes: ComplexService::new(registry.clone()),
            registry,
        }
    }

    pub fn registry(&self) -> &Arc<ClientRegistry> {
        &self.registry
    }

    pub fn verifier(&self) -> &SessionVerifier {
        &self.verifier
    }

    pub fn revocations(&self) -> &RevocationList {
        &self.revocations
    }

    pub fn panic(&self) -> &PanicAlertService {
        &self.panic
    }

    pub fn reconciliation(&self) -> &ReconciliationService {
        &self.reconciliation
    }

    pub fn payments(&self) -> &PaymentService {
        &self.payments
    }

    pub fn reports(&self) -> &ReportService {
        &self.reports
    }

    pub fn complexes(&self) -> &ComplexService {
        &self.complexes
    }
}
