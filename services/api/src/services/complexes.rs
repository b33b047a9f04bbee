use std::sync::Arc;

use models::Complex;

use crate::{
    error::ApiError,
    tenant::{registry::ClientRegistry, SchemaName},
};

/// Control-plane operations on residential complexes.
#[derive(Clone)]
pub struct ComplexService {
    registry: Arc<ClientRegistry>,
}

impl ComplexService {
    pub fn new(registry: Arc<ClientRegistry>) -> Self {
        Self { registry }
    }

    pub async fn provision(&self, name: &str, schema: &SchemaName) -> Result<Complex, ApiError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ApiError::BadRequest("name must not be empty".into()));
        }
        let complex = self.registry.backend().provision(name, schema).await?;
        tracing::info!(complex_id = complex.id, tenant = %schema, "residential complex provisioned");
        Ok(complex)
    }

    /// Deactivates the complex and drops its cached client so the next
    /// request for it fails instead of reusing the pool.
    pub async fn deactivate(&self, schema: &SchemaName) -> Result<(), ApiError> {
        self.registry.backend().deactivate(schema).await?;
        let was_cached = self.registry.invalidate(schema).await;
        tracing::info!(tenant = %schema, was_cached, "residential complex deactivated");
        Ok(())
    }
}
