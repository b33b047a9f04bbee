pub mod registry;
pub mod retry;

use std::fmt;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{request::Parts, HeaderMap},
};
use dto::Role;

use crate::{auth::Session, error::ApiError, state::AppState};

/// Header a global administrator uses to act on a specific complex.
pub const TENANT_OVERRIDE_HEADER: &str = "x-tenant-schema";

/// Schemas owned by the database or the control plane.
const RESERVED_SCHEMAS: &[&str] = &["public", "information_schema"];

/// A PostgreSQL schema name that is safe to interpolate into DDL.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SchemaName(String);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid schema name `{0}`")]
pub struct InvalidSchemaName(pub String);

impl SchemaName {
    pub fn parse(raw: &str) -> Result<Self, InvalidSchemaName> {
        let mut chars = raw.chars();
        let valid = raw.len() <= 63
            && chars.next().is_some_and(|c| c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
            && !raw.starts_with("pg_")
            && !RESERVED_SCHEMAS.contains(&raw);
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(InvalidSchemaName(raw.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SchemaName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The complex a request acts on, together with the session acting on it.
#[derive(Debug, Clone)]
pub struct TenantContext {
    pub schema: SchemaName,
    pub complex_id: Option<i64>,
    pub session: Session,
}

impl TenantContext {
    pub fn user_id(&self) -> i64 {
        self.session.claims.id
    }

    pub fn require_role(&self, allowed: &[Role]) -> Result<(), ApiError> {
        self.session.require_role(allowed)
    }
}

/// Maps a decoded session to the tenant it is bound to. Only global
/// administrators may redirect the request with [`TENANT_OVERRIDE_HEADER`].
pub fn resolve(session: Session, headers: &HeaderMap) -> Result<TenantContext, ApiError> {
    let override_schema = session
        .claims
        .is_global_admin
        .then(|| headers.get(TENANT_OVERRIDE_HEADER))
        .flatten()
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    let raw = override_schema
        .or_else(|| session.claims.schema_name.clone())
        .filter(|name| !name.is_empty())
        .ok_or(ApiError::UnresolvedTenant)?;

    let schema = SchemaName::parse(&raw).map_err(|error| {
        tracing::warn!(%error, user_id = session.claims.id, "session carries a malformed tenant");
        ApiError::UnresolvedTenant
    })?;

    Ok(TenantContext {
        schema,
        complex_id: session.claims.complex_id,
        session,
    })
}

#[async_trait]
impl FromRequestParts<AppState> for TenantContext {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let session = Session::from_request_parts(parts, state).await?;
        resolve(session, &parts.headers)
    }
}
