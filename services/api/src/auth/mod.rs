pub mod revocation;

use std::sync::Arc;

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts, HeaderMap},
};
use axum_extra::extract::CookieJar;
use dto::{Role, SessionClaims};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};

use crate::{error::ApiError, state::AppState};

/// Cookie the frontend stores the session token in.
pub const SESSION_COOKIE: &str = "token";

pub const ADMIN_ROLES: &[Role] = &[Role::Admin, Role::SuperAdmin];
pub const SECURITY_ROLES: &[Role] = &[Role::Admin, Role::SuperAdmin, Role::Reception, Role::Staff];

/// Verifies session tokens signed by the frontend's auth layer.
#[derive(Clone)]
pub struct SessionVerifier {
    decoding_key: Arc<DecodingKey>,
    validation: Validation,
}

impl SessionVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            decoding_key: Arc::new(DecodingKey::from_secret(secret.as_bytes())),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<SessionClaims, jsonwebtoken::errors::Error> {
        decode::<SessionClaims>(token, &self.decoding_key, &self.validation).map(|data| data.claims)
    }
}

/// An authenticated caller.
#[derive(Debug, Clone)]
pub struct Session {
    pub claims: SessionClaims,
    pub token: String,
}

impl Session {
    pub fn require_role(&self, allowed: &[Role]) -> Result<(), ApiError> {
        if self.claims.is_global_admin || allowed.contains(&self.claims.role) {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }

    pub fn require_global_admin(&self) -> Result<(), ApiError> {
        if self.claims.is_global_admin {
            Ok(())
        } else {
            Err(ApiError::Forbidden)
        }
    }
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|s| s.trim().to_string())
}

/// Session token from the `Authorization` header, falling back to the cookie.
pub fn session_token(headers: &HeaderMap) -> Option<String> {
    bearer_token(headers).or_else(|| {
        CookieJar::from_headers(headers)
            .get(SESSION_COOKIE)
            .map(|cookie| cookie.value().to_string())
    })
}

#[async_trait]
impl FromRequestParts<AppState> for Session {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = session_token(&parts.headers).ok_or(ApiError::Unauthenticated)?;
        let claims = state.verifier().verify(&token).map_err(|err| {
            tracing::warn!(error = %err, "jwt decode failed");
            ApiError::Unauthenticated
        })?;

        if state.revocations().is_revoked(&token).await {
            tracing::debug!(user_id = claims.id, "rejected revoked session");
            return Err(ApiError::Unauthenticated);
        }

        Ok(Session { claims, token })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_header_wins_over_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(AUTHORIZATION, HeaderValue::from_static("Bearer from-header"));
        headers.insert("cookie", HeaderValue::from_static("token=from-cookie; theme=dark"));
        assert_eq!(session_token(&headers).as_deref(), Some("from-header"));

        headers.remove(AUTHORIZATION);
        assert_eq!(session_token(&headers).as_deref(), Some("from-cookie"));
    }

    #[test]
    fn global_admins_pass_every_role_check() {
        let mut session = Session {
            claims: SessionClaims {
                id: 1,
                email: "root@armonia.co".into(),
                role: Role::Resident,
                complex_id: None,
                schema_name: None,
                is_global_admin: false,
                exp: 0,
                iat: 0,
            },
            token: String::new(),
        };
        assert!(session.require_role(ADMIN_ROLES).is_err());
        assert!(session.require_global_admin().is_err());

        session.claims.is_global_admin = true;
        assert!(session.require_role(ADMIN_ROLES).is_ok());
        assert!(session.require_global_admin().is_ok());
    }
}
