//! Bearer-token authentication.
//!
//! Tokens are HS256 JWTs signed with `auth.jwt_secret`. A verified token
//! yields an [`Identity`] that is bound into the invocation; identity-sourced
//! request fields are filled from it. Public routes skip the gate.

use crate::domain::config::{AuthConfig, ConfigError, Stage};
use crate::domain::error::{AuthError, GatewayError};
use crate::domain::identity::Identity;
use crate::domain::invocation::Invocation;
use crate::middleware::metrics::GatewayMetrics;
use crate::middleware::pipeline::{CallOutcome, Interceptor, Next};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    #[serde(default)]
    pub sub: String,
    /// Expiration time, seconds since the epoch
    pub exp: i64,
    /// Issued at
    #[serde(default)]
    pub iat: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
}

/// Verifies inbound credentials.
pub struct AuthGate {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
    issuer: Option<String>,
}

impl AuthGate {
    pub fn new(config: &AuthConfig) -> Result<Self, ConfigError> {
        let secret = config
            .jwt_secret
            .as_deref()
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingSigningKey)?;
        Ok(Self::from_secret(secret.as_bytes(), config.issuer.clone()))
    }

    pub fn from_secret(secret: &[u8], issuer: Option<String>) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        if let Some(iss) = &issuer {
            validation.set_issuer(&[iss]);
        }

        Self {
            encoding_key: EncodingKey::from_secret(secret),
            decoding_key: DecodingKey::from_secret(secret),
            validation,
            issuer,
        }
    }

    /// Verify an `Authorization` value (`Bearer <token>`).
    pub fn authenticate(&self, raw: Option<&str>) -> Result<Identity, AuthError> {
        let raw = raw.map(str::trim).filter(|s| !s.is_empty());
        let raw = raw.ok_or(AuthError::MissingCredential)?;
        let token = bearer_token(raw)?;

        let claims = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::InvalidSignature,
                _ => AuthError::Malformed(e.to_string()),
            })?
            .claims;

        if claims.sub.is_empty() {
            return Err(AuthError::MissingSubject);
        }
        let expires_at = DateTime::<Utc>::from_timestamp(claims.exp, 0)
            .ok_or_else(|| AuthError::Malformed("exp out of range".into()))?;

        let identity = Identity::new(claims.sub, expires_at);
        // Expiry must be strictly in the future
        if identity.is_expired_at(Utc::now()) {
            return Err(AuthError::Expired);
        }
        Ok(identity)
    }

    /// Sign a token for `subject` valid for `ttl`. Used by local tooling
    /// and tests.
    pub fn issue(&self, subject: &str, ttl: Duration) -> Result<String, AuthError> {
        let now = Utc::now().timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            exp: now + ttl.as_secs() as i64,
            iat: now,
            iss: self.issuer.clone(),
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AuthError::Malformed(e.to_string()))
    }
}

fn bearer_token(raw: &str) -> Result<&str, AuthError> {
    let (scheme, token) = raw
        .split_once(' ')
        .ok_or_else(|| AuthError::Malformed("expected `Bearer <token>`".into()))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::Malformed(format!("unsupported scheme {scheme}")));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::MissingCredential);
    }
    Ok(token)
}

/// Interceptor verifying the caller before any other admission gate.
pub struct AuthStage {
    gate: Arc<AuthGate>,
    metrics: Arc<GatewayMetrics>,
}

impl AuthStage {
    pub fn new(gate: Arc<AuthGate>, metrics: Arc<GatewayMetrics>) -> Self {
        Self { gate, metrics }
    }
}

#[async_trait]
impl Interceptor for AuthStage {
    fn stage(&self) -> Stage {
        Stage::Auth
    }

    async fn intercept(&self, mut call: Invocation, next: Next<'_>) -> CallOutcome {
        if call.route.is_public() {
            return next.run(call).await;
        }

        match self.gate.authenticate(call.credential.as_deref()) {
            Ok(identity) => {
                debug!(route = call.route.name, user_id = %identity.subject_id, "Authenticated");
                call.bind_identity(identity);
                next.run(call).await
            }
            Err(e) => {
                self.metrics.record_auth_rejection();
                warn!(route = call.route.name, error = %e, "Authentication failed");
                Err(GatewayError::Auth(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gate() -> AuthGate {
        AuthGate::from_secret(b"test-secret", None)
    }

    fn sign(secret: &[u8], claims: &Claims) -> String {
        encode(
            &Header::new(Algorithm::HS256),
            claims,
            &EncodingKey::from_secret(secret),
        )
        .unwrap()
    }

    #[test]
    fn test_valid_token() {
        let gate = gate();
        let token = gate.issue("u-1", Duration::from_secs(60)).unwrap();

        let identity = gate.authenticate(Some(&format!("Bearer {token}"))).unwrap();
        assert_eq!(identity.subject_id, "u-1");
        assert!(identity.expires_at > Utc::now());
    }

    #[test]
    fn test_scheme_is_case_insensitive() {
        let gate = gate();
        let token = gate.issue("u-1", Duration::from_secs(60)).unwrap();
        assert!(gate.authenticate(Some(&format!("bearer {token}"))).is_ok());
    }

    #[test]
    fn test_missing_credential() {
        let gate = gate();
        assert_eq!(gate.authenticate(None), Err(AuthError::MissingCredential));
        assert_eq!(gate.authenticate(Some("  ")), Err(AuthError::MissingCredential));
        assert_eq!(gate.authenticate(Some("Bearer ")), Err(AuthError::MissingCredential));
    }

    #[test]
    fn test_wrong_scheme() {
        assert!(matches!(
            gate().authenticate(Some("Basic dXNlcjpwYXNz")),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_expired_token() {
        let now = Utc::now().timestamp();
        let token = sign(
            b"test-secret",
            &Claims {
                sub: "u-1".into(),
                exp: now - 60,
                iat: now - 120,
                iss: None,
            },
        );
        assert_eq!(
            gate().authenticate(Some(&format!("Bearer {token}"))),
            Err(AuthError::Expired)
        );
    }

    #[test]
    fn test_wrong_key() {
        let token = sign(
            b"other-secret",
            &Claims {
                sub: "u-1".into(),
                exp: Utc::now().timestamp() + 60,
                iat: 0,
                iss: None,
            },
        );
        assert_eq!(
            gate().authenticate(Some(&format!("Bearer {token}"))),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_missing_subject() {
        let token = sign(
            b"test-secret",
            &Claims {
                sub: String::new(),
                exp: Utc::now().timestamp() + 60,
                iat: 0,
                iss: None,
            },
        );
        assert_eq!(
            gate().authenticate(Some(&format!("Bearer {token}"))),
            Err(AuthError::MissingSubject)
        );
    }

    #[test]
    fn test_garbage_token() {
        assert!(matches!(
            gate().authenticate(Some("Bearer not.a.jwt")),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_issuer_is_enforced() {
        let strict = AuthGate::from_secret(b"test-secret", Some("gateway".into()));
        let foreign = AuthGate::from_secret(b"test-secret", Some("elsewhere".into()));
        let token = foreign.issue("u-1", Duration::from_secs(60)).unwrap();

        assert!(matches!(
            strict.authenticate(Some(&format!("Bearer {token}"))),
            Err(AuthError::Malformed(_))
        ));
    }

    #[test]
    fn test_requires_configured_secret() {
        let config = AuthConfig::default();
        assert!(matches!(AuthGate::new(&config), Err(ConfigError::MissingSigningKey)));
    }
}
