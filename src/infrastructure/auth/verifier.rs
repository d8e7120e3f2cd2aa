//! Token verification boundary.
//!
//! The broadcast layer consumes identity as an opaque "verify access token"
//! call. `IdentityVerifier` is that seam; the production implementation
//! validates JWTs locally, tests substitute canned identities.

use async_trait::async_trait;
use jsonwebtoken::{decode, DecodingKey, Validation};
use thiserror::Error;
use uuid::Uuid;

use crate::config::AuthConfig;

use super::Claims;

/// Role required for client-initiated publishes into a channel.
pub const ROLE_PUBLISHER: &str = "publisher";

/// Verified identity attached to a connection for its whole lifetime.
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub subject_id: String,
    pub tenant_id: String,
    pub session_id: String,
    pub roles: Vec<String>,
}

impl AuthContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Token expired")]
    Expired,
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<AuthContext, AuthError>;
}

/// JWT-backed verifier.
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(config: &AuthConfig) -> Self {
        let decoding_key = DecodingKey::from_secret(config.jwt_secret.as_bytes());

        let mut validation = Validation::default();

        if let Some(ref issuer) = config.issuer {
            validation.set_issuer(&[issuer]);
        }

        if let Some(ref audience) = config.audience {
            validation.set_audience(&[audience]);
        }

        Self {
            decoding_key,
            validation,
        }
    }

    fn decode_claims(&self, token: &str) -> Result<Claims, AuthError> {
        let token_data = decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| AuthError::InvalidToken(e.to_string()))?;

        Ok(token_data.claims)
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<AuthContext, AuthError> {
        let claims = self.decode_claims(token)?;

        if claims.is_expired() {
            return Err(AuthError::Expired);
        }

        Ok(AuthContext {
            subject_id: claims.sub.clone(),
            tenant_id: claims.tenant_id().to_string(),
            session_id: claims
                .sid
                .clone()
                .unwrap_or_else(|| Uuid::new_v4().to_string()),
            roles: claims.roles,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::DEFAULT_TENANT_ID;
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn create_test_config() -> AuthConfig {
        AuthConfig {
            jwt_secret: "test-secret-key-for-testing".to_string(),
            issuer: None,
            audience: None,
        }
    }

    fn create_test_token(claims: &Claims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    fn test_claims() -> Claims {
        Claims {
            sub: "user-123".to_string(),
            exp: chrono::Utc::now().timestamp() + 3600,
            iat: chrono::Utc::now().timestamp(),
            sid: Some("session-1".to_string()),
            roles: vec!["viewer".to_string()],
            tenant_id: Some("acme".to_string()),
            extra: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_valid_token() {
        let config = create_test_config();
        let verifier = JwtVerifier::new(&config);

        let token = create_test_token(&test_claims(), &config.jwt_secret);
        let identity = verifier.verify(&token).await.unwrap();

        assert_eq!(identity.subject_id, "user-123");
        assert_eq!(identity.tenant_id, "acme");
        assert_eq!(identity.session_id, "session-1");
        assert!(identity.has_role("viewer"));
        assert!(!identity.has_role(ROLE_PUBLISHER));
    }

    #[tokio::test]
    async fn test_invalid_token() {
        let config = create_test_config();
        let verifier = JwtVerifier::new(&config);

        let result = verifier.verify("invalid-token").await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_missing_tenant_falls_back_to_default() {
        let config = create_test_config();
        let verifier = JwtVerifier::new(&config);

        let mut claims = test_claims();
        claims.tenant_id = None;
        let token = create_test_token(&claims, &config.jwt_secret);

        let identity = verifier.verify(&token).await.unwrap();
        assert_eq!(identity.tenant_id, DEFAULT_TENANT_ID);
    }

    #[tokio::test]
    async fn test_missing_session_id_is_generated() {
        let config = create_test_config();
        let verifier = JwtVerifier::new(&config);

        let mut claims = test_claims();
        claims.sid = None;
        let token = create_test_token(&claims, &config.jwt_secret);

        let identity = verifier.verify(&token).await.unwrap();
        assert!(!identity.session_id.is_empty());
    }
}
