//! JWT (JSON Web Token) handling

use async_trait::async_trait;
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::verifier::{AuthError, CredentialVerifier};

/// JWT claims carried by agent credentials
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FleetClaims {
    /// Subject (tenant, unless `tenant` is set)
    pub sub: String,
    /// Issued at (timestamp)
    pub iat: i64,
    /// Expiration time (timestamp)
    pub exp: i64,
    /// Issuer
    #[serde(default)]
    pub iss: String,
    /// Audience
    #[serde(default)]
    pub aud: String,
    /// Custom: owning tenant
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
}

impl FleetClaims {
    pub fn new(subject: String, issuer: String, audience: String, validity: Duration) -> Self {
        let now = Utc::now();
        let exp = now + validity;

        Self {
            sub: subject,
            iat: now.timestamp(),
            exp: exp.timestamp(),
            iss: issuer,
            aud: audience,
            tenant: None,
        }
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    pub fn is_expired(&self) -> bool {
        Utc::now().timestamp() > self.exp
    }

    /// Tenant claim, falling back to the subject
    pub fn tenant_id(&self) -> &str {
        self.tenant
            .as_deref()
            .filter(|t| !t.is_empty())
            .unwrap_or(&self.sub)
    }
}

/// JWT errors
#[derive(Debug, Error)]
pub enum JwtError {
    #[error("JWT encoding error: {0}")]
    EncodingError(#[from] jsonwebtoken::errors::Error),

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token")]
    InvalidToken,
}

/// HMAC-SHA256 JWT verifier
pub struct JwtVerifier {
    decoding_key: DecodingKey,
    validation: Validation,
}

impl std::fmt::Debug for JwtVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtVerifier").finish_non_exhaustive()
    }
}

impl JwtVerifier {
    /// Validates signature and expiration only, unless issuer or audience
    /// checks are added with the builder methods.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.validate_aud = false;
        validation.validate_nbf = false;

        Self {
            decoding_key: DecodingKey::from_secret(secret),
            validation,
        }
    }

    pub fn with_audience(mut self, audience: String) -> Self {
        self.validation.set_audience(&[audience]);
        self.validation.validate_aud = true;
        self
    }

    pub fn with_issuer(mut self, issuer: String) -> Self {
        self.validation.set_issuer(&[issuer]);
        self
    }

    pub fn validate(&self, token: &str) -> Result<FleetClaims, JwtError> {
        let token_data = decode::<FleetClaims>(token, &self.decoding_key, &self.validation)
            .map_err(|e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => JwtError::TokenExpired,
                _ => JwtError::EncodingError(e),
            })?;

        if token_data.claims.is_expired() {
            return Err(JwtError::TokenExpired);
        }

        if token_data.claims.tenant_id().is_empty() {
            return Err(JwtError::InvalidToken);
        }

        Ok(token_data.claims)
    }

    /// Encode JWT using HMAC-SHA256 (symmetric secret)
    pub fn encode(secret: &[u8], claims: &FleetClaims) -> Result<String, JwtError> {
        let header = Header::new(Algorithm::HS256);
        let encoding_key = EncodingKey::from_secret(secret);

        Ok(encode(&header, claims, &encoding_key)?)
    }
}

#[async_trait]
impl CredentialVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }

        let claims = self.validate(token).map_err(|e| {
            debug!(error = %e, "JWT verification failed");
            match e {
                JwtError::TokenExpired => AuthError::TokenExpired,
                JwtError::InvalidToken => AuthError::InvalidToken("Invalid JWT".to_string()),
                JwtError::EncodingError(e) => AuthError::InvalidToken(e.to_string()),
            }
        })?;

        Ok(claims.tenant_id().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_SECRET: &[u8] = b"test_secret_key_1234567890";

    fn claims(validity: Duration) -> FleetClaims {
        FleetClaims::new(
            "agent-installer".to_string(),
            "test-issuer".to_string(),
            "test-audience".to_string(),
            validity,
        )
    }

    #[test]
    fn test_jwt_encode_decode() {
        let claims = claims(Duration::hours(1)).with_tenant("acme");
        let token = JwtVerifier::encode(TEST_SECRET, &claims).unwrap();

        let verifier = JwtVerifier::new(TEST_SECRET)
            .with_issuer("test-issuer".to_string())
            .with_audience("test-audience".to_string());

        let decoded = verifier.validate(&token).unwrap();
        assert_eq!(decoded, claims);
        assert_eq!(decoded.tenant_id(), "acme");
    }

    #[tokio::test]
    async fn test_tenant_falls_back_to_subject() {
        let token = JwtVerifier::encode(TEST_SECRET, &claims(Duration::hours(1))).unwrap();
        let verifier = JwtVerifier::new(TEST_SECRET);

        assert_eq!(verifier.verify(&token).await.unwrap(), "agent-installer");
    }

    #[tokio::test]
    async fn test_expired_token() {
        let expired = claims(Duration::seconds(-10));
        assert!(expired.is_expired());

        let token = JwtVerifier::encode(TEST_SECRET, &expired).unwrap();
        let verifier = JwtVerifier::new(TEST_SECRET);

        assert!(matches!(verifier.validate(&token), Err(JwtError::TokenExpired)));
        assert_eq!(verifier.verify(&token).await, Err(AuthError::TokenExpired));
    }

    #[tokio::test]
    async fn test_wrong_secret_rejected() {
        let token = JwtVerifier::encode(b"other-secret", &claims(Duration::hours(1))).unwrap();
        let verifier = JwtVerifier::new(TEST_SECRET);

        assert!(matches!(
            verifier.verify(&token).await,
            Err(AuthError::InvalidToken(_))
        ));
        assert!(matches!(
            verifier.verify("not-a-jwt").await,
            Err(AuthError::InvalidToken(_))
        ));
        assert_eq!(verifier.verify("").await, Err(AuthError::MissingCredential));
    }

    #[test]
    fn test_issuer_mismatch_rejected() {
        let token = JwtVerifier::encode(TEST_SECRET, &claims(Duration::hours(1))).unwrap();
        let verifier = JwtVerifier::new(TEST_SECRET).with_issuer("someone-else".to_string());

        assert!(verifier.validate(&token).is_err());
    }

    #[test]
    fn test_audience_mismatch_rejected() {
        let mut claims = claims(Duration::hours(1));
        claims.aud = "real-aud".to_string();
        let token = JwtVerifier::encode(TEST_SECRET, &claims).unwrap();

        let other = JwtVerifier::new(TEST_SECRET).with_audience("other-aud".to_string());
        assert!(matches!(other.validate(&token), Err(JwtError::EncodingError(_))));

        let expected = JwtVerifier::new(TEST_SECRET).with_audience("real-aud".to_string());
        assert_eq!(expected.validate(&token).unwrap().aud, "real-aud");
    }
}
