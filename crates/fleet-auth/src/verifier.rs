//! Credential verification

use async_trait::async_trait;
use std::collections::HashMap;
use thiserror::Error;

/// Authentication errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    #[error("Missing credential")]
    MissingCredential,

    #[error("Token expired")]
    TokenExpired,

    #[error("Invalid token: {0}")]
    InvalidToken(String),

    #[error("Unknown credential")]
    UnknownCredential,

    #[error("Assignment resolution failed: {0}")]
    Resolver(String),
}

/// Resolves a bearer credential to the tenant that owns it
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<String, AuthError>;
}

/// Fixed token → tenant table
#[derive(Debug, Clone, Default)]
pub struct StaticTokenVerifier {
    tokens: HashMap<String, String>,
}

impl StaticTokenVerifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(mut self, token: impl Into<String>, tenant: impl Into<String>) -> Self {
        self.tokens.insert(token.into(), tenant.into());
        self
    }

    /// Parse a `token=tenant,token=tenant` list
    pub fn parse(spec: &str) -> Result<Self, AuthError> {
        let mut verifier = Self::new();
        for entry in spec.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let (token, tenant) = entry
                .split_once('=')
                .map(|(t, n)| (t.trim(), n.trim()))
                .filter(|(t, n)| !t.is_empty() && !n.is_empty())
                .ok_or_else(|| {
                    AuthError::InvalidToken(format!("expected token=tenant, got '{}'", entry))
                })?;
            verifier.tokens.insert(token.to_string(), tenant.to_string());
        }
        Ok(verifier)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

#[async_trait]
impl CredentialVerifier for StaticTokenVerifier {
    async fn verify(&self, token: &str) -> Result<String, AuthError> {
        if token.is_empty() {
            return Err(AuthError::MissingCredential);
        }
        self.tokens
            .get(token)
            .cloned()
            .ok_or(AuthError::UnknownCredential)
    }
}
