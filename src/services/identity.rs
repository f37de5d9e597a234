//! Bearer-token verification.
//!
//! The gate only depends on [`IdentityVerifier`]; [`JwtVerifier`] is the
//! production implementation for tokens issued by the identity provider,
//! either HS256 with a shared secret or RS256 against the provider's public key.

use crate::config::TokenConfig;
use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;
use thiserror::Error;

/// Claims extracted from a token that passed verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedToken {
    pub subject_id: String,
    pub email: String,
    pub name: Option<String>,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("token rejected: {0}")]
    Rejected(String),
    #[error("token has no email claim")]
    MissingEmail,
    #[error("identity verifier is not configured")]
    NotConfigured,
    #[error("invalid token verification key: {0}")]
    InvalidKey(String),
}

#[async_trait]
pub trait IdentityVerifier: Send + Sync {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, IdentityError>;
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
    email: Option<String>,
    name: Option<String>,
}

/// Verifies JWTs signed with HS256 (shared secret) or RS256 (public key).
pub struct JwtVerifier {
    key: Option<DecodingKey>,
    validation: Validation,
}

impl JwtVerifier {
    /// Fails only when a configured RSA public key cannot be parsed.
    pub fn new(cfg: &TokenConfig) -> Result<Self, IdentityError> {
        let (key, algorithm) = match &cfg.public_key_pem {
            Some(pem) => {
                let key = DecodingKey::from_rsa_pem(pem.as_bytes())
                    .map_err(|err| IdentityError::InvalidKey(err.to_string()))?;
                (Some(key), Algorithm::RS256)
            }
            None if cfg.secret.is_empty() => (None, Algorithm::HS256),
            None => (
                Some(DecodingKey::from_secret(cfg.secret.expose().as_bytes())),
                Algorithm::HS256,
            ),
        };

        // a token's header may only name the configured algorithm
        let mut validation = Validation::new(algorithm);
        validation.set_required_spec_claims(&["exp", "sub"]);
        if let Some(issuer) = &cfg.issuer {
            validation.set_issuer(&[issuer]);
        }
        match &cfg.audience {
            Some(audience) => validation.set_audience(&[audience]),
            None => validation.validate_aud = false,
        }

        Ok(Self { key, validation })
    }
}

#[async_trait]
impl IdentityVerifier for JwtVerifier {
    async fn verify(&self, token: &str) -> Result<VerifiedToken, IdentityError> {
        let key = self.key.as_ref().ok_or(IdentityError::NotConfigured)?;
        let data = decode::<Claims>(token, key, &self.validation)
            .map_err(|err| IdentityError::Rejected(err.to_string()))?;

        let email = data
            .claims
            .email
            .filter(|e| !e.trim().is_empty())
            .ok_or(IdentityError::MissingEmail)?;

        Ok(VerifiedToken {
            subject_id: data.claims.sub,
            email: email.trim().to_ascii_lowercase(),
            name: data.claims.name,
        })
    }
}
