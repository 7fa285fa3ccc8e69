//! Stateless JWT token service
//!
//! Issues and verifies the signed, time-boxed identity tokens that protected
//! requests carry. Tokens are HS256-signed with one shared secret, embed the
//! subject id and role, and die only by expiry — the server keeps no record
//! of issued tokens and no revocation list.
//!
//! Verification is a pure function of the claims, the current time and the
//! secret. Failures come back as [`TokenError`] values (never panics), and
//! clients are told only a generic "not authorized" — the reason stays in
//! the logs.

use anyhow::Context;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;

/// Token lifetime when none is configured: 30 days.
pub const DEFAULT_TOKEN_LIFETIME_SECS: u64 = 2_592_000;

const DEFAULT_ISSUER: &str = "flightdeck-api";

/// Claims carried by every issued token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id)
    pub id: i64,
    /// Role granted to the subject
    pub role: String,
    /// Issuer tag
    pub iss: String,
    /// Issued at (Unix timestamp)
    pub iat: i64,
    /// Expiration time (Unix timestamp)
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("token is malformed: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token issuer does not match")]
    IssuerMismatch,

    #[error("token has expired")]
    Expired,

    #[error("token is not valid yet")]
    NotYetValid,

    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// JWT configuration
#[derive(Clone)]
pub struct JwtConfig {
    /// Shared HS256 signing secret
    pub secret: String,
    /// Issuer tag stamped into and required from every token
    pub issuer: String,
    /// Token lifetime in seconds
    pub expiry_seconds: u64,
}

impl fmt::Debug for JwtConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JwtConfig")
            .field("secret", &"[REDACTED]")
            .field("issuer", &self.issuer)
            .field("expiry_seconds", &self.expiry_seconds)
            .finish()
    }
}

impl JwtConfig {
    /// Load JWT configuration from environment variables. The secret is
    /// required; issuer and expiry fall back to defaults.
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            secret: std::env::var("JWT_SECRET").context("JWT_SECRET must be set")?,
            issuer: std::env::var("JWT_ISSUER").unwrap_or_else(|_| DEFAULT_ISSUER.to_string()),
            expiry_seconds: std::env::var("JWT_EXPIRY_SECONDS")
                .unwrap_or_else(|_| DEFAULT_TOKEN_LIFETIME_SECS.to_string())
                .parse()
                .context("Invalid JWT_EXPIRY_SECONDS")?,
        })
    }
}

/// Issues and verifies identity tokens. Stateless; one instance is shared by
/// every request-handling task without locking.
pub struct TokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    issuer: String,
    lifetime: Duration,
}

impl TokenService {
    pub fn new(config: &JwtConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            lifetime: Duration::seconds(config.expiry_seconds as i64),
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    /// Issue a token asserting the subject id and role, valid from now until
    /// now plus the configured lifetime.
    pub fn issue(&self, subject_id: i64, role: &str) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = Claims {
            id: subject_id,
            role: role.to_string(),
            iss: self.issuer.clone(),
            iat: now.timestamp(),
            exp: (now + self.lifetime).timestamp(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| TokenError::Signing(e.to_string()))?;

        debug!(subject_id, role, "issued token");
        Ok(token)
    }

    /// Decode and verify a token: signature, issuer tag, and that the
    /// current time falls within `[iat, exp)`. No clock-skew leeway.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[&self.issuer]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.validate_exp = true;
        validation.leeway = 0;

        let data =
            decode::<Claims>(token, &self.decoding, &validation).map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => TokenError::Expired,
                ErrorKind::ImmatureSignature => TokenError::NotYetValid,
                ErrorKind::InvalidSignature => TokenError::InvalidSignature,
                ErrorKind::InvalidIssuer => TokenError::IssuerMismatch,
                _ => TokenError::Malformed(e.to_string()),
            })?;

        let claims = data.claims;
        if claims.iat > Utc::now().timestamp() {
            return Err(TokenError::NotYetValid);
        }

        Ok(claims)
    }
}
