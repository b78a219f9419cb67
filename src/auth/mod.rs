//! Credential handling for outbound calls.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::fmt;
use thiserror::Error;

pub mod cache;
pub mod http;

pub use cache::{AuthTokenCache, TokenState};
pub use http::HttpCredentialIssuer;

/// Authentication failure, shared by every caller waiting on one refresh.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Authentication rejected: {0}")]
    Rejected(String),

    #[error("Authentication transport error: {0}")]
    Transport(String),

    #[error("Invalid authentication response: {0}")]
    InvalidResponse(String),
}

/// Login credentials handed to the issuer.
#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl Credentials {
    pub fn new(email: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Bearer credential with its expiry.
#[derive(Clone, PartialEq, Eq)]
pub struct Token {
    value: String,
    expires_at: DateTime<Utc>,
}

impl Token {
    pub fn new(value: impl Into<String>, expires_at: DateTime<Utc>) -> Self {
        Self {
            value: value.into(),
            expires_at,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    /// Lifetime left at `now` (negative once expired).
    pub fn remaining(&self, now: DateTime<Utc>) -> Duration {
        self.expires_at - now
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("value", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Issues tokens; supplied by the host.
#[async_trait]
pub trait CredentialIssuer: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> Result<Token, AuthError>;
}
