//! HTTP login against the backend's auth endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use super::{AuthError, CredentialIssuer, Credentials, Token};

/// Lifetime assumed when the access token carries no readable `exp` claim.
const FALLBACK_LIFETIME_SECS: i64 = 3600;

#[derive(Serialize)]
struct LoginRequest<'a> {
    email: &'a str,
    password: &'a str,
}

#[derive(Deserialize, Default)]
struct LoginResponse {
    #[serde(default)]
    data: LoginData,
}

#[derive(Deserialize, Default)]
struct LoginData {
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct ExpiryClaims {
    exp: Option<i64>,
}

/// Posts credentials as JSON and reads `data.access_token` from the reply.
pub struct HttpCredentialIssuer {
    client: reqwest::Client,
    url: String,
}

impl HttpCredentialIssuer {
    pub fn new(url: impl Into<String>, timeout: std::time::Duration) -> Result<Self, AuthError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let url = url.into();
        tracing::info!(%url, "HTTP credential issuer initialized");
        Ok(Self { client, url })
    }
}

#[async_trait]
impl CredentialIssuer for HttpCredentialIssuer {
    async fn login(&self, credentials: &Credentials) -> Result<Token, AuthError> {
        tracing::info!(email = %credentials.email, "Attempting login");

        let response = self
            .client
            .post(&self.url)
            .json(&LoginRequest {
                email: &credentials.email,
                password: &credentials.password,
            })
            .send()
            .await
            .map_err(|e| AuthError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AuthError::Rejected(format!("{} - {}", status, body)));
        }

        let body: LoginResponse = response
            .json()
            .await
            .map_err(|e| AuthError::InvalidResponse(e.to_string()))?;
        let access_token = body
            .data
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| AuthError::InvalidResponse("missing data.access_token".to_string()))?;

        let expires_at = token_expiry(&access_token, Utc::now());
        Ok(Token::new(access_token, expires_at))
    }
}

/// Read the expiry from a JWT's `exp` claim without checking its signature.
///
/// Tokens that cannot be decoded are assumed to live for one hour.
pub fn token_expiry(raw: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let fallback = now + Duration::seconds(FALLBACK_LIFETIME_SECS);
    match decode::<ExpiryClaims>(raw, &DecodingKey::from_secret(&[]), &validation) {
        Ok(data) => match data.claims.exp.and_then(|exp| DateTime::from_timestamp(exp, 0)) {
            Some(expires_at) => expires_at,
            None => {
                tracing::warn!("No expiry in token, assuming 1 hour");
                fallback
            }
        },
        Err(e) => {
            tracing::warn!("Could not decode token: {}, assuming 1 hour expiry", e);
            fallback
        }
    }
}
