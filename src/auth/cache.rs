//! Bearer token cache with single-flight refresh.
//!
//! Token lifecycle:
//! - no token: the first caller logs in
//! - valid: returned immediately
//! - near expiry (inside the refresh margin): the next caller refreshes
//! - refresh failure: every waiter gets the error, the old token is kept
//!
//! Concurrent callers that find the token unusable share one pending refresh
//! instead of each issuing a login.

use chrono::{Duration, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{AuthError, CredentialIssuer, Credentials, Token};

type RefreshFuture = Shared<BoxFuture<'static, Result<Token, AuthError>>>;

#[derive(Default)]
struct Slot {
    token: Option<Token>,
    /// The refresh currently in progress, if any
    pending: Option<RefreshFuture>,
}

fn lock(slot: &Mutex<Slot>) -> MutexGuard<'_, Slot> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where the cached token stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    NoToken,
    Valid,
    NearExpiry,
    Expired,
}

/// Shared token cache; clone the `Arc` into every stage that needs it.
pub struct AuthTokenCache {
    issuer: Arc<dyn CredentialIssuer>,
    credentials: Arc<Credentials>,
    refresh_margin: Duration,
    slot: Arc<Mutex<Slot>>,
    logins: Arc<AtomicU64>,
}

impl AuthTokenCache {
    pub fn new(
        issuer: Arc<dyn CredentialIssuer>,
        credentials: Credentials,
        refresh_margin: std::time::Duration,
    ) -> Self {
        let refresh_margin = Duration::from_std(refresh_margin).unwrap_or_else(|_| Duration::zero());
        tracing::info!(
            email = %credentials.email,
            refresh_margin_secs = refresh_margin.num_seconds(),
            "Auth token cache initialized"
        );
        Self {
            issuer,
            credentials: Arc::new(credentials),
            refresh_margin,
            slot: Arc::new(Mutex::new(Slot::default())),
            logins: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Get a token whose remaining lifetime is at least the refresh margin.
    ///
    /// Returns without suspending when the cached token qualifies. Otherwise
    /// joins (or starts) the single pending refresh.
    pub async fn get_token(&self) -> Result<Token, AuthError> {
        let refresh = {
            let mut slot = lock(&self.slot);
            if let Some(token) = &slot.token {
                if token.remaining(Utc::now()) >= self.refresh_margin {
                    return Ok(token.clone());
                }
            }
            match &slot.pending {
                Some(pending) => pending.clone(),
                None => {
                    let pending = self.start_refresh();
                    slot.pending = Some(pending.clone());
                    pending
                }
            }
        };
        refresh.await
    }

    /// Like [`get_token`](Self::get_token), but falls back to the previous
    /// token when the refresh fails and that token has not expired yet.
    pub async fn get_token_or_stale(&self) -> Result<Token, AuthError> {
        match self.get_token().await {
            Ok(token) => Ok(token),
            Err(e) => {
                let slot = lock(&self.slot);
                match &slot.token {
                    Some(token) if !token.is_expired(Utc::now()) => {
                        tracing::warn!(
                            expires_at = %token.expires_at(),
                            "Token refresh failed ({}), using stale token",
                            e
                        );
                        Ok(token.clone())
                    }
                    _ => Err(e),
                }
            }
        }
    }

    fn start_refresh(&self) -> RefreshFuture {
        let issuer = Arc::clone(&self.issuer);
        let credentials = Arc::clone(&self.credentials);
        let slot = Arc::downgrade(&self.slot);
        let logins = Arc::clone(&self.logins);

        async move {
            logins.fetch_add(1, Ordering::Relaxed);
            tracing::info!(email = %credentials.email, "Token missing or near expiry, performing login");
            let outcome = issuer.login(&credentials).await;

            match &outcome {
                Ok(token) => tracing::info!(expires_at = %token.expires_at(), "Login successful"),
                Err(e) => tracing::error!("Login failed: {}", e),
            }

            if let Some(slot) = slot.upgrade() {
                let finished = {
                    let mut slot = lock(&slot);
                    if let Ok(token) = &outcome {
                        slot.token = Some(token.clone());
                    }
                    slot.pending.take()
                };
                drop(finished);
            }
            outcome
        }
        .boxed()
        .shared()
    }

    /// Current state of the cached token.
    pub fn state(&self) -> TokenState {
        let slot = lock(&self.slot);
        let now = Utc::now();
        match &slot.token {
            None => TokenState::NoToken,
            Some(token) if token.is_expired(now) => TokenState::Expired,
            Some(token) if token.remaining(now) < self.refresh_margin => TokenState::NearExpiry,
            Some(_) => TokenState::Valid,
        }
    }

    /// The cached token, whatever its state.
    pub fn cached(&self) -> Option<Token> {
        lock(&self.slot).token.clone()
    }

    /// Drop the cached token; the next call logs in again.
    pub fn invalidate(&self) {
        tracing::info!("Clearing cached token");
        lock(&self.slot).token = None;
    }

    /// Login calls issued so far.
    pub fn login_count(&self) -> u64 {
        self.logins.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration as StdDuration;

    /// Issuer that hands out numbered tokens with a fixed lifetime.
    struct CountingIssuer {
        calls: AtomicU64,
        lifetime: Duration,
        delay: StdDuration,
        fail: AtomicBool,
    }

    impl CountingIssuer {
        fn new(lifetime: Duration, delay: StdDuration) -> Self {
            Self {
                calls: AtomicU64::new(0),
                lifetime,
                delay,
                fail: AtomicBool::new(false),
            }
        }

        fn calls(&self) -> u64 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CredentialIssuer for CountingIssuer {
        async fn login(&self, credentials: &Credentials) -> Result<Token, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            if self.fail.load(Ordering::SeqCst) {
                return Err(AuthError::Rejected("401 - bad credentials".to_string()));
            }
            Ok(Token::new(
                format!("{}-token-{}", credentials.email, n),
                Utc::now() + self.lifetime,
            ))
        }
    }

    fn cache_with(issuer: Arc<CountingIssuer>, margin_secs: u64) -> Arc<AuthTokenCache> {
        Arc::new(AuthTokenCache::new(
            issuer,
            Credentials::new("worker@test.com", "secret"),
            StdDuration::from_secs(margin_secs),
        ))
    }

    #[tokio::test]
    async fn test_valid_token_is_reused() {
        let issuer = Arc::new(CountingIssuer::new(Duration::hours(1), StdDuration::ZERO));
        let cache = cache_with(issuer.clone(), 300);
        assert_eq!(cache.state(), TokenState::NoToken);

        let first = cache.get_token().await.unwrap();
        let second = cache.get_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(issuer.calls(), 1);
        assert_eq!(cache.state(), TokenState::Valid);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_login() {
        let issuer = Arc::new(CountingIssuer::new(
            Duration::hours(1),
            StdDuration::from_millis(50),
        ));
        let cache = cache_with(issuer.clone(), 300);

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_token().await }));
        }

        let mut values = Vec::new();
        for handle in handles {
            values.push(handle.await.unwrap().unwrap().value().to_string());
        }

        assert_eq!(issuer.calls(), 1);
        assert_eq!(cache.login_count(), 1);
        assert!(values.iter().all(|v| v == &values[0]));
    }

    #[tokio::test]
    async fn test_near_expiry_triggers_refresh() {
        // Lifetime shorter than the margin: every token is born near expiry.
        let issuer = Arc::new(CountingIssuer::new(Duration::seconds(60), StdDuration::ZERO));
        let cache = cache_with(issuer.clone(), 300);

        let first = cache.get_token().await.unwrap();
        assert_eq!(cache.state(), TokenState::NearExpiry);

        let second = cache.get_token().await.unwrap();
        assert_ne!(first, second);
        assert_eq!(issuer.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_reaches_every_waiter() {
        let issuer = Arc::new(CountingIssuer::new(
            Duration::hours(1),
            StdDuration::from_millis(50),
        ));
        issuer.fail.store(true, Ordering::SeqCst);
        let cache = cache_with(issuer.clone(), 300);

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_token().await }));
        }
        for handle in handles {
            let err = handle.await.unwrap().unwrap_err();
            assert!(matches!(err, AuthError::Rejected(_)));
        }
        assert_eq!(issuer.calls(), 1);

        // Failures are not cached.
        issuer.fail.store(false, Ordering::SeqCst);
        assert!(cache.get_token().await.is_ok());
        assert_eq!(issuer.calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_token_fallback() {
        let issuer = Arc::new(CountingIssuer::new(Duration::seconds(120), StdDuration::ZERO));
        let cache = cache_with(issuer.clone(), 300);

        let original = cache.get_token().await.unwrap();
        issuer.fail.store(true, Ordering::SeqCst);

        assert!(cache.get_token().await.is_err());
        let stale = cache.get_token_or_stale().await.unwrap();
        assert_eq!(stale, original);
        assert_eq!(cache.cached(), Some(original));
    }

    #[tokio::test]
    async fn test_no_fallback_without_token() {
        let issuer = Arc::new(CountingIssuer::new(Duration::hours(1), StdDuration::ZERO));
        issuer.fail.store(true, Ordering::SeqCst);
        let cache = cache_with(issuer, 300);

        assert!(cache.get_token_or_stale().await.is_err());
    }

    #[tokio::test]
    async fn test_invalidate_forces_login() {
        let issuer = Arc::new(CountingIssuer::new(Duration::hours(1), StdDuration::ZERO));
        let cache = cache_with(issuer.clone(), 300);

        cache.get_token().await.unwrap();
        cache.invalidate();
        assert_eq!(cache.state(), TokenState::NoToken);

        cache.get_token().await.unwrap();
        assert_eq!(issuer.calls(), 2);
    }
}
