use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;

use crate::types::Token;
use crate::Error;

/// Holds the last token of one provider and serializes refreshes
///
/// The lock is held while a refresh is in flight, so callers arriving meanwhile wait for
/// that refresh and then find its token instead of starting their own.
#[derive(Debug)]
pub(crate) struct TokenCache {
    margin: Duration,
    slot: Mutex<Option<CachedToken>>,
}

/// A token together with the instant it turns stale, always replaced as a whole
#[derive(Debug)]
struct CachedToken {
    token: Arc<Token>,
    stale_at: DateTime<Utc>,
}

impl CachedToken {
    fn new(token: Arc<Token>, margin: Duration) -> Self {
        Self {
            stale_at: token.stale_at(margin),
            token,
        }
    }

    fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        now < self.stale_at
    }
}

impl TokenCache {
    pub(crate) fn new(margin: Duration) -> Self {
        Self {
            margin,
            slot: Mutex::new(None),
        }
    }

    /// Return the cached token if it is still fresh, otherwise `refresh` and store the result
    pub(crate) async fn get<F, Fut>(&self, refresh: F) -> Result<Arc<Token>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token, Error>>,
    {
        let mut slot = self.slot.lock().await;
        if let Some(cached) = slot.as_ref() {
            if cached.is_fresh_at(Utc::now()) {
                return Ok(cached.token.clone());
            }
            debug!(stale_at = %cached.stale_at, "cached token is stale");
        }

        let token = Arc::new(refresh().await?);
        *slot = Some(CachedToken::new(token.clone(), self.margin));
        Ok(token)
    }

    /// Refresh unconditionally
    ///
    /// On failure the previously cached token, if any, stays in place.
    pub(crate) async fn refresh<F, Fut>(&self, refresh: F) -> Result<Arc<Token>, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Token, Error>>,
    {
        let mut slot = self.slot.lock().await;
        let token = Arc::new(refresh().await?);
        *slot = Some(CachedToken::new(token.clone(), self.margin));
        Ok(token)
    }

    #[cfg(test)]
    pub(crate) async fn cached(&self) -> Option<Arc<Token>> {
        self.slot.lock().await.as_ref().map(|cached| cached.token.clone())
    }
}
