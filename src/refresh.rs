//! Background access token renewal.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::error::Result;
use crate::http::HttpTransport;
use crate::metadata::MetadataCache;
use crate::store::{ExpiringStore, now_millis};
use crate::task::ScheduledTask;
use crate::tokens::{TokenLedger, TokenResponse};

/// Store postfix of the shared refresh lock.
pub const REFRESH_LOCK_POSTFIX: &str = "refreshLock";

/// Lifetime of a refresh lock entry.
pub const REFRESH_LOCK_TTL_MS: i64 = 10_000;

/// Pause between the end of one refresh check and the start of the next.
///
/// Not shorter than [`REFRESH_LOCK_TTL_MS`], so a context's own lock has
/// expired by its next check.
pub const REFRESH_PERIOD: Duration = Duration::from_secs(10);

/// Access tokens expiring within this window are renewed.
pub const EXPIRE_SOON_THRESHOLD_MS: i64 = 30_000;

/// Advisory lock over shared storage.
///
/// Acquisition is read-then-write, not atomic: two contexts may both see the
/// lock free and both refresh. The entry expires on its own and is never
/// released explicitly.
#[derive(Clone)]
pub struct RefreshLock {
    store: ExpiringStore,
}

impl RefreshLock {
    pub fn new(store: ExpiringStore) -> Self {
        Self { store }
    }

    pub fn is_held(&self) -> bool {
        self.store.get_value::<bool>(REFRESH_LOCK_POSTFIX) == Some(true)
    }

    /// Take the lock unless someone holds it. Returns whether it was taken.
    pub fn try_acquire(&self) -> Result<bool> {
        if self.is_held() {
            debug!("Refresh lock held elsewhere");
            return Ok(false);
        }
        self.store.set(
            REFRESH_LOCK_POSTFIX,
            &true,
            Some(now_millis() + REFRESH_LOCK_TTL_MS),
        )?;
        debug!("Refresh lock acquired");
        Ok(true)
    }
}

/// What a refresh tick did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// The access token is not close to expiry, or there is no refresh token.
    NotDue,
    /// Another context holds the refresh lock.
    LockHeld,
    Refreshed,
    /// The provider rejected the refresh token; all tokens were cleared.
    Cleared,
}

#[derive(Clone)]
pub struct RefreshScheduler {
    config: Arc<Config>,
    ledger: TokenLedger,
    lock: RefreshLock,
    metadata: MetadataCache,
    http: Arc<dyn HttpTransport>,
}

impl RefreshScheduler {
    pub fn new(
        config: Arc<Config>,
        ledger: TokenLedger,
        lock: RefreshLock,
        metadata: MetadataCache,
        http: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            config,
            ledger,
            lock,
            metadata,
            http,
        }
    }

    /// Renew the access token if it expires within the threshold.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<RefreshOutcome> {
        let tokens = self.ledger.read_all();
        let expire_soon = tokens.access_token_expire_in - now_millis() <= EXPIRE_SOON_THRESHOLD_MS;
        let Some(refresh_token) = tokens.refresh_token.filter(|_| expire_soon) else {
            return Ok(RefreshOutcome::NotDue);
        };

        if !self.lock.try_acquire()? {
            return Ok(RefreshOutcome::LockHeld);
        }

        let metadata = self.metadata.get().await?;
        let form = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token.as_str()),
            ("scope", self.config.scope.as_str()),
            ("client_id", self.config.client_id.as_str()),
        ];
        let response = self
            .http
            .post_form(metadata.token_endpoint.as_str(), &form)
            .await?;

        match TokenResponse::from_http(&response) {
            Ok(tokens) => {
                self.ledger.write_all(&tokens)?;
                info!("Access token refreshed");
                Ok(RefreshOutcome::Refreshed)
            }
            Err(e) => {
                warn!(error = %e, "Token refresh rejected, clearing tokens");
                self.ledger.remove_all()?;
                Ok(RefreshOutcome::Cleared)
            }
        }
    }

    /// [`tick`](Self::tick) with errors logged instead of returned.
    pub async fn run_tick(&self) {
        if let Err(e) = self.tick().await {
            error!(error = %e, "REFRESH TOKEN: refresh tick failed");
        }
    }

    /// Tick [`REFRESH_PERIOD`] from now, then [`REFRESH_PERIOD`] after each
    /// tick completes. A failed tick is logged and the loop keeps going.
    pub fn start(&self) -> ScheduledTask {
        let scheduler = self.clone();
        ScheduledTask::every("token-refresh", REFRESH_PERIOD, REFRESH_PERIOD, move || {
            let scheduler = scheduler.clone();
            async move { scheduler.run_tick().await }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientSettings;
    use crate::store::MemoryStore;
    use url::Url;

    fn lock_pair() -> (RefreshLock, RefreshLock) {
        let page = Url::parse("https://app.example.com/").unwrap();
        let settings = ClientSettings::new("https://idp.example.com", "spa");
        let config = Arc::new(Config::resolve(&settings, &page).unwrap());
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.attach();
        (
            RefreshLock::new(ExpiringStore::new(Arc::new(tab_a), Arc::clone(&config))),
            RefreshLock::new(ExpiringStore::new(Arc::new(tab_b), config)),
        )
    }

    #[test]
    fn test_lock_is_shared_between_contexts() {
        let (a, b) = lock_pair();
        assert!(!a.is_held());
        assert!(a.try_acquire().unwrap());
        assert!(b.is_held());
        assert!(!b.try_acquire().unwrap());
        assert!(!a.try_acquire().unwrap());
    }

    #[test]
    fn test_expired_lock_is_free() {
        let (a, b) = lock_pair();
        a.store
            .set(REFRESH_LOCK_POSTFIX, &true, Some(now_millis() - 1))
            .unwrap();
        assert!(!b.is_held());
        assert!(b.try_acquire().unwrap());
    }

    #[test]
    fn test_period_outlasts_own_lock() {
        assert!(REFRESH_PERIOD.as_millis() >= REFRESH_LOCK_TTL_MS as u128);
    }

    #[test]
    fn test_false_lock_value_is_free() {
        let (a, _) = lock_pair();
        a.store.set(REFRESH_LOCK_POSTFIX, &false, None).unwrap();
        assert!(!a.is_held());
    }
}
