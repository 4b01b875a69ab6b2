//! The client facade: one instance per browsing context.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, instrument, warn};

use crate::callback::CallbackProcessor;
use crate::config::{ClientSettings, Config};
use crate::error::Result;
use crate::events::{EventBus, EventKind, OidcEvent, SubscriptionId, spawn_storage_bridge};
use crate::flow::FlowStore;
use crate::http::{HttpTransport, ReqwestTransport};
use crate::jwt::{self, JwtClaims};
use crate::location::Location;
use crate::login::FlowInitiator;
use crate::metadata::{MetadataCache, OidcMetadataConfig};
use crate::outcome::{InitOutcome, RedirectOutcome};
use crate::refresh::{RefreshLock, RefreshOutcome, RefreshScheduler};
use crate::store::{ExpiringStore, KeyValueStore, MemoryStore, StorageWatcher};
use crate::task::ScheduledTask;
use crate::tokens::{TokenLedger, TokenSet};

/// Interval of the expired-entry sweep over the durable store.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// The stored access token and its decoded claims.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub access_token: String,
    pub claims: JwtClaims,
}

#[derive(Default)]
struct Tasks {
    sweep: Option<ScheduledTask>,
    refresh: Option<ScheduledTask>,
    bridge: Option<ScheduledTask>,
}

impl Tasks {
    fn stop_all(&mut self) {
        for task in [&mut self.sweep, &mut self.refresh, &mut self.bridge]
            .into_iter()
            .flatten()
        {
            task.stop();
        }
        *self = Self::default();
    }
}

/// Builder for [`OidcClient`].
pub struct OidcClientBuilder {
    settings: ClientSettings,
    location: Arc<dyn Location>,
    durable: Option<Arc<dyn KeyValueStore>>,
    watcher: Option<Arc<dyn StorageWatcher>>,
    session: Option<Arc<dyn KeyValueStore>>,
    http: Option<Arc<dyn HttpTransport>>,
}

impl OidcClientBuilder {
    /// Durable storage without change notifications.
    ///
    /// Without a [`watcher`](Self::watcher), changes made by other contexts
    /// raise no events here.
    pub fn durable_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.durable = Some(store);
        self
    }

    /// Durable storage that also reports changes made by other contexts.
    pub fn shared_store<S>(mut self, store: S) -> Self
    where
        S: KeyValueStore + StorageWatcher + 'static,
    {
        let store = Arc::new(store);
        self.durable = Some(Arc::clone(&store) as Arc<dyn KeyValueStore>);
        self.watcher = Some(store as Arc<dyn StorageWatcher>);
        self
    }

    pub fn watcher(mut self, watcher: Arc<dyn StorageWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    /// Storage private to this context, holding pending login flows.
    pub fn session_store(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.session = Some(store);
        self
    }

    pub fn http(mut self, http: Arc<dyn HttpTransport>) -> Self {
        self.http = Some(http);
        self
    }

    /// Resolve the configuration and wire the components together.
    pub fn build(self) -> Result<OidcClient> {
        let config = Arc::new(Config::resolve(&self.settings, &self.location.href())?);

        let (durable, watcher) = match self.durable {
            Some(durable) => (durable, self.watcher),
            None => {
                let memory = Arc::new(MemoryStore::new());
                let watcher = self
                    .watcher
                    .unwrap_or_else(|| Arc::clone(&memory) as Arc<dyn StorageWatcher>);
                (memory as Arc<dyn KeyValueStore>, Some(watcher))
            }
        };
        let session = self
            .session
            .unwrap_or_else(|| Arc::new(MemoryStore::new()) as Arc<dyn KeyValueStore>);
        let http = self
            .http
            .unwrap_or_else(|| Arc::new(ReqwestTransport::new()) as Arc<dyn HttpTransport>);

        let store = ExpiringStore::new(durable, Arc::clone(&config));
        let flows = FlowStore::new(session, Arc::clone(&config));
        let events = EventBus::new();
        let ledger = TokenLedger::new(store.clone(), events.clone());
        let metadata = MetadataCache::new(store.clone(), Arc::clone(&http), Arc::clone(&config));
        let lock = RefreshLock::new(store.clone());

        let initiator = FlowInitiator::new(
            Arc::clone(&config),
            metadata.clone(),
            flows.clone(),
            ledger.clone(),
            Arc::clone(&self.location),
        );
        let callback = CallbackProcessor::new(
            Arc::clone(&config),
            metadata.clone(),
            flows,
            ledger.clone(),
            Arc::clone(&http),
            self.location,
        );
        let refresh = RefreshScheduler::new(
            Arc::clone(&config),
            ledger.clone(),
            lock.clone(),
            metadata.clone(),
            http,
        );

        debug!(authority = %config.authority, client_id = %config.client_id, "OIDC client built");

        Ok(OidcClient {
            config,
            store,
            events,
            ledger,
            metadata,
            initiator,
            callback,
            refresh,
            lock,
            watcher,
            tasks: tokio::sync::Mutex::new(Tasks::default()),
        })
    }
}

/// Authorization Code + PKCE client.
///
/// Background work (store sweep, token refresh, cross-context events) starts
/// in [`init`](Self::init) and stops on [`shutdown`](Self::shutdown) or drop.
pub struct OidcClient {
    config: Arc<Config>,
    store: ExpiringStore,
    events: EventBus,
    ledger: TokenLedger,
    metadata: MetadataCache,
    initiator: FlowInitiator,
    callback: CallbackProcessor,
    refresh: RefreshScheduler,
    lock: RefreshLock,
    watcher: Option<Arc<dyn StorageWatcher>>,
    tasks: tokio::sync::Mutex<Tasks>,
}

impl OidcClient {
    pub fn builder(settings: ClientSettings, location: Arc<dyn Location>) -> OidcClientBuilder {
        OidcClientBuilder {
            settings,
            location,
            durable: None,
            watcher: None,
            session: None,
            http: None,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_initialised(&self) -> bool {
        self.ledger.is_initialised()
    }

    /// Start the client.
    ///
    /// Starts the store sweep, then completes a pending login callback if the
    /// current URL carries one (returning [`InitOutcome::Navigated`]).
    /// Otherwise runs one refresh check, starts the refresh loop, enables
    /// events and subscribes to changes from other contexts. Calling it again
    /// after success does nothing.
    #[instrument(skip(self), fields(client_id = %self.config.client_id))]
    pub async fn init(&self) -> Result<InitOutcome> {
        let mut tasks = self.tasks.lock().await;
        if self.ledger.is_initialised() {
            debug!("Client already initialised");
            return Ok(InitOutcome::Ready);
        }

        if tasks.sweep.is_none() {
            let store = self.store.clone();
            let sweep = move || {
                let store = store.clone();
                async move {
                    if let Err(e) = store.sweep() {
                        error!(error = %e, "Store sweep failed");
                    }
                }
            };
            tasks.sweep = Some(ScheduledTask::every(
                "store-sweep",
                SWEEP_INTERVAL,
                Duration::ZERO,
                sweep,
            ));
        }

        if let Some(url) = self.callback.handle().await? {
            return Ok(InitOutcome::Navigated(url));
        }

        self.refresh.run_tick().await;
        tasks.refresh = Some(self.refresh.start());
        self.ledger.mark_initialised();

        match &self.watcher {
            Some(watcher) => {
                tasks.bridge = Some(spawn_storage_bridge(
                    watcher.watch(),
                    self.ledger.access_token_key(),
                    self.events.clone(),
                ));
            }
            None => {
                warn!("No storage watcher configured, changes from other contexts raise no events");
            }
        }

        info!("OIDC client initialised");
        Ok(InitOutcome::Ready)
    }

    /// Redirect to the provider's login page unless already authenticated.
    pub async fn login(&self, redirect_uri: Option<&str>) -> Result<RedirectOutcome> {
        self.initiator.login(redirect_uri).await
    }

    /// Clear tokens and redirect to the provider's end-session endpoint.
    pub async fn logout(&self) -> Result<RedirectOutcome> {
        self.initiator.logout().await
    }

    pub fn get_user_tokens(&self) -> TokenSet {
        self.ledger.read_all()
    }

    /// The access token with its claims, if one is stored and decodable.
    pub fn session(&self) -> Option<Session> {
        let access_token = self.ledger.read_all().access_token?;
        match jwt::decode(&access_token) {
            Ok(claims) => Some(Session { access_token, claims }),
            Err(e) => {
                warn!(error = %e, "Stored access token is not decodable");
                None
            }
        }
    }

    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&OidcEvent) + Send + Sync + 'static,
    {
        self.events.on(kind, handler)
    }

    pub fn off(&self, id: SubscriptionId) -> bool {
        self.events.off(id)
    }

    /// True if another context is refreshing; otherwise claims the refresh
    /// lock for this one and returns false.
    ///
    /// A storage failure while claiming the lock is logged and reported as
    /// not pending.
    pub fn is_refresh_requests_pending(&self) -> bool {
        match self.lock.try_acquire() {
            Ok(acquired) => !acquired,
            Err(e) => {
                warn!(error = %e, "Failed to claim the refresh lock");
                false
            }
        }
    }

    /// Run one refresh check now.
    pub async fn refresh_now(&self) -> Result<RefreshOutcome> {
        self.refresh.tick().await
    }

    /// Validated provider metadata, from cache when fresh.
    pub async fn metadata(&self) -> Result<OidcMetadataConfig> {
        self.metadata.get().await
    }

    /// Stop every background task. Events stay enabled.
    pub async fn shutdown(&self) {
        self.tasks.lock().await.stop_all();
        debug!("OIDC client background tasks stopped");
    }
}
