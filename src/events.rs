//! Login lifecycle events and their propagation between client instances.
//!
//! [`EventBus`] delivers events raised by this instance. The storage bridge
//! ([`spawn_storage_bridge`]) turns changes to the shared access-token entry
//! made by *other* instances into the same events, using [`synthesize`].

use std::sync::{Arc, PoisonError, RwLock};

use tracing::debug;

use crate::store::{StorageChanges, StoredValue, now_millis};
use crate::task::ScheduledTask;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Login,
    Logout,
    AccessTokenUpdated,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::Logout => "logout",
            Self::AccessTokenUpdated => "accessTokenUpdated",
        }
    }
}

/// An event together with its payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OidcEvent {
    /// A user became authenticated.
    Login { access_token: String },
    /// The stored tokens were cleared.
    Logout,
    /// The access token was replaced.
    AccessTokenUpdated {
        access_token: String,
        old_access_token: String,
    },
}

impl OidcEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::Login { .. } => EventKind::Login,
            Self::Logout => EventKind::Logout,
            Self::AccessTokenUpdated { .. } => EventKind::AccessTokenUpdated,
        }
    }
}

/// Handle returned by [`EventBus::on`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type EventHandler = Arc<dyn Fn(&OidcEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(SubscriptionId, EventKind, EventHandler)>,
}

/// Typed subscribe/unsubscribe/publish. Clones share subscribers.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<RwLock<Registry>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&OidcEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        registry.next_id += 1;
        let id = SubscriptionId(registry.next_id);
        registry.handlers.push((id, kind, Arc::new(handler)));
        id
    }

    /// Unregister a handler. Returns false if it was not registered.
    pub fn off(&self, id: SubscriptionId) -> bool {
        let mut registry = self.registry.write().unwrap_or_else(PoisonError::into_inner);
        let before = registry.handlers.len();
        registry.handlers.retain(|(sub, _, _)| *sub != id);
        registry.handlers.len() != before
    }

    /// Deliver `event` to every handler of its kind, in registration order.
    ///
    /// Handlers run after the registry lock is released, so they may
    /// subscribe or unsubscribe.
    pub fn emit(&self, event: &OidcEvent) {
        let kind = event.kind();
        let handlers: Vec<EventHandler> = {
            let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .handlers
                .iter()
                .filter(|(_, k, _)| *k == kind)
                .map(|(_, _, handler)| Arc::clone(handler))
                .collect()
        };
        debug!(event = kind.as_str(), handlers = handlers.len(), "Emitting event");
        for handler in handlers {
            handler(event);
        }
    }

    pub fn handler_count(&self, kind: EventKind) -> usize {
        self.registry
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .handlers
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.read().unwrap_or_else(PoisonError::into_inner);
        f.debug_struct("EventBus")
            .field("handlers", &registry.handlers.len())
            .finish()
    }
}

// =============================================================================
// Cross-context bridge
// =============================================================================

/// Event implied by an access token changing from `old` to `new`.
pub fn synthesize(old: Option<&str>, new: Option<&str>) -> Option<OidcEvent> {
    match (old, new) {
        (None, Some(new)) => Some(OidcEvent::Login {
            access_token: new.to_string(),
        }),
        (Some(_), None) => Some(OidcEvent::Logout),
        (Some(old), Some(new)) if old != new => Some(OidcEvent::AccessTokenUpdated {
            access_token: new.to_string(),
            old_access_token: old.to_string(),
        }),
        _ => None,
    }
}

/// Token carried by a raw store entry, if it is well-formed and live at `now`.
fn live_token(raw: Option<&str>, now: i64) -> Option<String> {
    raw.and_then(|raw| StoredValue::<String>::parse_live(raw, now))
        .map(|stored| stored.value)
}

/// Emit events on `bus` for foreign changes of the entry under `key`.
pub fn spawn_storage_bridge(
    mut changes: StorageChanges,
    key: String,
    bus: EventBus,
) -> ScheduledTask {
    ScheduledTask::spawn("storage-bridge", async move {
        while let Some(change) = changes.next().await {
            if change.key != key {
                continue;
            }
            let now = now_millis();
            let old = live_token(change.old_value.as_deref(), now);
            let new = live_token(change.new_value.as_deref(), now);
            if let Some(event) = synthesize(old.as_deref(), new.as_deref()) {
                debug!(event = event.kind().as_str(), "Access token changed in another context");
                bus.emit(&event);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{KeyValueStore, MemoryStore, StorageWatcher};
    use std::sync::Mutex;
    use std::time::Duration;

    fn recorder(bus: &EventBus, kind: EventKind) -> Arc<Mutex<Vec<OidcEvent>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        bus.on(kind, move |event| sink.lock().unwrap().push(event.clone()));
        seen
    }

    #[test]
    fn test_emit_reaches_matching_handlers_only() {
        let bus = EventBus::new();
        let logins = recorder(&bus, EventKind::Login);
        let logouts = recorder(&bus, EventKind::Logout);

        bus.emit(&OidcEvent::Login {
            access_token: "a".into(),
        });

        assert_eq!(logins.lock().unwrap().len(), 1);
        assert!(logouts.lock().unwrap().is_empty());
    }

    #[test]
    fn test_off_is_idempotent() {
        let bus = EventBus::new();
        let id = bus.on(EventKind::Logout, |_| {});
        assert_eq!(bus.handler_count(EventKind::Logout), 1);
        assert!(bus.off(id));
        assert!(!bus.off(id));
        assert_eq!(bus.handler_count(EventKind::Logout), 0);
    }

    #[test]
    fn test_handler_may_unsubscribe_itself() {
        let bus = EventBus::new();
        let slot: Arc<Mutex<Option<SubscriptionId>>> = Arc::new(Mutex::new(None));
        let inner_bus = bus.clone();
        let inner_slot = Arc::clone(&slot);
        let id = bus.on(EventKind::Logout, move |_| {
            if let Some(id) = *inner_slot.lock().unwrap() {
                inner_bus.off(id);
            }
        });
        *slot.lock().unwrap() = Some(id);

        bus.emit(&OidcEvent::Logout);
        assert_eq!(bus.handler_count(EventKind::Logout), 0);
    }

    #[test]
    fn test_truth_table() {
        assert_eq!(
            synthesize(None, Some("X")),
            Some(OidcEvent::Login {
                access_token: "X".into()
            })
        );
        assert_eq!(synthesize(Some("X"), None), Some(OidcEvent::Logout));
        assert_eq!(
            synthesize(Some("A"), Some("B")),
            Some(OidcEvent::AccessTokenUpdated {
                access_token: "B".into(),
                old_access_token: "A".into()
            })
        );
        assert_eq!(synthesize(Some("A"), Some("A")), None);
        assert_eq!(synthesize(None, None), None);
    }

    #[tokio::test]
    async fn test_bridge_translates_foreign_changes() {
        let tab_a = MemoryStore::new();
        let tab_b = tab_a.attach();
        let bus = EventBus::new();
        let logins = recorder(&bus, EventKind::Login);
        let _bridge = spawn_storage_bridge(tab_b.watch(), "KEY".into(), bus.clone());

        let entry = format!(r#"{{"expireIn":{},"value":"X"}}"#, now_millis() + 60_000);
        tab_a.set("OTHER", &entry).unwrap();
        tab_b.set("KEY", &entry).unwrap();
        tab_a.remove("KEY").unwrap();
        tab_a.set("KEY", &entry).unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        // Own write and unrelated key are ignored; the removal had a live old
        // value, so only the final write counts as a login.
        assert_eq!(
            *logins.lock().unwrap(),
            vec![OidcEvent::Login {
                access_token: "X".into()
            }]
        );
    }

    #[test]
    fn test_expired_or_corrupt_entries_count_as_absent() {
        let now = now_millis();
        let expired = format!(r#"{{"expireIn":{},"value":"X"}}"#, now - 1);
        assert_eq!(live_token(Some(&expired), now), None);
        assert_eq!(live_token(Some("garbage"), now), None);
        assert_eq!(live_token(None, now), None);
    }
}
