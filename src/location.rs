//! The host's current address and its navigation capability.

use std::sync::{Arc, PoisonError, RwLock};

use tracing::info;
use url::Url;

/// Where the client is running and how it leaves.
///
/// `assign` stands for a full navigation. After it the client instance is
/// expected to be torn down by the host.
pub trait Location: Send + Sync {
    fn href(&self) -> Url;

    fn assign(&self, url: &Url);
}

impl<T: Location + ?Sized> Location for Arc<T> {
    fn href(&self) -> Url {
        (**self).href()
    }

    fn assign(&self, url: &Url) {
        (**self).assign(url)
    }
}

#[derive(Debug)]
struct LocationState {
    current: Url,
    history: Vec<Url>,
}

/// In-process [`Location`] that records navigations.
///
/// `assign` moves `href` to the target, like a browser would once the
/// navigation completes. Clones share state.
#[derive(Debug, Clone)]
pub struct MemoryLocation {
    state: Arc<RwLock<LocationState>>,
}

impl MemoryLocation {
    pub fn new(current: Url) -> Self {
        Self {
            state: Arc::new(RwLock::new(LocationState {
                current,
                history: Vec::new(),
            })),
        }
    }

    /// Change the current address without recording a navigation.
    pub fn set_href(&self, url: Url) {
        self.state
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .current = url;
    }

    /// Every URL passed to `assign`, oldest first.
    pub fn navigations(&self) -> Vec<Url> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .clone()
    }

    pub fn last_navigation(&self) -> Option<Url> {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .history
            .last()
            .cloned()
    }
}

impl Location for MemoryLocation {
    fn href(&self) -> Url {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .current
            .clone()
    }

    fn assign(&self, url: &Url) {
        info!(target_url = %url, "Navigating");
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.history.push(url.clone());
        state.current = url.clone();
    }
}
