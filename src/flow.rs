//! Per-context storage of in-flight login handshakes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::error::Result;
use crate::store::KeyValueStore;

/// Marker stored with every pending flow record.
const LOGIN_ACTION: &str = "login";

/// Handshake data kept between the authorization redirect and its callback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingFlow {
    #[serde(default = "login_action")]
    pub action: String,
    /// Also the `state` parameter of the authorization request.
    pub id: String,
    pub code_verifier: String,
    pub redirect_uri: String,
}

fn login_action() -> String {
    LOGIN_ACTION.to_string()
}

impl PendingFlow {
    pub fn new(
        id: impl Into<String>,
        code_verifier: impl Into<String>,
        redirect_uri: impl Into<String>,
    ) -> Self {
        Self {
            action: login_action(),
            id: id.into(),
            code_verifier: code_verifier.into(),
            redirect_uri: redirect_uri.into(),
        }
    }
}

/// Pending flows keyed by `{prefix}{id}` in a store private to one context.
///
/// Entries carry no expiry. Each is consumed at most once by the callback.
#[derive(Clone)]
pub struct FlowStore {
    backend: Arc<dyn KeyValueStore>,
    config: Arc<Config>,
}

impl FlowStore {
    pub fn new(backend: Arc<dyn KeyValueStore>, config: Arc<Config>) -> Self {
        Self { backend, config }
    }

    #[instrument(skip(self, flow), fields(id = %flow.id))]
    pub fn put(&self, flow: &PendingFlow) -> Result<()> {
        let raw = serde_json::to_string(flow)?;
        self.backend.set(&self.config.flow_key(&flow.id), &raw)
    }

    /// Read a flow without consuming it. Unreadable records count as absent.
    pub fn get(&self, id: &str) -> Option<PendingFlow> {
        let key = self.config.flow_key(id);
        let raw = match self.backend.get(&key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                warn!(%key, error = %e, "Failed to read pending flow");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(flow) => Some(flow),
            Err(e) => {
                warn!(%key, error = %e, "Corrupt pending flow");
                None
            }
        }
    }

    /// Read and remove a flow, so a replayed callback finds nothing.
    #[instrument(skip(self))]
    pub fn take(&self, id: &str) -> Option<PendingFlow> {
        let flow = self.get(id)?;
        if let Err(e) = self.backend.remove(&self.config.flow_key(id)) {
            warn!(error = %e, "Failed to remove consumed flow");
        }
        debug!("Pending flow consumed");
        Some(flow)
    }
}
