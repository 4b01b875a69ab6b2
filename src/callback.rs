//! Authorization callback detection and code exchange.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{info, instrument, warn};
use url::Url;

use crate::config::{Config, ResponseMode};
use crate::error::{OidcError, Result};
use crate::flow::FlowStore;
use crate::http::HttpTransport;
use crate::location::Location;
use crate::metadata::MetadataCache;
use crate::tokens::{TokenLedger, TokenResponse};

/// `state` and `code` as found in the current URL. Empty values count as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallbackParams {
    pub state: Option<String>,
    pub code: Option<String>,
}

impl CallbackParams {
    /// Extract the parameters where `mode` says the provider puts them.
    pub fn from_url(mode: ResponseMode, url: &Url) -> Self {
        match mode {
            ResponseMode::Query => Self::from_query(url),
            ResponseMode::Fragment => Self::from_fragment(url),
        }
    }

    fn from_query(url: &Url) -> Self {
        let first = |name: &str| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
                .filter(|value| !value.is_empty())
        };
        Self {
            state: first("state"),
            code: first("code"),
        }
    }

    /// The whole fragment is percent-decoded first, then split on `&` and the
    /// first `=`. Both values must be present or neither is reported.
    fn from_fragment(url: &Url) -> Self {
        let Some(fragment) = url.fragment().filter(|f| !f.is_empty()) else {
            return Self::default();
        };
        let decoded = match urlencoding::decode(fragment) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(error = %e, "Undecodable URL fragment");
                return Self::default();
            }
        };

        let params: HashMap<&str, &str> = decoded
            .split('&')
            .map(|pair| pair.split_once('=').unwrap_or((pair, "")))
            .collect();

        match (params.get("state"), params.get("code")) {
            (Some(state), Some(code)) if !state.is_empty() && !code.is_empty() => Self {
                state: Some((*state).to_string()),
                code: Some((*code).to_string()),
            },
            _ => Self::default(),
        }
    }

    /// Both parameters, if this is a complete callback.
    pub fn complete(&self) -> Option<(&str, &str)> {
        Some((self.state.as_deref()?, self.code.as_deref()?))
    }

    /// True if at least one parameter is present.
    pub fn any(&self) -> bool {
        self.state.is_some() || self.code.is_some()
    }
}

/// Completes a login when the host lands on the redirect URI.
#[derive(Clone)]
pub struct CallbackProcessor {
    config: Arc<Config>,
    metadata: MetadataCache,
    flows: FlowStore,
    ledger: TokenLedger,
    http: Arc<dyn HttpTransport>,
    location: Arc<dyn Location>,
}

impl CallbackProcessor {
    pub fn new(
        config: Arc<Config>,
        metadata: MetadataCache,
        flows: FlowStore,
        ledger: TokenLedger,
        http: Arc<dyn HttpTransport>,
        location: Arc<dyn Location>,
    ) -> Self {
        Self {
            config,
            metadata,
            flows,
            ledger,
            http,
            location,
        }
    }

    pub fn params(&self) -> CallbackParams {
        CallbackParams::from_url(self.config.response_mode, &self.location.href())
    }

    /// Process a callback if the current URL carries one.
    ///
    /// Returns `None` when there is nothing to process, or the URL the host
    /// was sent back to after tokens were stored.
    #[instrument(skip(self))]
    pub async fn handle(&self) -> Result<Option<Url>> {
        let params = self.params();
        let Some((state, code)) = params.complete() else {
            return Ok(None);
        };

        let flow = self
            .flows
            .take(state)
            .ok_or_else(|| OidcError::Callback(format!("Data not found for id:{state}")))?;
        let redirect_uri = Url::parse(&flow.redirect_uri).map_err(|e| {
            OidcError::Callback(format!(
                "Stored redirect URI '{}' is invalid: {e}",
                flow.redirect_uri
            ))
        })?;

        let metadata = self.metadata.get().await?;

        let mut form = vec![
            ("grant_type", Config::GRANT_TYPE),
            ("redirect_uri", flow.redirect_uri.as_str()),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
        ];
        if self.config.pkce {
            form.push(("code_verifier", flow.code_verifier.as_str()));
        }

        let response = self
            .http
            .post_form(metadata.token_endpoint.as_str(), &form)
            .await?;
        let tokens = TokenResponse::from_http(&response)?;
        self.ledger.write_all(&tokens)?;
        info!("Authorization code exchanged");

        self.location.assign(&redirect_uri);
        Ok(Some(redirect_uri))
    }
}
