//! Authorization and end-session redirects.

use std::sync::Arc;

use tracing::{error, info, instrument};
use url::Url;
use uuid::Uuid;

use crate::callback::CallbackParams;
use crate::config::Config;
use crate::error::Result;
use crate::flow::{FlowStore, PendingFlow};
use crate::location::Location;
use crate::metadata::MetadataCache;
use crate::outcome::{RedirectOutcome, SkipReason};
use crate::pkce::Pkce;
use crate::tokens::TokenLedger;

/// Starts logins and ends sessions by navigating to the provider.
#[derive(Clone)]
pub struct FlowInitiator {
    config: Arc<Config>,
    metadata: MetadataCache,
    flows: FlowStore,
    ledger: TokenLedger,
    location: Arc<dyn Location>,
}

impl FlowInitiator {
    pub fn new(
        config: Arc<Config>,
        metadata: MetadataCache,
        flows: FlowStore,
        ledger: TokenLedger,
        location: Arc<dyn Location>,
    ) -> Self {
        Self {
            config,
            metadata,
            flows,
            ledger,
            location,
        }
    }

    /// Send the host to the authorization endpoint.
    ///
    /// `redirect_uri` defaults to the current URL. Does nothing while a
    /// callback is pending in the URL or when tokens are already stored.
    #[instrument(skip(self))]
    pub async fn login(&self, redirect_uri: Option<&str>) -> Result<RedirectOutcome> {
        let current = self.location.href();
        if CallbackParams::from_url(self.config.response_mode, &current).any() {
            error!("Login can't be done because code or state params are present in url");
            return Ok(RedirectOutcome::Skipped(SkipReason::CallbackInProgress));
        }

        if self.ledger.read_all().is_authenticated() {
            return Ok(RedirectOutcome::Skipped(SkipReason::AlreadyAuthenticated));
        }

        let metadata = self.metadata.get().await?;
        let redirect_uri = redirect_uri.map_or_else(|| current.to_string(), str::to_string);
        let id = Uuid::new_v4().to_string();
        let pkce = Pkce::generate();

        self.flows
            .put(&PendingFlow::new(&id, &pkce.verifier, &redirect_uri))?;

        let url =
            self.authorization_url(&metadata.authorization_endpoint, &id, &redirect_uri, &pkce);
        info!(state = %id, "Redirecting to authorization endpoint");
        self.location.assign(&url);
        Ok(RedirectOutcome::Navigated(url))
    }

    fn authorization_url(
        &self,
        endpoint: &Url,
        state: &str,
        redirect_uri: &str,
        pkce: &Pkce,
    ) -> Url {
        let mut url = endpoint.clone();
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.config.client_id)
                .append_pair("redirect_uri", redirect_uri)
                .append_pair("response_type", Config::RESPONSE_TYPE)
                .append_pair("response_mode", self.config.response_mode.as_str())
                .append_pair("scope", &self.config.scope)
                .append_pair("state", state);
            if self.config.pkce {
                query
                    .append_pair("code_challenge", &pkce.challenge)
                    .append_pair("code_challenge_method", pkce.method);
            }
        }
        url
    }

    /// Clear the stored tokens and send the host to the end-session endpoint.
    ///
    /// Without a refresh token there is no session and nothing happens.
    #[instrument(skip(self))]
    pub async fn logout(&self) -> Result<RedirectOutcome> {
        let tokens = self.ledger.read_all();
        if tokens.refresh_token.is_none() {
            return Ok(RedirectOutcome::Skipped(SkipReason::NotAuthenticated));
        }

        let metadata = self.metadata.get().await?;
        let mut url = metadata.end_session_endpoint;
        {
            let mut query = url.query_pairs_mut();
            if let Some(id_token) = &tokens.id_token {
                query.append_pair("id_token_hint", id_token);
            }
            query.append_pair("post_logout_redirect_uri", &self.config.logout_back_url);
        }

        self.ledger.remove_all()?;
        info!("Redirecting to end-session endpoint");
        self.location.assign(&url);
        Ok(RedirectOutcome::Navigated(url))
    }
}
