//! Token persistence and token endpoint responses.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::error::{OidcError, Result};
use crate::events::{EventBus, OidcEvent};
use crate::http::HttpResponse;
use crate::jwt;
use crate::store::ExpiringStore;

pub const ACCESS_TOKEN_POSTFIX: &str = "access_token:";
pub const REFRESH_TOKEN_POSTFIX: &str = "refresh_token:";
pub const ID_TOKEN_POSTFIX: &str = "id_token:";

// =============================================================================
// Token endpoint response
// =============================================================================

/// Successful token endpoint payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_token: Option<String>,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// OAuth error body returned with a non-success status.
#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

impl TokenResponse {
    /// Providers disagree on the casing of `bearer`.
    pub fn is_bearer(&self) -> bool {
        self.token_type.eq_ignore_ascii_case("bearer")
    }

    /// Interpret a token endpoint reply.
    ///
    /// Fails with [`OidcError::TokenExchange`] on any status other than 200,
    /// an unparsable body, or a non-bearer token type.
    pub fn from_http(response: &HttpResponse) -> Result<Self> {
        if !response.is_ok() {
            if let Ok(error) = serde_json::from_str::<TokenErrorResponse>(&response.body) {
                warn!(
                    status = response.status,
                    error = %error.error,
                    description = ?error.error_description,
                    "Token endpoint returned an error"
                );
            }
            return Err(OidcError::TokenExchange {
                status: Some(response.status),
                detail: format!(
                    "Getting authorization token is failed. Error ({}): {}",
                    response.status, response.body
                ),
            });
        }

        let tokens: Self =
            serde_json::from_str(&response.body).map_err(|e| OidcError::TokenExchange {
                status: Some(response.status),
                detail: format!("Failed to parse token response: {e}"),
            })?;

        if !tokens.is_bearer() {
            return Err(OidcError::TokenExchange {
                status: Some(response.status),
                detail: format!("Token is not bearer type. Actual: {}", tokens.token_type),
            });
        }

        Ok(tokens)
    }
}

// =============================================================================
// TokenSet
// =============================================================================

/// Currently stored tokens. Each one is independently present or absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSet {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub id_token: Option<String>,
    /// Access token expiry (its `exp` claim) in Unix ms, or 0 when absent.
    pub access_token_expire_in: i64,
}

impl TokenSet {
    pub fn is_authenticated(&self) -> bool {
        self.access_token.is_some() || self.refresh_token.is_some()
    }
}

// =============================================================================
// TokenLedger
// =============================================================================

/// Reads and writes the three token entries and raises the matching events.
///
/// Events are only emitted once [`mark_initialised`](Self::mark_initialised)
/// was called, so writes replayed during startup stay silent.
#[derive(Clone)]
pub struct TokenLedger {
    store: ExpiringStore,
    events: EventBus,
    initialised: Arc<AtomicBool>,
}

impl TokenLedger {
    pub fn new(store: ExpiringStore, events: EventBus) -> Self {
        Self {
            store,
            events,
            initialised: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_initialised(&self) -> bool {
        self.initialised.load(Ordering::SeqCst)
    }

    pub fn mark_initialised(&self) {
        self.initialised.store(true, Ordering::SeqCst);
    }

    /// Storage key of the access token entry, watched by the storage bridge.
    pub fn access_token_key(&self) -> String {
        self.store.key(ACCESS_TOKEN_POSTFIX)
    }

    pub fn read_all(&self) -> TokenSet {
        let access = self.store.get::<String>(ACCESS_TOKEN_POSTFIX);
        TokenSet {
            access_token_expire_in: access.as_ref().map_or(0, |stored| stored.expire_in),
            access_token: access.map(|stored| stored.value),
            refresh_token: self.store.get_value(REFRESH_TOKEN_POSTFIX),
            id_token: self.store.get_value(ID_TOKEN_POSTFIX),
        }
    }

    /// Persist a token response, each token expiring with its own `exp`.
    ///
    /// Tokens missing from the response keep their stored value. Nothing is
    /// written if the access or id token cannot be decoded.
    #[instrument(skip(self, tokens))]
    pub fn write_all(&self, tokens: &TokenResponse) -> Result<()> {
        let access_expire_in = jwt::decode(&tokens.access_token)?.expires_at_millis();
        let id_expire_in = match &tokens.id_token {
            Some(id_token) => Some(jwt::decode(id_token)?.expires_at_millis()),
            None => None,
        };
        let refresh_expire_in = tokens.refresh_token.as_deref().map(|refresh_token| {
            jwt::decode(refresh_token)
                .map(|claims| claims.expires_at_millis())
                .inspect_err(|_| debug!("Refresh token is opaque, using the default lifetime"))
                .ok()
        });

        let old_access_token = self.store.get_value::<String>(ACCESS_TOKEN_POSTFIX);

        self.store
            .set(ACCESS_TOKEN_POSTFIX, &tokens.access_token, Some(access_expire_in))?;
        if let (Some(refresh_token), Some(expire_in)) = (&tokens.refresh_token, refresh_expire_in) {
            self.store.set(REFRESH_TOKEN_POSTFIX, refresh_token, expire_in)?;
        }
        if let (Some(id_token), Some(expire_in)) = (&tokens.id_token, id_expire_in) {
            self.store.set(ID_TOKEN_POSTFIX, id_token, Some(expire_in))?;
        }

        if !self.is_initialised() {
            return Ok(());
        }
        match old_access_token {
            None => {
                info!("User logged in");
                self.events.emit(&OidcEvent::Login {
                    access_token: tokens.access_token.clone(),
                });
            }
            Some(old) if old != tokens.access_token => {
                self.events.emit(&OidcEvent::AccessTokenUpdated {
                    access_token: tokens.access_token.clone(),
                    old_access_token: old,
                });
            }
            Some(_) => {}
        }
        Ok(())
    }

    /// Clear all three entries. Emits `logout` if an access token was stored.
    #[instrument(skip(self))]
    pub fn remove_all(&self) -> Result<()> {
        let old_access_token = self.store.get_value::<String>(ACCESS_TOKEN_POSTFIX);

        self.store.remove(ACCESS_TOKEN_POSTFIX)?;
        self.store.remove(REFRESH_TOKEN_POSTFIX)?;
        self.store.remove(ID_TOKEN_POSTFIX)?;

        if self.is_initialised() && old_access_token.is_some() {
            info!("User logged out");
            self.events.emit(&OidcEvent::Logout);
        }
        Ok(())
    }
}
