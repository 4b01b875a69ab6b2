//! Provider discovery document: fetch, validation and caching.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use url::Url;

use crate::config::{Config, ResponseMode};
use crate::error::{OidcError, Result};
use crate::http::HttpTransport;
use crate::store::{ExpiringStore, now_millis};

/// Store postfix of the cached discovery document.
pub const METADATA_POSTFIX: &str = "METADATA:";

/// Lifetime of a cached discovery document (12 hours).
pub const METADATA_TTL_MS: i64 = 12 * 60 * 60 * 1000;

/// The discovery document as the provider published it.
///
/// Every field is optional here; [`OidcMetadataConfig::validate`] decides what
/// is required. Unknown fields are kept so the cached copy stays complete.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DiscoveryDocument {
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub grant_types_supported: Option<Vec<String>>,
    #[serde(default)]
    pub response_types_supported: Option<Vec<String>>,
    #[serde(default)]
    pub subject_types_supported: Option<Vec<String>>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Option<Vec<String>>,
    #[serde(default)]
    pub response_modes_supported: Option<Vec<String>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Validated provider metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OidcMetadataConfig {
    pub authorization_endpoint: Url,
    pub token_endpoint: Url,
    pub end_session_endpoint: Url,
    pub grant_types_supported: Vec<String>,
    pub response_types_supported: Vec<String>,
    pub subject_types_supported: Vec<String>,
    pub id_token_signing_alg_values_supported: Vec<String>,
    /// Provider-supported modes this client can handle.
    pub response_modes: Vec<ResponseMode>,
}

fn endpoint(name: &str, value: Option<&String>) -> Result<Url> {
    let raw = value
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| OidcError::Metadata(format!("{name} is not set")))?;
    Url::parse(raw).map_err(|e| OidcError::Metadata(format!("{name} is not a valid URL: {e}")))
}

fn supported_set(name: &str, value: Option<&Vec<String>>) -> Result<Vec<String>> {
    match value {
        Some(values) if !values.is_empty() => Ok(values.clone()),
        _ => Err(OidcError::Metadata(format!("{name} is not set or empty"))),
    }
}

fn require_member(what: &str, wanted: &str, supported: &[String]) -> Result<()> {
    if supported.iter().any(|s| s == wanted) {
        return Ok(());
    }
    Err(OidcError::Metadata(format!(
        "{what} \"{wanted}\" is not supported. Available only \"{}\"",
        supported.join("\", \"")
    )))
}

impl OidcMetadataConfig {
    /// Check a discovery document against the client configuration.
    pub fn validate(doc: &DiscoveryDocument, config: &Config) -> Result<Self> {
        let authorization_endpoint = endpoint(
            "authorization_endpoint",
            doc.authorization_endpoint.as_ref(),
        )?;
        let token_endpoint = endpoint("token_endpoint", doc.token_endpoint.as_ref())?;
        let end_session_endpoint =
            endpoint("end_session_endpoint", doc.end_session_endpoint.as_ref())?;

        let grant_types_supported = supported_set(
            "grant_types_supported",
            doc.grant_types_supported.as_ref(),
        )?;
        require_member("grant type", Config::GRANT_TYPE, &grant_types_supported)?;

        let response_types_supported =
            supported_set("response_types_supported", doc.response_types_supported.as_ref())?;
        require_member("response type", Config::RESPONSE_TYPE, &response_types_supported)?;

        let subject_types_supported = supported_set(
            "subject_types_supported",
            doc.subject_types_supported.as_ref(),
        )?;
        require_member("subject type", Config::SUBJECT_TYPE, &subject_types_supported)?;

        let id_token_signing_alg_values_supported = supported_set(
            "id_token_signing_alg_values_supported",
            doc.id_token_signing_alg_values_supported.as_ref(),
        )?;
        require_member(
            "token signing algorithm",
            Config::TOKEN_SIGNING_ALG,
            &id_token_signing_alg_values_supported,
        )?;

        let provider_modes = supported_set(
            "response_modes_supported",
            doc.response_modes_supported.as_ref(),
        )?;
        let response_modes: Vec<ResponseMode> = ResponseMode::ALL
            .into_iter()
            .filter(|mode| provider_modes.iter().any(|m| m == mode.as_str()))
            .collect();
        if !response_modes.contains(&config.response_mode) {
            let available: Vec<&str> = response_modes.iter().map(ResponseMode::as_str).collect();
            return Err(OidcError::Metadata(format!(
                "response mode \"{}\" is not supported. Available only \"{}\"",
                config.response_mode,
                available.join("\", \"")
            )));
        }

        Ok(Self {
            authorization_endpoint,
            token_endpoint,
            end_session_endpoint,
            grant_types_supported,
            response_types_supported,
            subject_types_supported,
            id_token_signing_alg_values_supported,
            response_modes,
        })
    }
}

/// Cache-first access to the provider metadata.
#[derive(Clone)]
pub struct MetadataCache {
    store: ExpiringStore,
    http: Arc<dyn HttpTransport>,
    config: Arc<Config>,
}

impl MetadataCache {
    pub fn new(store: ExpiringStore, http: Arc<dyn HttpTransport>, config: Arc<Config>) -> Self {
        Self { store, http, config }
    }

    /// Return validated metadata, fetching the discovery document on a miss.
    ///
    /// A cached document that no longer validates is dropped and refetched.
    #[instrument(skip(self), fields(authority = %self.config.authority))]
    pub async fn get(&self) -> Result<OidcMetadataConfig> {
        if let Some(doc) = self.store.get_value::<DiscoveryDocument>(METADATA_POSTFIX) {
            match OidcMetadataConfig::validate(&doc, &self.config) {
                Ok(metadata) => {
                    debug!("Metadata cache hit");
                    return Ok(metadata);
                }
                Err(e) => {
                    debug!(error = %e, "Cached metadata rejected");
                    self.store.remove(METADATA_POSTFIX)?;
                }
            }
        }

        let doc = self.fetch().await?;
        let metadata = OidcMetadataConfig::validate(&doc, &self.config)?;
        self.store
            .set(METADATA_POSTFIX, &doc, Some(now_millis() + METADATA_TTL_MS))?;
        info!("Provider metadata fetched");
        Ok(metadata)
    }

    async fn fetch(&self) -> Result<DiscoveryDocument> {
        let url = self.config.discovery_url();
        let response = self.http.get(&url).await?;
        if !response.is_ok() {
            return Err(OidcError::Metadata(format!(
                "Getting OpenID configuration is failed. Error ({}): {}",
                response.status, response.body
            )));
        }
        serde_json::from_str(&response.body).map_err(|e| {
            OidcError::Metadata(format!("OpenID configuration is not valid JSON: {e}"))
        })
    }
}
