use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use url::Url;

use crate::error::ConfigError;

/// Prefix used for every storage key when none is configured.
pub const DEFAULT_STORE_KEY_PREFIX: &str = "OIDC-MIF:";

/// Scope requested when none is configured.
pub const DEFAULT_SCOPE: &str = "openid";

// ---------------------------------------------------------------------------
// Response mode
// ---------------------------------------------------------------------------

/// How the provider returns `state` and `code` to the redirect URI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseMode {
    Query,
    Fragment,
}

impl ResponseMode {
    /// Every response mode this client can consume.
    pub const ALL: [ResponseMode; 2] = [ResponseMode::Query, ResponseMode::Fragment];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Query => "query",
            Self::Fragment => "fragment",
        }
    }
}

impl fmt::Display for ResponseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResponseMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "query" => Ok(Self::Query),
            "fragment" => Ok(Self::Fragment),
            other => Err(ConfigError::UnsupportedResponseMode(other.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// User settings
// ---------------------------------------------------------------------------

/// User-supplied client configuration, before validation.
///
/// Only `authority` and `client_id` are required. Everything else falls back
/// to a default in [`Config::resolve`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct ClientSettings {
    #[serde(default)]
    pub authority: String,
    #[serde(default)]
    pub client_id: String,
    /// Kept as a raw string so an unsupported value is reported by
    /// [`Config::resolve`] instead of failing deserialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logout_back_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_key_prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkce: Option<bool>,
}

impl ClientSettings {
    pub fn new(authority: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            authority: authority.into(),
            client_id: client_id.into(),
            ..Default::default()
        }
    }

    pub fn with_response_mode(mut self, mode: ResponseMode) -> Self {
        self.response_mode = Some(mode.as_str().to_string());
        self
    }

    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    pub fn with_logout_back_url(mut self, url: impl Into<String>) -> Self {
        self.logout_back_url = Some(url.into());
        self
    }

    pub fn with_store_key_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.store_key_prefix = Some(prefix.into());
        self
    }

    pub fn with_pkce(mut self, pkce: bool) -> Self {
        self.pkce = Some(pkce);
        self
    }

    /// Build settings purely from `OIDC_*` environment variables.
    pub fn from_env() -> Self {
        let mut settings = Self::default();
        settings.apply_overrides(|name| std::env::var(name).ok());
        settings
    }

    /// Apply `OIDC_*` overrides using the given variable lookup.
    ///
    /// Returns the names of the variables that were applied.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<&'static str>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut applied = Vec::new();

        macro_rules! env_str {
            ($env:expr, $field:expr) => {
                if let Some(val) = lookup($env) {
                    $field = val;
                    applied.push($env);
                }
            };
        }
        macro_rules! env_opt_str {
            ($env:expr, $field:expr) => {
                if let Some(val) = lookup($env) {
                    $field = if val.is_empty() { None } else { Some(val) };
                    applied.push($env);
                }
            };
        }

        env_str!("OIDC_AUTHORITY", self.authority);
        env_str!("OIDC_CLIENT_ID", self.client_id);
        env_opt_str!("OIDC_SCOPE", self.scope);
        env_opt_str!("OIDC_RESPONSE_MODE", self.response_mode);
        env_opt_str!("OIDC_LOGOUT_BACK_URL", self.logout_back_url);
        env_opt_str!("OIDC_STORE_KEY_PREFIX", self.store_key_prefix);

        // PKCE stays on unless explicitly disabled.
        if let Some(val) = lookup("OIDC_PKCE") {
            self.pkce = Some(val.trim() != "false");
            applied.push("OIDC_PKCE");
        }

        for name in &applied {
            tracing::debug!(env = name, "Client setting overridden from environment");
        }
        applied
    }
}

// ---------------------------------------------------------------------------
// Canonical config
// ---------------------------------------------------------------------------

/// Validated, canonical client configuration. Immutable per client instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Provider base URL, trimmed and without trailing slashes.
    pub authority: String,
    pub client_id: String,
    pub response_mode: ResponseMode,
    pub scope: String,
    pub logout_back_url: String,
    pub store_key_prefix: String,
    pub pkce: bool,
}

impl Config {
    pub const RESPONSE_TYPE: &'static str = "code";
    pub const GRANT_TYPE: &'static str = "authorization_code";
    pub const SUBJECT_TYPE: &'static str = "public";
    pub const TOKEN_SIGNING_ALG: &'static str = "RS256";
    pub const CODE_CHALLENGE_METHOD: &'static str = "S256";

    /// Validate user settings and fill in defaults.
    ///
    /// `current_url` is the page the client runs on; it becomes the default
    /// `logout_back_url`.
    pub fn resolve(settings: &ClientSettings, current_url: &Url) -> Result<Self, ConfigError> {
        let authority = settings.authority.trim().trim_end_matches('/').to_string();
        if authority.is_empty() {
            return Err(ConfigError::MissingAuthority);
        }

        if settings.client_id.is_empty() {
            return Err(ConfigError::MissingClientId);
        }

        let response_mode = match settings.response_mode.as_deref() {
            Some(mode) => mode.parse()?,
            None => ResponseMode::Query,
        };

        let store_key_prefix = settings
            .store_key_prefix
            .clone()
            .unwrap_or_else(|| DEFAULT_STORE_KEY_PREFIX.to_string());
        if store_key_prefix.is_empty() {
            return Err(ConfigError::MissingStoreKeyPrefix);
        }

        Ok(Self {
            authority,
            client_id: settings.client_id.clone(),
            response_mode,
            scope: settings
                .scope
                .clone()
                .unwrap_or_else(|| DEFAULT_SCOPE.to_string()),
            logout_back_url: settings
                .logout_back_url
                .clone()
                .unwrap_or_else(|| current_url.to_string()),
            store_key_prefix,
            pkce: settings.pkce.unwrap_or(true),
        })
    }

    /// URL of the provider's discovery document.
    pub fn discovery_url(&self) -> String {
        format!("{}/.well-known/openid-configuration", self.authority)
    }

    /// Durable storage key: `prefix ++ postfix ++ authority ++ ":" ++ clientId`.
    pub fn store_key(&self, postfix: &str) -> String {
        format!(
            "{}{}{}:{}",
            self.store_key_prefix, postfix, self.authority, self.client_id
        )
    }

    /// Ephemeral storage key for a pending flow: `prefix ++ flowId`.
    pub fn flow_key(&self, flow_id: &str) -> String {
        format!("{}{}", self.store_key_prefix, flow_id)
    }
}

// ---------------------------------------------------------------------------
// Host application config (binary)
// ---------------------------------------------------------------------------

/// File-level configuration for the `oidc-pkce` binary.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default)]
    pub client: ClientSettings,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Root directory; durable entries live under `durable/`, flows under `session/`.
    #[serde(default = "default_storage_dir")]
    pub dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dir: default_storage_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_storage_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("oidc-pkce")
}

impl AppConfig {
    /// Load configuration from a TOML file, then apply environment variable
    /// overrides. A missing file yields defaults.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: AppConfig = toml::from_str(&content)?;
            config
        } else {
            tracing::warn!("Config file not found at {}, using defaults", path.display());
            Self::default()
        };
        config.apply_env_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        self.client.apply_overrides(&lookup);

        if let Some(dir) = lookup("OIDC_STORAGE_DIR") {
            self.storage.dir = PathBuf::from(dir);
        }
        if let Some(level) = lookup("OIDC_LOG_LEVEL") {
            self.logging.level = level;
        }
        if let Some(json) = lookup("OIDC_LOG_JSON") {
            self.logging.json = matches!(json.to_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
    }
}

mod dirs {
    use std::path::PathBuf;

    pub fn data_local_dir() -> Option<PathBuf> {
        std::env::var_os("XDG_DATA_HOME")
            .map(PathBuf::from)
            .or_else(|| {
                std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".local").join("share"))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn page() -> Url {
        Url::parse("https://app.example.com/home?tab=1").unwrap()
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let settings = ClientSettings::new("  https://idp.example.com/realms/demo//  ", "spa");
        let config = Config::resolve(&settings, &page()).unwrap();

        assert_eq!(config.authority, "https://idp.example.com/realms/demo");
        assert_eq!(config.client_id, "spa");
        assert_eq!(config.response_mode, ResponseMode::Query);
        assert_eq!(config.scope, "openid");
        assert_eq!(config.logout_back_url, "https://app.example.com/home?tab=1");
        assert_eq!(config.store_key_prefix, "OIDC-MIF:");
        assert!(config.pkce);
    }

    #[test]
    fn test_resolve_keeps_explicit_values() {
        let settings = ClientSettings::new("https://idp.example.com", "spa")
            .with_response_mode(ResponseMode::Fragment)
            .with_scope("openid profile")
            .with_logout_back_url("https://app.example.com/bye")
            .with_store_key_prefix("APP:")
            .with_pkce(false);
        let config = Config::resolve(&settings, &page()).unwrap();

        assert_eq!(config.response_mode, ResponseMode::Fragment);
        assert_eq!(config.scope, "openid profile");
        assert_eq!(config.logout_back_url, "https://app.example.com/bye");
        assert_eq!(config.store_key_prefix, "APP:");
        assert!(!config.pkce);
    }

    #[test]
    fn test_resolve_rejects_blank_authority() {
        let settings = ClientSettings::new(" / ", "spa");
        assert_eq!(
            Config::resolve(&settings, &page()),
            Err(ConfigError::MissingAuthority)
        );
    }

    #[test]
    fn test_resolve_rejects_empty_client_id() {
        let settings = ClientSettings::new("https://idp.example.com", "");
        assert_eq!(
            Config::resolve(&settings, &page()),
            Err(ConfigError::MissingClientId)
        );
    }

    #[test]
    fn test_resolve_rejects_unknown_response_mode() {
        let mut settings = ClientSettings::new("https://idp.example.com", "spa");
        settings.response_mode = Some("form_post".into());
        assert_eq!(
            Config::resolve(&settings, &page()),
            Err(ConfigError::UnsupportedResponseMode("form_post".into()))
        );
    }

    #[test]
    fn test_resolve_rejects_empty_prefix() {
        let settings =
            ClientSettings::new("https://idp.example.com", "spa").with_store_key_prefix("");
        assert_eq!(
            Config::resolve(&settings, &page()),
            Err(ConfigError::MissingStoreKeyPrefix)
        );
    }

    #[test]
    fn test_store_key_layout() {
        let settings = ClientSettings::new("https://idp.example.com", "spa");
        let config = Config::resolve(&settings, &page()).unwrap();
        assert_eq!(
            config.store_key("access_token:"),
            "OIDC-MIF:access_token:https://idp.example.com:spa"
        );
        assert_eq!(config.flow_key("abc"), "OIDC-MIF:abc");
        assert_eq!(
            config.discovery_url(),
            "https://idp.example.com/.well-known/openid-configuration"
        );
    }

    #[test]
    fn test_response_mode_from_str() {
        assert_eq!("query".parse::<ResponseMode>().unwrap(), ResponseMode::Query);
        assert_eq!("fragment".parse::<ResponseMode>().unwrap(), ResponseMode::Fragment);
        assert!("Query".parse::<ResponseMode>().is_err());
        assert_eq!(ResponseMode::Fragment.to_string(), "fragment");
    }

    #[test]
    fn test_apply_overrides() {
        let vars: HashMap<&str, &str> = [
            ("OIDC_AUTHORITY", "https://env.example.com"),
            ("OIDC_CLIENT_ID", "env-client"),
            ("OIDC_SCOPE", ""),
            ("OIDC_PKCE", "false"),
        ]
        .into_iter()
        .collect();

        let mut settings = ClientSettings::new("https://file.example.com", "file-client")
            .with_scope("openid email");
        let applied = settings.apply_overrides(|name| vars.get(name).map(|v| v.to_string()));

        assert_eq!(settings.authority, "https://env.example.com");
        assert_eq!(settings.client_id, "env-client");
        assert_eq!(settings.scope, None);
        assert_eq!(settings.pkce, Some(false));
        assert_eq!(applied.len(), 4);
    }

    #[test]
    fn test_pkce_override_defaults_to_enabled() {
        let mut settings = ClientSettings::default();
        settings.apply_overrides(|name| (name == "OIDC_PKCE").then(|| "yes".to_string()));
        assert_eq!(settings.pkce, Some(true));
    }

    #[test]
    fn test_app_config_from_toml() {
        let toml_str = r#"
            [client]
            authority = "https://idp.example.com"
            client_id = "spa"
            response_mode = "fragment"

            [storage]
            dir = "/tmp/oidc"

            [logging]
            level = "debug"
            json = true
        "#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.client.client_id, "spa");
        assert_eq!(config.client.response_mode.as_deref(), Some("fragment"));
        assert_eq!(config.storage.dir, PathBuf::from("/tmp/oidc"));
        assert_eq!(config.logging.level, "debug");
        assert!(config.logging.json);
    }

    #[test]
    fn test_app_config_env_overrides() {
        let mut config = AppConfig::default();
        config.apply_env_overrides(|name| match name {
            "OIDC_LOG_LEVEL" => Some("trace".into()),
            "OIDC_LOG_JSON" => Some("on".into()),
            "OIDC_STORAGE_DIR" => Some("/var/lib/oidc".into()),
            _ => None,
        });
        assert_eq!(config.logging.level, "trace");
        assert!(config.logging.json);
        assert_eq!(config.storage.dir, PathBuf::from("/var/lib/oidc"));
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.logging.level, "info");
    }
}
