//! Error types for the OIDC client.
//!
//! [`OidcError`] is the single error returned by every fallible operation.
//! Configuration problems are reported through the nested [`ConfigError`]
//! so hosts can match on the exact field that was rejected.

/// Invalid user configuration, detected while resolving [`crate::config::Config`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("authority is not set")]
    MissingAuthority,

    #[error("clientId is not set")]
    MissingClientId,

    #[error("responseMode is \"{0}\", but accepted only one of \"query\", \"fragment\"")]
    UnsupportedResponseMode(String),

    #[error("storeKeyPrefix is not set")]
    MissingStoreKeyPrefix,
}

/// Errors that can occur while driving the login lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum OidcError {
    /// Invalid user configuration. Fatal at construction.
    #[error("CONFIG: {0}")]
    Config(#[from] ConfigError),

    /// Discovery document missing or lacking a required capability.
    #[error("METADATA: {0}")]
    Metadata(String),

    /// No pending flow for the returned `state`.
    #[error("LOGIN CALLBACK: {0}")]
    Callback(String),

    /// Token endpoint rejected the request or returned an unusable token.
    #[error("TOKEN EXCHANGE: {detail}")]
    TokenExchange { status: Option<u16>, detail: String },

    /// A token could not be decoded as a JWT.
    #[error("JWT DECODE: {0}")]
    ClaimDecode(String),

    /// Storage backend failure.
    #[error("Storage error: {0}")]
    Storage(String),

    /// HTTP client error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Transport failure reported by a custom [`crate::http::HttpTransport`].
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl OidcError {
    /// HTTP status attached to a token endpoint failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::TokenExchange { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<std::io::Error> for OidcError {
    fn from(err: std::io::Error) -> Self {
        OidcError::Storage(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, OidcError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = OidcError::from(ConfigError::MissingAuthority);
        assert_eq!(err.to_string(), "CONFIG: authority is not set");

        let err = OidcError::Callback("Data not found for id:abc".into());
        assert_eq!(err.to_string(), "LOGIN CALLBACK: Data not found for id:abc");

        let err = ConfigError::UnsupportedResponseMode("form_post".into());
        assert_eq!(
            err.to_string(),
            "responseMode is \"form_post\", but accepted only one of \"query\", \"fragment\""
        );
    }

    #[test]
    fn test_status_only_for_token_exchange() {
        let err = OidcError::TokenExchange {
            status: Some(400),
            detail: "invalid_grant".into(),
        };
        assert_eq!(err.status(), Some(400));
        assert_eq!(OidcError::Metadata("x".into()).status(), None);
    }
}
