//! Authorization Code + PKCE OpenID Connect client for public clients.
//!
//! The client keeps tokens in shared durable storage, refreshes them in the
//! background, and keeps several client instances sharing that storage (one
//! per browsing context) consistent through storage change notifications.
//!
//! ```no_run
//! use std::sync::Arc;
//! use oidc_pkce_client::{ClientSettings, InitOutcome, MemoryLocation, OidcClient};
//!
//! # async fn run() -> oidc_pkce_client::Result<()> {
//! let page = "https://app.example.com/".parse().unwrap();
//! let location = Arc::new(MemoryLocation::new(page));
//! let settings = ClientSettings::new("https://idp.example.com", "spa");
//! let client = OidcClient::builder(settings, location).build()?;
//! if client.init().await? == InitOutcome::Ready {
//!     let _ = client.login(None).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod callback;
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod flow;
pub mod http;
pub mod jwt;
pub mod location;
pub mod logging;
pub mod login;
pub mod metadata;
pub mod outcome;
pub mod pkce;
pub mod refresh;
pub mod store;
pub mod task;
pub mod tokens;

pub use client::{OidcClient, OidcClientBuilder, Session};
pub use config::{ClientSettings, Config, ResponseMode};
pub use error::{ConfigError, OidcError, Result};
pub use events::{EventKind, OidcEvent, SubscriptionId};
pub use http::{HttpResponse, HttpTransport, ReqwestTransport};
pub use location::{Location, MemoryLocation};
pub use outcome::{InitOutcome, RedirectOutcome, SkipReason};
pub use store::{FileStore, KeyValueStore, MemoryStore, PollingWatcher, StorageWatcher};
pub use tokens::TokenSet;
