//! Tracing subscriber setup for hosts that do not install their own.

use tracing_subscriber::EnvFilter;

use crate::config::LoggingConfig;

/// Filter used when `RUST_LOG` is not set.
pub fn default_filter(config: &LoggingConfig) -> String {
    format!("oidc_pkce_client={},oidc_pkce={},warn", config.level, config.level)
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` takes precedence over the configured level. Fails if a global
/// subscriber is already installed.
pub fn init(config: &LoggingConfig) -> Result<(), tracing_subscriber::util::TryInitError> {
    use tracing_subscriber::util::SubscriberInitExt;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_filter(config)));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr);

    if config.json {
        subscriber.json().finish().try_init()
    } else {
        subscriber.finish().try_init()
    }
}
