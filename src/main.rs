//! oidc-pkce -- headless Authorization Code + PKCE client.
//!
//! Drives the login lifecycle from a terminal:
//!   - `login` prints the authorization URL to open in a browser
//!   - `callback` takes the URL the browser was redirected to and stores tokens
//!   - `tokens`, `refresh`, `logout` and `discover` work on the stored state
//!
//! Tokens persist under `{storage.dir}/durable`, pending logins under
//! `{storage.dir}/session`.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use url::Url;

use oidc_pkce_client::config::AppConfig;
use oidc_pkce_client::{
    FileStore, InitOutcome, MemoryLocation, OidcClient, RedirectOutcome, SkipReason, logging,
};

/// Address the client pretends to run on when no URL is given.
const DEFAULT_PAGE_URL: &str = "http://localhost:8080/";

// ---------------------------------------------------------------------------
// CLI argument parsing (minimal, no clap dependency)
// ---------------------------------------------------------------------------

#[derive(Debug, PartialEq, Eq)]
enum Command {
    Discover,
    Login { redirect_uri: Option<String> },
    Callback { url: String },
    Tokens,
    Logout,
    Refresh,
    Help,
    Version,
}

#[derive(Debug)]
struct CliArgs {
    config_path: PathBuf,
    command: Command,
}

fn parse_args<I>(args: I) -> Result<CliArgs, String>
where
    I: IntoIterator<Item = String>,
{
    let mut args = args.into_iter();
    let mut config_path = PathBuf::from("oidc-pkce.toml");
    let mut positional = Vec::new();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| "--config requires a path argument".to_string())?;
                config_path = PathBuf::from(path);
            }
            "--help" | "-h" => positional = vec!["help".to_string()],
            "--version" | "-V" => positional = vec!["version".to_string()],
            other if other.starts_with('-') => return Err(format!("Unknown argument: {other}")),
            _ => positional.push(arg),
        }
    }

    let mut positional = positional.into_iter();
    let command = match positional.next().as_deref() {
        Some("discover") => Command::Discover,
        Some("login") => Command::Login {
            redirect_uri: positional.next(),
        },
        Some("callback") => Command::Callback {
            url: positional
                .next()
                .ok_or_else(|| "callback requires the redirected URL".to_string())?,
        },
        Some("tokens") => Command::Tokens,
        Some("logout") => Command::Logout,
        Some("refresh") => Command::Refresh,
        Some("help") | None => Command::Help,
        Some("version") => Command::Version,
        Some(other) => return Err(format!("Unknown command: {other}")),
    };
    if let Some(extra) = positional.next() {
        return Err(format!("Unexpected argument: {extra}"));
    }

    Ok(CliArgs {
        config_path,
        command,
    })
}

fn print_usage() {
    println!(
        "\
oidc-pkce {version} -- Authorization Code + PKCE client

USAGE:
    oidc-pkce [OPTIONS] <COMMAND>

COMMANDS:
    discover                 Fetch and validate the provider metadata
    login [REDIRECT_URI]     Print the authorization URL [default: {page}]
    callback <URL>           Exchange the code in a redirected URL for tokens
    tokens                   Print stored tokens and access token claims
    refresh                  Refresh the access token if it expires soon
    logout                   Clear tokens and print the end-session URL

OPTIONS:
    -c, --config <PATH>    Path to configuration file [default: oidc-pkce.toml]
    -h, --help             Print this help message
    -V, --version          Print version information

ENVIRONMENT:
    RUST_LOG               Override log level (e.g. RUST_LOG=debug)
    OIDC_AUTHORITY, OIDC_CLIENT_ID, OIDC_SCOPE, OIDC_RESPONSE_MODE, OIDC_PKCE,
    OIDC_LOGOUT_BACK_URL, OIDC_STORE_KEY_PREFIX, OIDC_STORAGE_DIR,
    OIDC_LOG_LEVEL, OIDC_LOG_JSON
",
        version = env!("CARGO_PKG_VERSION"),
        page = DEFAULT_PAGE_URL,
    );
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

fn main() -> anyhow::Result<()> {
    let cli = match parse_args(std::env::args().skip(1)) {
        Ok(cli) => cli,
        Err(message) => {
            eprintln!("Error: {message}");
            eprintln!("Run with --help for usage information.");
            std::process::exit(1);
        }
    };

    match cli.command {
        Command::Help => {
            print_usage();
            return Ok(());
        }
        Command::Version => {
            println!("oidc-pkce {}", env!("CARGO_PKG_VERSION"));
            return Ok(());
        }
        _ => {}
    }

    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to build Tokio runtime")?
        .block_on(async_main(cli))
}

async fn async_main(cli: CliArgs) -> anyhow::Result<()> {
    let config = AppConfig::load(&cli.config_path)?;
    logging::init(&config.logging)?;

    tracing::debug!(
        version = env!("CARGO_PKG_VERSION"),
        config = %cli.config_path.display(),
        storage = %config.storage.dir.display(),
        "Starting oidc-pkce"
    );

    let page = match &cli.command {
        Command::Callback { url } => url.as_str(),
        Command::Login {
            redirect_uri: Some(uri),
        } => uri.as_str(),
        _ => DEFAULT_PAGE_URL,
    };
    let page = Url::parse(page).with_context(|| format!("Invalid URL: {page}"))?;
    let location = Arc::new(MemoryLocation::new(page));

    let client = OidcClient::builder(config.client.clone(), location)
        .durable_store(Arc::new(FileStore::new(config.storage.dir.join("durable"))))
        .session_store(Arc::new(FileStore::new(config.storage.dir.join("session"))))
        .build()?;

    let result = run(&client, cli.command).await;
    client.shutdown().await;
    result
}

async fn run(client: &OidcClient, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Discover => {
            let metadata = client.metadata().await?;
            println!("authorization_endpoint: {}", metadata.authorization_endpoint);
            println!("token_endpoint:         {}", metadata.token_endpoint);
            println!("end_session_endpoint:   {}", metadata.end_session_endpoint);
            let modes: Vec<&str> = metadata.response_modes.iter().map(|m| m.as_str()).collect();
            println!("response modes:         {}", modes.join(", "));
        }
        Command::Login { redirect_uri } => {
            report_redirect(client.login(redirect_uri.as_deref()).await?);
        }
        Command::Callback { .. } => match client.init().await? {
            InitOutcome::Navigated(url) => println!("Tokens stored. Continue at {url}"),
            InitOutcome::Ready => anyhow::bail!("The URL carries no state and code parameters"),
        },
        Command::Tokens => {
            let tokens = client.get_user_tokens();
            println!("{}", serde_json::to_string_pretty(&tokens)?);
            if let Some(session) = client.session() {
                println!("{}", serde_json::to_string_pretty(&session.claims)?);
                let roles = session.claims.roles();
                if !roles.is_empty() {
                    println!("roles: {}", roles.join(", "));
                }
            }
        }
        Command::Logout => report_redirect(client.logout().await?),
        Command::Refresh => {
            let outcome = client.refresh_now().await?;
            println!("{outcome:?}");
        }
        Command::Help | Command::Version => {}
    }
    Ok(())
}

fn report_redirect(outcome: RedirectOutcome) {
    match outcome {
        RedirectOutcome::Navigated(url) => println!("{url}"),
        RedirectOutcome::Skipped(SkipReason::AlreadyAuthenticated) => {
            println!("Already logged in");
        }
        RedirectOutcome::Skipped(SkipReason::NotAuthenticated) => println!("Not logged in"),
        RedirectOutcome::Skipped(SkipReason::CallbackInProgress) => {
            println!("URL carries callback parameters; run `callback` instead");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<CliArgs, String> {
        parse_args(args.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_print_usage_does_not_panic() {
        print_usage();
    }

    #[test]
    fn test_parse_commands() {
        assert_eq!(parse(&[]).unwrap().command, Command::Help);
        assert_eq!(parse(&["discover"]).unwrap().command, Command::Discover);
        assert_eq!(
            parse(&["login"]).unwrap().command,
            Command::Login { redirect_uri: None }
        );
        assert_eq!(
            parse(&["login", "http://localhost:3000/cb"]).unwrap().command,
            Command::Login {
                redirect_uri: Some("http://localhost:3000/cb".into())
            }
        );
        assert_eq!(
            parse(&["callback", "http://localhost/?state=s&code=c"]).unwrap().command,
            Command::Callback {
                url: "http://localhost/?state=s&code=c".into()
            }
        );
        assert_eq!(parse(&["-V"]).unwrap().command, Command::Version);
    }

    #[test]
    fn test_parse_config_path() {
        let cli = parse(&["-c", "/etc/oidc.toml", "tokens"]).unwrap();
        assert_eq!(cli.config_path, PathBuf::from("/etc/oidc.toml"));
        assert_eq!(cli.command, Command::Tokens);
        assert_eq!(parse(&["tokens"]).unwrap().config_path, PathBuf::from("oidc-pkce.toml"));
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse(&["--config"]).is_err());
        assert!(parse(&["callback"]).is_err());
        assert!(parse(&["frobnicate"]).is_err());
        assert!(parse(&["--verbose"]).is_err());
        assert!(parse(&["tokens", "extra"]).is_err());
    }
}
