//! clinicsync - command-line driver for the clinic scheduling session.
//!
//! Signs a doctor in, keeps the identity, calendar delegation and
//! conferencing credentials fresh and issues authenticated requests against
//! the clinic backend.

mod console;

use std::io;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clinicsync_core::auth::{CredentialKind, ProviderSet, SessionManager, SessionOptions};
use clinicsync_core::providers::{
    CalendarDelegationAdapter, ConferencingAdapter, IdentityAdapter, RedirectBroker,
};
use clinicsync_core::{ApiClient, ApiRequest, Config};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use console::{ConsoleLauncher, ConsolePlatform};

const LOG_FILE_PREFIX: &str = "clinicsync.log";

const USAGE: &str = "\
Usage: clinicsync <command>

Commands:
  login                 Sign in and set up calendar delegation
  status                Show the current session
  refresh <kind>        Refresh identity, calendar-delegation or conferencing
  link-conferencing     Link a conferencing account
  profile               Fetch the doctor profile and update the session
  get <path>            Send an authenticated GET request
  request <method> <path> [json]
                        Send an authenticated GET, POST, PUT or DELETE
  config                Write the effective configuration and print it
  logout                Sign out and clear stored credentials";

/// Initialize the tracing subscriber for logging.
///
/// Logs go to stderr and, when a log directory is available, to a daily
/// rolling file. The returned guard must be held until exit so buffered
/// lines are flushed.
fn init_tracing(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    // Use RUST_LOG env var to control log level (e.g., RUST_LOG=debug)
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().with_writer(writer).with_ansi(false)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(io::stderr))
        .with(file_layer)
        .with(filter)
        .init();

    guard
}

fn parse_kind(raw: &str) -> Result<CredentialKind> {
    CredentialKind::ALL
        .into_iter()
        .find(|kind| kind.storage_key() == raw)
        .with_context(|| {
            format!(
                "Unknown credential kind '{}' \
                 (expected identity, calendar-delegation or conferencing)",
                raw
            )
        })
}

async fn build_session(config: &Config) -> Result<SessionManager> {
    let http = config.http_client()?;
    let store = config.credential_store()?;
    let broker = RedirectBroker::new();

    let identity = Arc::new(IdentityAdapter::new(
        Arc::new(ConsolePlatform::new(http.clone(), config.identity.clone())),
        http.clone(),
        config.identity.clone(),
    ));
    let calendar = Arc::new(CalendarDelegationAdapter::new(
        identity.clone(),
        http,
        config.endpoint("/exchange"),
    ));
    let conferencing = Arc::new(ConferencingAdapter::new(
        Arc::new(ConsoleLauncher::new(broker.clone())),
        broker,
        config.conferencing.clone(),
        config.interactive_timeout(),
    ));

    let providers = ProviderSet {
        identity,
        calendar_delegation: calendar,
        conferencing,
    };
    Ok(SessionManager::init(store, providers, SessionOptions::from(config)).await)
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn build_request(method: &str, path: &str, body: Option<&String>) -> Result<ApiRequest> {
    let request = match method.to_ascii_uppercase().as_str() {
        "GET" => ApiRequest::get(path),
        "POST" => ApiRequest::post(path),
        "PUT" => ApiRequest::put(path),
        "DELETE" => ApiRequest::delete(path),
        other => bail!("Unsupported method '{}' (expected GET, POST, PUT or DELETE)", other),
    };
    match body {
        Some(raw) => {
            let value: serde_json::Value =
                serde_json::from_str(raw).context("Request body is not valid JSON")?;
            Ok(request.json(&value)?)
        }
        None => Ok(request),
    }
}

async fn run(
    command: &str,
    args: &[String],
    config: &Config,
    session: &SessionManager,
) -> Result<()> {
    match command {
        "login" => {
            let signed_in = session.sign_in().await?;
            if signed_in.status().calendar_sync_available {
                eprintln!("Signed in. Calendar sync is enabled.");
            } else {
                eprintln!("Signed in. Calendar sync is unavailable.");
            }
            let api = ApiClient::from_config(config, session.clone())?;
            match api.sync_profile().await {
                Ok(profile) => eprintln!("Welcome, {}.", profile.display_name()),
                Err(e) => eprintln!("Could not load profile: {}", e),
            }
        }
        "status" => print_json(&session.session().status())?,
        "refresh" => {
            let raw = args.first().context("refresh needs a credential kind")?;
            let kind = parse_kind(raw)?;
            let credential = session.ensure_fresh(kind).await?;
            match credential.expires_at {
                Some(at) => eprintln!("{} is fresh until {}", kind, at.to_rfc3339()),
                None => eprintln!("{} refreshed (expiry unknown)", kind),
            }
        }
        "link-conferencing" => {
            session.link_conferencing().await?;
            eprintln!("Conferencing account linked.");
        }
        "profile" => {
            let api = ApiClient::from_config(config, session.clone())?;
            let profile = api.sync_profile().await?;
            eprintln!("Signed in as {}", profile.display_name());
            print_json(&profile)?;
        }
        "get" => {
            let path = args.first().context("get needs a path")?;
            let api = ApiClient::from_config(config, session.clone())?;
            let body: serde_json::Value = api.get_json(path).await?;
            print_json(&body)?;
        }
        "request" => {
            let (method, path) = match args {
                [method, path, ..] => (method, path),
                _ => bail!("request needs a method and a path"),
            };
            let request = build_request(method, path, args.get(2))?;
            let api = ApiClient::from_config(config, session.clone())?;
            let body: serde_json::Value = api.send_json(&request).await?;
            print_json(&body)?;
        }
        "config" => {
            config.save()?;
            print_json(config)?;
        }
        "logout" => {
            session.logout().await?;
            eprintln!("Signed out.");
        }
        "help" | "--help" | "-h" => println!("{}", USAGE),
        other => bail!("Unknown command '{}'\n\n{}", other, USAGE),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (silently ignore if not found)
    let _ = dotenvy::dotenv();

    let mut config = Config::load()?;
    config.apply_env()?;

    let log_dir = config.cache_dir().ok();
    let _guard = init_tracing(log_dir.as_deref());
    info!("clinicsync starting");

    let args: Vec<String> = std::env::args().skip(1).collect();
    let Some((command, rest)) = args.split_first() else {
        println!("{}", USAGE);
        return Ok(());
    };

    let session = build_session(&config).await?;
    let result = run(command, rest, &config, &session).await;
    session.teardown();

    info!("clinicsync shutting down");
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_kind() {
        assert_eq!(parse_kind("identity").unwrap(), CredentialKind::Identity);
        assert_eq!(
            parse_kind("calendar-delegation").unwrap(),
            CredentialKind::CalendarDelegation
        );
        assert!(parse_kind("zoom").is_err());
    }

    #[test]
    fn test_build_request() {
        assert!(build_request("delete", "/appointments/a1", None).is_ok());
        let body = r#"{"start": "2026-01-05T09:00:00Z"}"#.to_string();
        assert!(build_request("PUT", "/appointments/a1", Some(&body)).is_ok());

        let bad = "{not json".to_string();
        assert!(build_request("POST", "/appointments", Some(&bad)).is_err());
        assert!(build_request("PATCH", "/appointments/a1", None).is_err());
    }
}
