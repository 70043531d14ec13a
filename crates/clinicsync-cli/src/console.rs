//! Terminal stand-ins for the mobile platform's sign-in UI.
//!
//! The user opens the printed URL in a browser, completes consent and pastes
//! the URL the browser was redirected to. An empty line cancels.

use async_trait::async_trait;
use clinicsync_core::auth::{AuthError, CredentialKind};
use clinicsync_core::config::IdentityConfig;
use clinicsync_core::providers::identity::exchange_authorization_code;
use clinicsync_core::providers::{
    ConsentGrant, ConsentRequest, IdentityPlatform, RedirectBroker, RedirectLauncher,
};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::io::{AsyncBufReadExt, BufReader};
use url::Url;

const STATE_LENGTH: usize = 32;

/// Print a prompt and read one line. `None` when the user entered nothing.
async fn prompt_line(prompt: &str) -> Result<Option<String>, AuthError> {
    eprintln!("{}", prompt);
    let mut line = String::new();
    BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .map_err(|e| AuthError::Network(format!("failed to read from terminal: {}", e)))?;
    let line = line.trim();
    Ok((!line.is_empty()).then(|| line.to_string()))
}

fn random_state() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(STATE_LENGTH)
        .map(char::from)
        .collect()
}

/// Browser-based identity consent driven from the terminal.
pub struct ConsolePlatform {
    http: reqwest::Client,
    config: IdentityConfig,
}

impl ConsolePlatform {
    pub fn new(http: reqwest::Client, config: IdentityConfig) -> Self {
        Self { http, config }
    }
}

#[async_trait]
impl IdentityPlatform for ConsolePlatform {
    async fn sign_in(&self, request: &ConsentRequest) -> Result<ConsentGrant, AuthError> {
        let state = random_state();
        let url = request.authorization_url(&state)?;
        let pasted = prompt_line(&format!(
            "Open this URL to sign in, then paste the address you were redirected to:\n\n  {}\n",
            url
        ))
        .await?
        .ok_or(AuthError::UserCancelled)?;

        let callback = Url::parse(&pasted)
            .map_err(|e| AuthError::MalformedResponse(format!("not a URL: {}", e)))?;
        let param = |name: &str| {
            callback
                .query_pairs()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.into_owned())
        };

        match param("error").as_deref() {
            Some("access_denied") => return Err(AuthError::UserCancelled),
            Some(_) => return Err(AuthError::ConsentRevoked(CredentialKind::Identity)),
            None => {}
        }
        if param("state").as_deref() != Some(state.as_str()) {
            return Err(AuthError::MalformedResponse(
                "callback state does not match the request".to_string(),
            ));
        }
        let code = param("code")
            .ok_or_else(|| AuthError::MalformedResponse("callback has no code".to_string()))?;

        exchange_authorization_code(&self.http, &self.config, &code).await
    }

    async fn sign_in_silently(&self, _request: &ConsentRequest) -> Result<ConsentGrant, AuthError> {
        // A terminal has no cached platform account to fall back on
        Err(AuthError::InteractionRequired(CredentialKind::Identity))
    }
}

/// Prints the authorization URL and feeds the pasted callback to the broker.
pub struct ConsoleLauncher {
    broker: RedirectBroker,
}

impl ConsoleLauncher {
    pub fn new(broker: RedirectBroker) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl RedirectLauncher for ConsoleLauncher {
    async fn open(&self, url: &Url) -> Result<(), AuthError> {
        let pasted = prompt_line(&format!(
            "Open this URL to link your conferencing account, \
             then paste the address you were redirected to:\n\n  {}\n",
            url
        ))
        .await?;

        match pasted {
            Some(raw) => {
                let callback = Url::parse(&raw)
                    .map_err(|e| AuthError::MalformedResponse(format!("not a URL: {}", e)))?;
                self.broker.deliver(callback);
            }
            None => {
                self.broker.cancel();
            }
        }
        Ok(())
    }
}
