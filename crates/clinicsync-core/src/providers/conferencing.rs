//! Conferencing provider adapter.
//!
//! Token comes back through a redirect to the app's URL scheme, with
//! `access_token` and `expires_in` in the callback's query or fragment.
//! There is no silent refresh; refreshing re-runs the interactive flow.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tracing::{debug, info, warn};
use url::Url;

use super::{ProviderAdapter, RedirectBroker, RedirectLauncher};
use crate::auth::{AuthError, Credential, CredentialKind};
use crate::config::ConferencingConfig;

const STATE_LENGTH: usize = 32;

pub struct ConferencingAdapter {
    launcher: Arc<dyn RedirectLauncher>,
    broker: RedirectBroker,
    config: ConferencingConfig,
    /// Flow is treated as abandoned after this long.
    window: Duration,
}

impl ConferencingAdapter {
    pub fn new(
        launcher: Arc<dyn RedirectLauncher>,
        broker: RedirectBroker,
        config: ConferencingConfig,
        window: Duration,
    ) -> Self {
        Self {
            launcher,
            broker,
            config,
            window,
        }
    }

    pub fn authorization_url(&self, state: &str) -> Result<Url, AuthError> {
        let mut url = Url::parse(&self.config.authorize_url)
            .map_err(|e| AuthError::MalformedResponse(format!("authorize url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("response_type", "token")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("state", state);
        Ok(url)
    }

    async fn run_flow(&self) -> Result<Credential, AuthError> {
        let state: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STATE_LENGTH)
            .map(char::from)
            .collect();
        let url = self.authorization_url(&state)?;

        let callback = self.broker.register();
        if let Err(e) = self.launcher.open(&url).await {
            self.broker.cancel();
            return Err(e);
        }

        let callback_url = match tokio::time::timeout(self.window, callback).await {
            Ok(Ok(outcome)) => outcome?,
            // Sender dropped without an answer
            Ok(Err(_)) => return Err(AuthError::UserCancelled),
            Err(_) => {
                warn!(window_secs = self.window.as_secs(), "Conferencing authorization abandoned");
                self.broker.cancel();
                return Err(AuthError::UserCancelled);
            }
        };

        let credential = parse_callback(&callback_url, &state, Utc::now())?;
        info!("Conferencing account linked");
        Ok(credential)
    }
}

/// Parse the token out of a redirect callback.
pub fn parse_callback(
    url: &Url,
    expected_state: &str,
    captured_at: DateTime<Utc>,
) -> Result<Credential, AuthError> {
    let mut params: Vec<(String, String)> = url.query_pairs().into_owned().collect();
    if let Some(fragment) = url.fragment() {
        params.extend(url::form_urlencoded::parse(fragment.as_bytes()).into_owned());
    }
    let param = |name: &str| {
        params
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    };

    if let Some(error) = param("error") {
        debug!(error = error, "Conferencing provider returned an error");
        return Err(match error {
            "access_denied" => AuthError::UserCancelled,
            _ => AuthError::ConsentRevoked(CredentialKind::Conferencing),
        });
    }

    if param("state") != Some(expected_state) {
        return Err(AuthError::MalformedResponse(
            "callback state does not match the request".to_string(),
        ));
    }

    let token = param("access_token")
        .filter(|t| !t.is_empty())
        .ok_or_else(|| AuthError::MalformedResponse("callback has no access_token".to_string()))?;

    let expires_in = match param("expires_in") {
        Some(raw) => Some(raw.parse::<u64>().map_err(|_| {
            AuthError::MalformedResponse(format!("invalid expires_in: {}", raw))
        })?),
        None => None,
    };

    Credential::with_lifetime(CredentialKind::Conferencing, token, captured_at, expires_in, None)
}

#[async_trait]
impl ProviderAdapter for ConferencingAdapter {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Conferencing
    }

    async fn acquire(&self, interactive: bool) -> Result<Credential, AuthError> {
        if !interactive {
            return Err(AuthError::InteractionRequired(CredentialKind::Conferencing));
        }
        self.run_flow().await
    }

    async fn refresh(&self, _existing: &Credential) -> Result<Credential, AuthError> {
        self.run_flow().await
    }

    fn refresh_is_interactive(&self) -> bool {
        true
    }
}
