//! Calendar delegation adapter.
//!
//! The backend mints the delegation token from a one-time server-auth-code.
//! Its lifetime is fixed server-side and not visible in the token, so the
//! expiry is tracked from the moment of each exchange.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{AuthCodeSource, ProviderAdapter};
use crate::auth::{AuthError, Credential, CredentialKind};

/// Server-side lifetime of a delegation token.
const DELEGATION_LIFETIME_MINUTES: i64 = 55;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeRequest<'a> {
    server_auth_code: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExchangeResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
}

pub struct CalendarDelegationAdapter {
    codes: Arc<dyn AuthCodeSource>,
    http: reqwest::Client,
    exchange_url: String,
}

impl CalendarDelegationAdapter {
    pub fn new(
        codes: Arc<dyn AuthCodeSource>,
        http: reqwest::Client,
        exchange_url: String,
    ) -> Self {
        Self {
            codes,
            http,
            exchange_url,
        }
    }

    async fn exchange(&self) -> Result<Credential, AuthError> {
        let code = self.codes.server_auth_code().await?;

        let response = self
            .http
            .post(&self.exchange_url)
            .json(&ExchangeRequest {
                server_auth_code: &code,
            })
            .send()
            .await
            .map_err(|e| AuthError::from_transport(&e))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AuthError::ConsentRevoked(CredentialKind::CalendarDelegation));
        }
        if !status.is_success() {
            return Err(AuthError::Network(format!("exchange returned {}", status)));
        }

        let body: ExchangeResponse = response.json().await.map_err(|e| {
            warn!(error = %e, "Failed to parse exchange response");
            AuthError::MalformedResponse(e.to_string())
        })?;

        let refresh_token = body.refresh_token.filter(|t| !t.is_empty());
        let token = match body.access_token.filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => match refresh_token.clone() {
                Some(token) => token,
                None => {
                    warn!("Calendar exchange returned no usable token; calendar sync disabled");
                    return Err(AuthError::DelegationUnavailable);
                }
            },
        };

        let issued_at = Utc::now();
        debug!("Calendar delegation token exchanged");
        Credential::new(
            CredentialKind::CalendarDelegation,
            token,
            issued_at,
            Some(issued_at + Duration::minutes(DELEGATION_LIFETIME_MINUTES)),
            refresh_token,
        )
    }
}

#[async_trait]
impl ProviderAdapter for CalendarDelegationAdapter {
    fn kind(&self) -> CredentialKind {
        CredentialKind::CalendarDelegation
    }

    async fn acquire(&self, _interactive: bool) -> Result<Credential, AuthError> {
        self.exchange().await
    }

    /// Stale state alone cannot be refreshed; every refresh is a new exchange.
    async fn refresh(&self, _existing: &Credential) -> Result<Credential, AuthError> {
        self.exchange().await
    }
}
