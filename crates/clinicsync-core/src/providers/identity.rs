//! Identity provider adapter.
//!
//! Interactive consent runs on the platform (native sign-in sheet or a
//! browser); refresh is a plain OAuth refresh-token grant against the
//! provider's token endpoint.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::{AuthCodeSource, ProviderAdapter};
use crate::auth::{AuthError, Credential, CredentialKind};
use crate::config::IdentityConfig;

/// What the platform sign-in flow is asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsentRequest {
    pub client_id: String,
    pub server_client_id: String,
    pub scopes: Vec<String>,
    /// Force the consent screen so the provider issues a refresh token even
    /// when the user consented before.
    pub force_refresh_token: bool,
    pub authorize_url: String,
    pub redirect_uri: String,
}

impl ConsentRequest {
    /// Authorization-code URL for browser-based platforms.
    pub fn authorization_url(&self, state: &str) -> Result<Url, AuthError> {
        let mut url = Url::parse(&self.authorize_url)
            .map_err(|e| AuthError::MalformedResponse(format!("authorize url: {}", e)))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", &self.client_id)
                .append_pair("redirect_uri", &self.redirect_uri)
                .append_pair("response_type", "code")
                .append_pair("scope", &self.scopes.join(" "))
                .append_pair("state", state)
                .append_pair("include_granted_scopes", "true");
            if self.force_refresh_token {
                query
                    .append_pair("access_type", "offline")
                    .append_pair("prompt", "consent");
            }
        }
        Ok(url)
    }
}

/// What a successful platform sign-in yields.
#[derive(Clone, PartialEq, Eq)]
pub struct ConsentGrant {
    pub token: String,
    pub expires_in: Option<u64>,
    pub refresh_token: Option<String>,
    /// One-time code the backend exchanges for calendar delegation.
    pub server_auth_code: Option<String>,
}

impl std::fmt::Debug for ConsentGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsentGrant")
            .field("expires_in", &self.expires_in)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("has_server_auth_code", &self.server_auth_code.is_some())
            .finish()
    }
}

/// Platform sign-in surface.
#[async_trait]
pub trait IdentityPlatform: Send + Sync {
    /// Show the consent UI. Resolves with `UserCancelled` if the user backs out.
    async fn sign_in(&self, request: &ConsentRequest) -> Result<ConsentGrant, AuthError>;

    /// Re-use an existing consent without any UI.
    async fn sign_in_silently(&self, request: &ConsentRequest) -> Result<ConsentGrant, AuthError>;
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
    refresh_token: Option<String>,
    id_token: Option<String>,
}

impl TokenResponse {
    fn into_grant(self) -> ConsentGrant {
        ConsentGrant {
            token: self.id_token.unwrap_or(self.access_token),
            expires_in: self.expires_in,
            refresh_token: self.refresh_token,
            server_auth_code: None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenErrorResponse {
    error: String,
    error_description: Option<String>,
}

fn token_error(status: StatusCode, body: &str) -> AuthError {
    let parsed = serde_json::from_str::<TokenErrorResponse>(body).ok();
    match parsed.as_ref().map(|e| e.error.as_str()) {
        Some("invalid_grant") => AuthError::ReauthRequired(CredentialKind::Identity),
        Some("access_denied" | "consent_required" | "unauthorized_client") => {
            AuthError::ConsentRevoked(CredentialKind::Identity)
        }
        Some(code) => {
            let detail = parsed
                .as_ref()
                .and_then(|e| e.error_description.clone())
                .unwrap_or_default();
            AuthError::Network(format!("token endpoint {}: {} {}", status, code, detail))
        }
        None if status.is_server_error() => {
            AuthError::Network(format!("token endpoint returned {}", status))
        }
        None => AuthError::MalformedResponse(format!("token endpoint returned {}", status)),
    }
}

async fn post_token_request(
    http: &reqwest::Client,
    token_url: &str,
    form: &[(&str, &str)],
) -> Result<ConsentGrant, AuthError> {
    let response = http
        .post(token_url)
        .form(form)
        .send()
        .await
        .map_err(|e| AuthError::from_transport(&e))?;

    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| AuthError::from_transport(&e))?;
    if !status.is_success() {
        return Err(token_error(status, &body));
    }

    serde_json::from_str::<TokenResponse>(&body)
        .map(TokenResponse::into_grant)
        .map_err(|e| {
            warn!(error = %e, "Failed to parse token response");
            AuthError::MalformedResponse(e.to_string())
        })
}

/// Exchange an authorization code from a browser-based consent flow.
pub async fn exchange_authorization_code(
    http: &reqwest::Client,
    config: &IdentityConfig,
    code: &str,
) -> Result<ConsentGrant, AuthError> {
    post_token_request(
        http,
        &config.token_url,
        &[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", &config.client_id),
            ("redirect_uri", &config.redirect_uri),
        ],
    )
    .await
}

pub struct IdentityAdapter {
    platform: Arc<dyn IdentityPlatform>,
    http: reqwest::Client,
    config: IdentityConfig,
    /// Server-auth-code from the last sign-in, handed to the first exchange.
    pending_code: Mutex<Option<String>>,
}

impl IdentityAdapter {
    pub fn new(
        platform: Arc<dyn IdentityPlatform>,
        http: reqwest::Client,
        config: IdentityConfig,
    ) -> Self {
        Self {
            platform,
            http,
            config,
            pending_code: Mutex::new(None),
        }
    }

    fn consent_request(&self, interactive: bool) -> ConsentRequest {
        ConsentRequest {
            client_id: self.config.client_id.clone(),
            server_client_id: self.config.server_client_id.clone(),
            scopes: self.config.scopes.clone(),
            force_refresh_token: interactive,
            authorize_url: self.config.authorize_url.clone(),
            redirect_uri: self.config.redirect_uri.clone(),
        }
    }

    fn stash_code(&self, code: Option<String>) {
        if let Some(code) = code {
            *self.pending_code.lock().unwrap_or_else(PoisonError::into_inner) = Some(code);
        }
    }

    fn take_code(&self) -> Option<String> {
        self.pending_code
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl ProviderAdapter for IdentityAdapter {
    fn kind(&self) -> CredentialKind {
        CredentialKind::Identity
    }

    async fn acquire(&self, interactive: bool) -> Result<Credential, AuthError> {
        let request = self.consent_request(interactive);
        let grant = if interactive {
            self.platform.sign_in(&request).await?
        } else {
            self.platform.sign_in_silently(&request).await?
        };

        if interactive && grant.refresh_token.is_none() {
            warn!(
                "Identity provider issued no refresh token after forced consent; \
                 silent refresh will fall back to silent sign-in"
            );
        }
        self.stash_code(grant.server_auth_code);

        info!(interactive, "Identity credential acquired");
        Credential::with_lifetime(
            CredentialKind::Identity,
            grant.token,
            Utc::now(),
            grant.expires_in,
            grant.refresh_token,
        )
    }

    async fn refresh(&self, existing: &Credential) -> Result<Credential, AuthError> {
        let Some(refresh_token) = existing.refresh_token.as_deref() else {
            debug!("No identity refresh token stored, trying silent sign-in");
            return self.acquire(false).await;
        };

        let grant = post_token_request(
            &self.http,
            &self.config.token_url,
            &[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", &self.config.client_id),
            ],
        )
        .await?;

        debug!(rotated = grant.refresh_token.is_some(), "Identity token refreshed");
        Credential::with_lifetime(
            CredentialKind::Identity,
            grant.token,
            Utc::now(),
            grant.expires_in,
            grant.refresh_token.or_else(|| existing.refresh_token.clone()),
        )
    }
}

#[async_trait]
impl AuthCodeSource for IdentityAdapter {
    async fn server_auth_code(&self) -> Result<String, AuthError> {
        if let Some(code) = self.take_code() {
            return Ok(code);
        }
        let grant = self
            .platform
            .sign_in_silently(&self.consent_request(false))
            .await?;
        grant.server_auth_code.ok_or(AuthError::DelegationUnavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wiremock::matchers::{body_string_contains, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[derive(Default)]
    struct FakePlatform {
        interactive_calls: AtomicUsize,
        silent_calls: AtomicUsize,
        forced: Mutex<Vec<bool>>,
        omit_refresh_token: bool,
    }

    #[async_trait]
    impl IdentityPlatform for FakePlatform {
        async fn sign_in(&self, request: &ConsentRequest) -> Result<ConsentGrant, AuthError> {
            self.interactive_calls.fetch_add(1, Ordering::SeqCst);
            self.forced.lock().unwrap().push(request.force_refresh_token);
            Ok(ConsentGrant {
                token: "interactive-token".into(),
                expires_in: Some(3600),
                refresh_token: (!self.omit_refresh_token).then(|| "refresh-1".to_string()),
                server_auth_code: Some("code-from-sign-in".into()),
            })
        }

        async fn sign_in_silently(
            &self,
            request: &ConsentRequest,
        ) -> Result<ConsentGrant, AuthError> {
            self.silent_calls.fetch_add(1, Ordering::SeqCst);
            self.forced.lock().unwrap().push(request.force_refresh_token);
            Ok(ConsentGrant {
                token: "silent-token".into(),
                expires_in: Some(3600),
                refresh_token: None,
                server_auth_code: Some("code-from-silent".into()),
            })
        }
    }

    fn adapter(platform: Arc<FakePlatform>, token_url: String) -> IdentityAdapter {
        let config = IdentityConfig {
            client_id: "client".into(),
            token_url,
            ..IdentityConfig::default()
        };
        IdentityAdapter::new(platform, reqwest::Client::new(), config)
    }

    fn existing(refresh_token: Option<&str>) -> Credential {
        Credential::new(
            CredentialKind::Identity,
            "old",
            Utc::now() - chrono::Duration::hours(2),
            Some(Utc::now() - chrono::Duration::hours(1)),
            refresh_token.map(str::to_string),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_interactive_acquire_forces_refresh_token() {
        let platform = Arc::new(FakePlatform::default());
        let adapter = adapter(platform.clone(), "http://unused".into());

        let cred = adapter.acquire(true).await.unwrap();
        assert_eq!(cred.token, "interactive-token");
        assert_eq!(cred.refresh_token.as_deref(), Some("refresh-1"));
        assert!(cred.expires_at.is_some());
        assert_eq!(*platform.forced.lock().unwrap(), vec![true]);
    }

    #[tokio::test]
    async fn test_missing_refresh_token_is_tolerated() {
        let platform = Arc::new(FakePlatform {
            omit_refresh_token: true,
            ..FakePlatform::default()
        });
        let adapter = adapter(platform, "http://unused".into());
        let cred = adapter.acquire(true).await.unwrap();
        assert_eq!(cred.refresh_token, None);
    }

    #[tokio::test]
    async fn test_server_auth_code_handed_off_once() {
        let platform = Arc::new(FakePlatform::default());
        let adapter = adapter(platform.clone(), "http://unused".into());
        adapter.acquire(true).await.unwrap();

        assert_eq!(adapter.server_auth_code().await.unwrap(), "code-from-sign-in");
        assert_eq!(adapter.server_auth_code().await.unwrap(), "code-from-silent");
        assert_eq!(platform.silent_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_exchanges_refresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=refresh_token"))
            .and(body_string_contains("refresh_token=refresh-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "access_token": "new-access",
                "expires_in": 3599
            })))
            .expect(1)
            .mount(&server)
            .await;

        let adapter = adapter(Arc::new(FakePlatform::default()), format!("{}/token", server.uri()));
        let cred = adapter.refresh(&existing(Some("refresh-1"))).await.unwrap();
        assert_eq!(cred.token, "new-access");
        // Provider did not rotate, so the old refresh token is kept
        assert_eq!(cred.refresh_token.as_deref(), Some("refresh-1"));
    }

    #[tokio::test]
    async fn test_revoked_refresh_token_requires_reauth() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "invalid_grant",
                "error_description": "Token has been expired or revoked."
            })))
            .mount(&server)
            .await;

        let adapter = adapter(Arc::new(FakePlatform::default()), format!("{}/token", server.uri()));
        let err = adapter.refresh(&existing(Some("refresh-1"))).await.unwrap_err();
        assert_eq!(err, AuthError::ReauthRequired(CredentialKind::Identity));
    }

    #[tokio::test]
    async fn test_server_error_is_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let adapter = adapter(Arc::new(FakePlatform::default()), format!("{}/token", server.uri()));
        let err = adapter.refresh(&existing(Some("refresh-1"))).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(!err.is_terminal());
    }

    #[tokio::test]
    async fn test_garbage_body_is_malformed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
            .mount(&server)
            .await;

        let adapter = adapter(Arc::new(FakePlatform::default()), format!("{}/token", server.uri()));
        let err = adapter.refresh(&existing(Some("refresh-1"))).await.unwrap_err();
        assert!(matches!(err, AuthError::MalformedResponse(_)));
    }

    #[tokio::test]
    async fn test_refresh_without_refresh_token_signs_in_silently() {
        let platform = Arc::new(FakePlatform::default());
        let adapter = adapter(platform.clone(), "http://unused".into());
        let cred = adapter.refresh(&existing(None)).await.unwrap();
        assert_eq!(cred.token, "silent-token");
        assert_eq!(platform.interactive_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_authorization_url_requests_offline_access() {
        let request = ConsentRequest {
            client_id: "client".into(),
            server_client_id: "server".into(),
            scopes: vec!["profile".into(), "email".into()],
            force_refresh_token: true,
            authorize_url: "https://accounts.example/auth".into(),
            redirect_uri: "clinicsync://oauth/identity".into(),
        };
        let url = request.authorization_url("xyz").unwrap();
        let pairs: Vec<(String, String)> = url.query_pairs().into_owned().collect();
        assert!(pairs.contains(&("access_type".into(), "offline".into())));
        assert!(pairs.contains(&("prompt".into(), "consent".into())));
        assert!(pairs.contains(&("scope".into(), "profile email".into())));
        assert!(pairs.contains(&("state".into(), "xyz".into())));
    }
}
