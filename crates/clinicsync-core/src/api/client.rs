//! API client for the clinic scheduling backend.
//!
//! Credentials are attached per request from the `SessionManager`:
//! identity as `Authorization: Bearer`, calendar delegation and
//! conferencing under their own headers.

use std::time::Duration;

use anyhow::Result;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use super::ApiError;
use crate::auth::{AuthError, Credential, CredentialKind, SessionManager};
use crate::config::{join_url, Config};
use crate::models::DoctorProfile;

/// Header carrying the calendar delegation token.
pub const CALENDAR_AUTH_HEADER: &str = "x-calendar-authorization";

/// Header carrying the conferencing token.
pub const CONFERENCING_AUTH_HEADER: &str = "x-conferencing-token";

/// Maximum number of retries for rate-limited (429) requests.
const MAX_RATE_LIMIT_RETRIES: u32 = 3;

/// Initial backoff delay for rate limiting.
const INITIAL_BACKOFF: Duration = Duration::from_millis(1000);

/// Which credentials a request carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthRequirements {
    identity: bool,
    conferencing: bool,
}

impl AuthRequirements {
    /// Identity required; calendar delegation attached when held.
    pub fn authenticated() -> Self {
        Self {
            identity: true,
            conferencing: false,
        }
    }

    /// No credentials at all.
    pub fn public() -> Self {
        Self {
            identity: false,
            conferencing: false,
        }
    }

    /// Also attach the conferencing token when one is held.
    pub fn with_conferencing() -> Self {
        Self {
            identity: true,
            conferencing: true,
        }
    }
}

impl Default for AuthRequirements {
    fn default() -> Self {
        Self::authenticated()
    }
}

#[derive(Debug, Clone)]
pub struct ApiRequest {
    method: Method,
    path: String,
    body: Option<serde_json::Value>,
    auth: AuthRequirements,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            body: None,
            auth: AuthRequirements::default(),
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn json<B: Serialize>(mut self, body: &B) -> Result<Self, ApiError> {
        let value = serde_json::to_value(body).map_err(|e| {
            ApiError::InvalidResponse(format!("Failed to encode request body: {}", e))
        })?;
        self.body = Some(value);
        Ok(self)
    }

    pub fn auth(mut self, auth: AuthRequirements) -> Self {
        self.auth = auth;
        self
    }
}

/// Position in the 401 retry budget of a single request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Initial,
    AfterRefresh,
}

/// API client for the clinic backend.
/// Clone is cheap - reqwest::Client and SessionManager are both shared handles.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    session: SessionManager,
    rate_limit_backoff: Duration,
}

impl ApiClient {
    pub fn new(client: Client, base_url: impl Into<String>, session: SessionManager) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            session,
            rate_limit_backoff: INITIAL_BACKOFF,
        }
    }

    pub fn from_config(config: &Config, session: SessionManager) -> Result<Self> {
        Ok(Self::new(config.http_client()?, config.api_base_url.clone(), session))
    }

    /// Override the first 429 backoff delay; later delays double.
    pub fn with_rate_limit_backoff(mut self, backoff: Duration) -> Self {
        self.rate_limit_backoff = backoff;
        self
    }

    pub fn session(&self) -> &SessionManager {
        &self.session
    }

    /// Send a request and return the successful response.
    ///
    /// A 401 marks the identity token that was sent stale and the request is
    /// retried once with a refreshed token. A second 401 ends the session.
    pub async fn send(&self, request: &ApiRequest) -> Result<reqwest::Response, ApiError> {
        let mut attempt = Attempt::Initial;
        loop {
            let (headers, sent_identity) = self.credential_headers(request.auth).await?;
            let response = self.dispatch(request, headers).await?;

            let sent_identity = match sent_identity {
                Some(token) if response.status() == StatusCode::UNAUTHORIZED => token,
                _ => return Self::check_response(response).await,
            };

            match attempt {
                Attempt::Initial => {
                    debug!(path = %request.path, "Request rejected with 401, refreshing identity");
                    // A concurrent request may already have replaced the token
                    self.session
                        .invalidate_token(CredentialKind::Identity, &sent_identity);
                    attempt = Attempt::AfterRefresh;
                }
                Attempt::AfterRefresh => {
                    warn!(
                        path = %request.path,
                        "Request rejected again after refresh, ending session"
                    );
                    self.end_session().await;
                    return Err(ApiError::Unauthenticated);
                }
            }
        }
    }

    pub async fn send_json<T: DeserializeOwned>(
        &self,
        request: &ApiRequest,
    ) -> Result<T, ApiError> {
        let response = self.send(request).await?;
        response.json().await.map_err(|e| {
            warn!(path = %request.path, error = %e, "Failed to parse JSON response");
            ApiError::InvalidResponse(format!(
                "Failed to parse JSON response from {}: {}",
                request.path, e
            ))
        })
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        self.send_json(&ApiRequest::get(path)).await
    }

    /// Fetch the signed-in doctor's profile.
    pub async fn fetch_profile(&self) -> Result<DoctorProfile, ApiError> {
        self.get_json("/doctors/me").await
    }

    /// Fetch the profile and record its authorization flags in the session.
    pub async fn sync_profile(&self) -> Result<DoctorProfile, ApiError> {
        let profile = self.fetch_profile().await?;
        self.session
            .set_session(profile.session_update())
            .await
            .map_err(|e| self.map_required_failure(e))?;
        debug!(doctor_id = %profile.id, is_admin = profile.is_admin, "Profile synced");
        Ok(profile)
    }

    /// Headers for `auth`, plus the identity token they carry.
    async fn credential_headers(
        &self,
        auth: AuthRequirements,
    ) -> Result<(HeaderMap, Option<String>), ApiError> {
        let mut headers = HeaderMap::new();
        if !auth.identity {
            return Ok((headers, None));
        }
        if !self.session.is_logged_in() {
            return Err(ApiError::Unauthenticated);
        }

        let identity = match self.session.ensure_fresh(CredentialKind::Identity).await {
            Ok(credential) => credential,
            Err(e) => {
                let error = self.map_required_failure(e);
                if error.requires_sign_in() {
                    self.end_session().await;
                }
                return Err(error);
            }
        };
        headers.insert(AUTHORIZATION, Self::header_value(&identity)?);

        let session = self.session.session();
        if session.calendar_delegation.is_some()
            && !session.degraded.contains(&CredentialKind::CalendarDelegation)
        {
            self.attach_optional(
                &mut headers,
                CredentialKind::CalendarDelegation,
                CALENDAR_AUTH_HEADER,
            )
            .await?;
        }
        if auth.conferencing && session.conferencing.is_some() {
            self.attach_optional(
                &mut headers,
                CredentialKind::Conferencing,
                CONFERENCING_AUTH_HEADER,
            )
            .await?;
        }

        // An optional refresh can end the session, e.g. identity revoked
        // during the calendar exchange
        if !self.session.is_logged_in() {
            return Err(ApiError::Unauthenticated);
        }
        Ok((headers, Some(identity.token)))
    }

    async fn attach_optional(
        &self,
        headers: &mut HeaderMap,
        kind: CredentialKind,
        header: &'static str,
    ) -> Result<(), ApiError> {
        match self.session.ensure_fresh(kind).await {
            Ok(credential) => {
                headers.insert(HeaderName::from_static(header), Self::header_value(&credential)?);
            }
            Err(e) => {
                debug!(kind = %kind, error = %e, "Sending request without optional credential")
            }
        }
        Ok(())
    }

    /// Conferencing tokens go out raw, the identity family as `Bearer`.
    /// Every credential header is marked sensitive.
    fn header_value(credential: &Credential) -> Result<HeaderValue, ApiError> {
        let mut value = match credential.kind {
            CredentialKind::Conferencing => HeaderValue::from_str(&credential.token),
            _ => HeaderValue::from_str(&credential.bearer()),
        }
        .map_err(|_| Self::unusable_token(credential.kind))?;
        value.set_sensitive(true);
        Ok(value)
    }

    fn unusable_token(kind: CredentialKind) -> ApiError {
        ApiError::Credential(AuthError::MalformedResponse(format!(
            "{} token is not a valid header value",
            kind
        )))
    }

    fn map_required_failure(&self, error: AuthError) -> ApiError {
        match error {
            AuthError::Unauthenticated | AuthError::Superseded => ApiError::Unauthenticated,
            e if e.is_terminal() => ApiError::Unauthenticated,
            AuthError::Network(msg) | AuthError::MalformedResponse(msg) => {
                ApiError::NetworkUnavailable(msg)
            }
            other => ApiError::Credential(other),
        }
    }

    async fn end_session(&self) {
        if let Err(e) = self.session.logout().await {
            warn!(error = %e, "Failed to clear stored session");
        }
    }

    /// Dispatch with exponential backoff on 429. Transport failures never
    /// touch credential state.
    async fn dispatch(
        &self,
        request: &ApiRequest,
        headers: HeaderMap,
    ) -> Result<reqwest::Response, ApiError> {
        let url = join_url(&self.base_url, &request.path);
        let mut retries = 0;
        let mut backoff = self.rate_limit_backoff;

        loop {
            let mut builder = self
                .client
                .request(request.method.clone(), &url)
                .headers(headers.clone());
            if let Some(ref body) = request.body {
                builder = builder.json(body);
            }

            let response = builder.send().await.map_err(|e| {
                warn!(url = %url, error = %e, "Request failed before a response arrived");
                ApiError::NetworkUnavailable(e.to_string())
            })?;

            if response.status() != StatusCode::TOO_MANY_REQUESTS {
                return Ok(response);
            }

            retries += 1;
            if retries > MAX_RATE_LIMIT_RETRIES {
                return Err(ApiError::RateLimited);
            }
            warn!(
                url = %url,
                retry = retries,
                backoff_ms = backoff.as_millis() as u64,
                "Rate limited, backing off"
            );
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }

    /// Check if response is successful, returning an error with body if not.
    async fn check_response(response: reqwest::Response) -> Result<reqwest::Response, ApiError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            Err(ApiError::from_status(status, &body))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::session::tests::{credential, harness, harness_with, FakeAdapter, Harness};
    use crate::auth::{CredentialStore, Session};
    use chrono::Duration as ChronoDuration;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fresh(kind: CredentialKind, token: &str) -> Credential {
        credential(kind, token, Some(ChronoDuration::hours(1)))
    }

    fn client(server: &MockServer, h: &Harness) -> ApiClient {
        ApiClient::new(Client::new(), server.uri(), h.manager.clone())
            .with_rate_limit_backoff(Duration::from_millis(1))
    }

    fn profile_body() -> serde_json::Value {
        serde_json::json!({"id": "doc-1", "name": "Dr. Ada Park", "isAdmin": true})
    }

    #[tokio::test]
    async fn test_attaches_identity_and_calendar_headers() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doctors/me"))
            .and(header("authorization", "Bearer id-token"))
            .and(header(CALENDAR_AUTH_HEADER, "Bearer cal-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(profile_body()))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&[
            fresh(CredentialKind::Identity, "id-token"),
            fresh(CredentialKind::CalendarDelegation, "cal-token"),
            fresh(CredentialKind::Conferencing, "conf-token"),
        ])
        .await;
        client(&server, &h).fetch_profile().await.unwrap();

        let requests = server.received_requests().await.unwrap();
        // Conferencing only goes to endpoints that ask for it
        assert!(requests[0].headers.get(CONFERENCING_AUTH_HEADER).is_none());
    }

    #[tokio::test]
    async fn test_conferencing_header_on_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/appointments/a1/meeting"))
            .and(header(CONFERENCING_AUTH_HEADER, "conf-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&[
            fresh(CredentialKind::Identity, "id-token"),
            fresh(CredentialKind::Conferencing, "conf-token"),
        ])
        .await;
        let request = ApiRequest::post("/appointments/a1/meeting")
            .auth(AuthRequirements::with_conferencing());
        let _: serde_json::Value = client(&server, &h).send_json(&request).await.unwrap();
    }

    #[tokio::test]
    async fn test_single_401_is_retried_with_fresh_token() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doctors/me"))
            .and(header("authorization", "Bearer id-token"))
            .respond_with(ResponseTemplate::new(401))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/doctors/me"))
            .and(header("authorization", "Bearer identity-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(profile_body()))
            .expect(1)
            .mount(&server)
            .await;

        let h = harness(&[fresh(CredentialKind::Identity, "id-token")]).await;
        let profile = client(&server, &h).fetch_profile().await.unwrap();

        assert_eq!(profile.id, "doc-1");
        assert_eq!(h.identity.calls(), 1);
        assert!(h.manager.is_logged_in());
    }

    #[tokio::test]
    async fn test_late_401_for_replaced_token_does_not_refresh_again() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doctors/me"))
            .and(header("authorization", "Bearer id-token"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        // The second rejection of the old token lands after the first
        // request has already refreshed
        Mock::given(method("GET"))
            .and(path("/doctors/me"))
            .and(header("authorization", "Bearer id-token"))
            .respond_with(ResponseTemplate::new(401).set_delay(Duration::from_millis(300)))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/doctors/me"))
            .and(header("authorization", "Bearer identity-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(profile_body()))
            .expect(2)
            .mount(&server)
            .await;

        let h = harness(&[fresh(CredentialKind::Identity, "id-token")]).await;
        let api = client(&server, &h);
        let (first, second) = tokio::join!(api.fetch_profile(), api.fetch_profile());

        assert!(first.is_ok());
        assert!(second.is_ok());
        assert_eq!(h.identity.calls(), 1);
        assert_eq!(
            h.manager.session().identity.map(|c| c.token),
            Some("identity-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_second_401_logs_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doctors/me"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let h = harness(&[
            fresh(CredentialKind::Identity, "id-token"),
            fresh(CredentialKind::CalendarDelegation, "cal-token"),
        ])
        .await;
        let err = client(&server, &h).fetch_profile().await.unwrap_err();

        assert_eq!(err, ApiError::Unauthenticated);
        assert!(err.requires_sign_in());
        assert_eq!(h.manager.session(), Session::default());
        assert_eq!(h.store.read_credential(CredentialKind::Identity).await, None);
    }

    #[tokio::test]
    async fn test_terminal_identity_aborts_before_dispatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let identity = FakeAdapter::new(CredentialKind::Identity)
            .then(Err(AuthError::ReauthRequired(CredentialKind::Identity)));
        let stale = credential(CredentialKind::Identity, "old", Some(ChronoDuration::minutes(1)));
        let h = harness_with(
            CredentialStore::memory(),
            identity,
            FakeAdapter::new(CredentialKind::CalendarDelegation),
            FakeAdapter::new(CredentialKind::Conferencing),
            &[stale],
        )
        .await;

        let err = client(&server, &h).fetch_profile().await.unwrap_err();
        assert_eq!(err, ApiError::Unauthenticated);
        assert!(!h.manager.is_logged_in());
    }

    #[tokio::test]
    async fn test_identity_revoked_during_calendar_refresh_aborts_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(profile_body()))
            .expect(0)
            .mount(&server)
            .await;

        let calendar = FakeAdapter::new(CredentialKind::CalendarDelegation)
            .then(Err(AuthError::ReauthRequired(CredentialKind::Identity)));
        let stale_calendar = credential(
            CredentialKind::CalendarDelegation,
            "cal-old",
            Some(ChronoDuration::minutes(1)),
        );
        let h = harness_with(
            CredentialStore::memory(),
            FakeAdapter::new(CredentialKind::Identity),
            calendar,
            FakeAdapter::new(CredentialKind::Conferencing),
            &[fresh(CredentialKind::Identity, "id-token"), stale_calendar],
        )
        .await;

        let err = client(&server, &h).fetch_profile().await.unwrap_err();
        assert_eq!(err, ApiError::Unauthenticated);
        assert!(!h.manager.is_logged_in());
        assert_eq!(h.calendar.calls(), 1);
        assert_eq!(h.store.read_credential(CredentialKind::Identity).await, None);
    }

    #[test]
    fn test_credential_headers_are_sensitive() {
        let identity = fresh(CredentialKind::Identity, "id-token");
        let calendar = fresh(CredentialKind::CalendarDelegation, "cal-token");
        let conferencing = fresh(CredentialKind::Conferencing, "conf-token");

        let value = ApiClient::header_value(&identity).unwrap();
        assert!(value.is_sensitive());
        assert_eq!(value, "Bearer id-token");

        let value = ApiClient::header_value(&calendar).unwrap();
        assert!(value.is_sensitive());
        assert_eq!(value, "Bearer cal-token");

        let value = ApiClient::header_value(&conferencing).unwrap();
        assert!(value.is_sensitive());
        assert_eq!(value, "conf-token");
    }

    #[tokio::test]
    async fn test_signed_out_request_is_not_sent() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let h = harness(&[]).await;
        let err = client(&server, &h).fetch_profile().await.unwrap_err();
        assert_eq!(err, ApiError::Unauthenticated);
        assert_eq!(h.identity.calls(), 0);
    }

    #[tokio::test]
    async fn test_public_request_carries_no_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/status"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .mount(&server)
            .await;

        let h = harness(&[]).await;
        let request = ApiRequest::get("/status").auth(AuthRequirements::public());
        let _: serde_json::Value = client(&server, &h).send_json(&request).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        assert!(requests[0].headers.get("authorization").is_none());
    }

    #[tokio::test]
    async fn test_unreachable_server_keeps_session() {
        let h = harness(&[fresh(CredentialKind::Identity, "id-token")]).await;
        // Nothing listens on the discard port
        let api = ApiClient::new(Client::new(), "http://127.0.0.1:9", h.manager.clone());

        let err = api.fetch_profile().await.unwrap_err();
        assert!(err.is_network());
        assert_eq!(
            h.manager.session().identity.map(|c| c.token),
            Some("id-token".to_string())
        );
    }

    #[tokio::test]
    async fn test_identity_refresh_network_failure_is_network_unavailable() {
        let identity = FakeAdapter::new(CredentialKind::Identity)
            .then(Err(AuthError::Network("offline".into())));
        let stale = credential(CredentialKind::Identity, "old", Some(ChronoDuration::minutes(1)));
        let h = harness_with(
            CredentialStore::memory(),
            identity,
            FakeAdapter::new(CredentialKind::CalendarDelegation),
            FakeAdapter::new(CredentialKind::Conferencing),
            &[stale],
        )
        .await;
        let server = MockServer::start().await;

        let err = client(&server, &h).fetch_profile().await.unwrap_err();
        assert_eq!(err, ApiError::NetworkUnavailable("offline".into()));
        assert!(h.manager.is_logged_in());
    }

    #[tokio::test]
    async fn test_rate_limit_backs_off_then_succeeds() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doctors/me"))
            .respond_with(ResponseTemplate::new(429))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/doctors/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(profile_body()))
            .mount(&server)
            .await;

        let h = harness(&[fresh(CredentialKind::Identity, "id-token")]).await;
        assert!(client(&server, &h).fetch_profile().await.is_ok());
        assert_eq!(server.received_requests().await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_rate_limit_gives_up() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(4)
            .mount(&server)
            .await;

        let h = harness(&[fresh(CredentialKind::Identity, "id-token")]).await;
        let err = client(&server, &h).fetch_profile().await.unwrap_err();
        assert_eq!(err, ApiError::RateLimited);
        assert!(h.manager.is_logged_in());
    }

    #[tokio::test]
    async fn test_sync_profile_updates_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/doctors/me"))
            .respond_with(ResponseTemplate::new(200).set_body_json(profile_body()))
            .mount(&server)
            .await;

        let h = harness(&[fresh(CredentialKind::Identity, "id-token")]).await;
        client(&server, &h).sync_profile().await.unwrap();

        let session = h.manager.session();
        assert!(session.is_admin);
        assert_eq!(session.doctor_id.as_deref(), Some("doc-1"));
    }

    #[tokio::test]
    async fn test_server_error_leaves_session() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(503).set_body_string("maintenance"))
            .mount(&server)
            .await;

        let h = harness(&[fresh(CredentialKind::Identity, "id-token")]).await;
        let err = client(&server, &h).fetch_profile().await.unwrap_err();
        assert_eq!(err, ApiError::ServerError("maintenance".into()));
        assert!(h.manager.is_logged_in());
    }
}
