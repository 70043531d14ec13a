//! Session management.
//!
//! `SessionManager` is the single owner of the signed-in doctor's
//! credentials. It is a cheap-to-clone handle: create it once at app start
//! with [`SessionManager::init`], pass clones to whoever needs credentials,
//! and call [`SessionManager::teardown`] at process exit.
//!
//! At most one refresh per credential kind is in flight; concurrent callers
//! await that one refresh and all observe the same outcome. Logout bumps the
//! session generation so refreshes that finish afterwards are discarded.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::store::{ADMIN_FLAG_KEY, DOCTOR_ID_KEY, SESSION_KEYS};
use super::{
    AuthError, Credential, CredentialKind, CredentialStore, ExpiryPolicy, Freshness, StorageError,
};
use crate::config::Config;
use crate::providers::ProviderAdapter;

/// Whether a credential operation may put UI in front of the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interaction {
    Allowed,
    Forbidden,
}

/// One adapter per credential kind.
#[derive(Clone)]
pub struct ProviderSet {
    pub identity: Arc<dyn ProviderAdapter>,
    pub calendar_delegation: Arc<dyn ProviderAdapter>,
    pub conferencing: Arc<dyn ProviderAdapter>,
}

impl ProviderSet {
    pub fn get(&self, kind: CredentialKind) -> &Arc<dyn ProviderAdapter> {
        match kind {
            CredentialKind::Identity => &self.identity,
            CredentialKind::CalendarDelegation => &self.calendar_delegation,
            CredentialKind::Conferencing => &self.conferencing,
        }
    }
}

/// Timing knobs for the manager.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
    pub policy: ExpiryPolicy,
    /// Bound on silent refreshes.
    pub request_timeout: Duration,
    /// Bound on flows that wait for the user.
    pub interactive_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self::from(&Config::default())
    }
}

impl From<&Config> for SessionOptions {
    fn from(config: &Config) -> Self {
        Self {
            policy: ExpiryPolicy::default(),
            request_timeout: config.request_timeout(),
            interactive_timeout: config.interactive_timeout(),
        }
    }
}

/// Read-only snapshot of the current session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub identity: Option<Credential>,
    pub calendar_delegation: Option<Credential>,
    pub conferencing: Option<Credential>,
    pub is_admin: bool,
    pub doctor_id: Option<String>,
    /// Features disabled after their credential failed terminally.
    pub degraded: BTreeSet<CredentialKind>,
    /// Persistence failed; credentials live in memory only.
    pub storage_degraded: bool,
}

impl Session {
    /// Logged in exactly when an identity credential is held, fresh or not.
    pub fn is_logged_in(&self) -> bool {
        self.identity.is_some()
    }

    pub fn credential(&self, kind: CredentialKind) -> Option<&Credential> {
        match kind {
            CredentialKind::Identity => self.identity.as_ref(),
            CredentialKind::CalendarDelegation => self.calendar_delegation.as_ref(),
            CredentialKind::Conferencing => self.conferencing.as_ref(),
        }
    }

    fn slot_mut(&mut self, kind: CredentialKind) -> &mut Option<Credential> {
        match kind {
            CredentialKind::Identity => &mut self.identity,
            CredentialKind::CalendarDelegation => &mut self.calendar_delegation,
            CredentialKind::Conferencing => &mut self.conferencing,
        }
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            is_logged_in: self.is_logged_in(),
            is_admin: self.is_admin,
            doctor_id: self.doctor_id.clone(),
            calendar_sync_available: self.calendar_delegation.is_some()
                && !self.degraded.contains(&CredentialKind::CalendarDelegation),
            conferencing_linked: self.conferencing.is_some(),
            storage_degraded: self.storage_degraded,
        }
    }
}

/// Token-free view of the session for the UI layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct SessionStatus {
    pub is_logged_in: bool,
    pub is_admin: bool,
    pub doctor_id: Option<String>,
    pub calendar_sync_available: bool,
    pub conferencing_linked: bool,
    pub storage_degraded: bool,
}

/// Partial update of the authorization flags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionUpdate {
    pub is_admin: Option<bool>,
    pub doctor_id: Option<String>,
}

#[derive(Default)]
struct SessionState {
    session: Session,
    /// Kinds the server rejected even though their clock-based expiry had
    /// not passed.
    forced_stale: BTreeSet<CredentialKind>,
    generation: u64,
}

type RefreshFuture = Shared<BoxFuture<'static, Result<Credential, AuthError>>>;

struct Flight {
    id: u64,
    future: RefreshFuture,
}

struct Inner {
    store: CredentialStore,
    providers: ProviderSet,
    options: SessionOptions,
    state: Mutex<SessionState>,
    flights: Mutex<HashMap<CredentialKind, Flight>>,
    next_flight: AtomicU64,
    snapshots: watch::Sender<Session>,
}

impl Inner {
    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_flights(&self) -> MutexGuard<'_, HashMap<CredentialKind, Flight>> {
        self.flights.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, state: &SessionState) {
        self.snapshots.send_replace(state.session.clone());
    }
}

#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    /// Create a manager with an empty session.
    pub fn new(store: CredentialStore, providers: ProviderSet, options: SessionOptions) -> Self {
        let (snapshots, _) = watch::channel(Session::default());
        Self {
            inner: Arc::new(Inner {
                store,
                providers,
                options,
                state: Mutex::new(SessionState::default()),
                flights: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                snapshots,
            }),
        }
    }

    /// Create a manager and restore the persisted session.
    pub async fn init(
        store: CredentialStore,
        providers: ProviderSet,
        options: SessionOptions,
    ) -> Self {
        let manager = Self::new(store, providers, options);
        manager.restore().await;
        manager
    }

    /// Load persisted credentials and flags into memory.
    pub async fn restore(&self) {
        let store = &self.inner.store;
        let mut loaded = Session::default();
        for kind in CredentialKind::ALL {
            *loaded.slot_mut(kind) = store.read_credential(kind).await;
        }
        loaded.is_admin = store.read(ADMIN_FLAG_KEY).await.as_deref() == Some("true");
        loaded.doctor_id = store.read(DOCTOR_ID_KEY).await;

        if !loaded.is_logged_in() && loaded != Session::default() {
            debug!("Dropping persisted state left without an identity credential");
            if let Err(e) = store.clear_all(&SESSION_KEYS).await {
                warn!(error = %e, "Failed to clear orphaned session state");
            }
            loaded = Session::default();
        }

        let mut state = self.inner.lock_state();
        info!(logged_in = loaded.is_logged_in(), "Session restored");
        state.session = loaded;
        state.forced_stale.clear();
        self.inner.publish(&state);
    }

    /// Drop in-flight refresh handles at process exit. Persisted state is
    /// left alone.
    pub fn teardown(&self) {
        self.inner.lock_flights().clear();
        debug!("Session manager torn down");
    }

    pub fn session(&self) -> Session {
        self.inner.lock_state().session.clone()
    }

    pub fn is_logged_in(&self) -> bool {
        self.inner.lock_state().session.is_logged_in()
    }

    pub fn subscribe(&self) -> watch::Receiver<Session> {
        self.inner.snapshots.subscribe()
    }

    /// Interactive sign-in, followed by a best-effort calendar delegation.
    pub async fn sign_in(&self) -> Result<Session, AuthError> {
        self.ensure_fresh_with(CredentialKind::Identity, Interaction::Allowed)
            .await?;
        info!("Signed in");

        if let Err(e) = self.ensure_fresh(CredentialKind::CalendarDelegation).await {
            warn!(error = %e, "Calendar delegation unavailable after sign-in");
        }
        Ok(self.session())
    }

    /// Run the interactive conferencing authorization if no usable
    /// conferencing credential is held.
    pub async fn link_conferencing(&self) -> Result<Credential, AuthError> {
        self.ensure_fresh_with(CredentialKind::Conferencing, Interaction::Allowed)
            .await
    }

    /// Return a usable credential, refreshing it first if needed. Never
    /// shows UI.
    pub fn ensure_fresh(
        &self,
        kind: CredentialKind,
    ) -> BoxFuture<'static, Result<Credential, AuthError>> {
        self.ensure_fresh_with(kind, Interaction::Forbidden)
    }

    pub fn ensure_fresh_with(
        &self,
        kind: CredentialKind,
        interaction: Interaction,
    ) -> BoxFuture<'static, Result<Credential, AuthError>> {
        let this = self.clone();
        async move { this.resolve(kind, interaction).await }.boxed()
    }

    /// Mark a credential stale regardless of its own expiry.
    pub fn invalidate(&self, kind: CredentialKind) {
        let mut state = self.inner.lock_state();
        if state.session.credential(kind).is_some() {
            debug!(kind = %kind, "Credential invalidated");
            state.forced_stale.insert(kind);
        }
    }

    /// Mark a credential stale only if `token` is still the one held. A
    /// rejection of a token that has since been replaced changes nothing.
    pub fn invalidate_token(&self, kind: CredentialKind, token: &str) -> bool {
        let mut state = self.inner.lock_state();
        match state.session.credential(kind) {
            Some(current) if current.token == token => {
                debug!(kind = %kind, "Credential invalidated");
                state.forced_stale.insert(kind);
                true
            }
            Some(_) => {
                debug!(kind = %kind, "Rejected token was already replaced");
                false
            }
            None => false,
        }
    }

    /// Update authorization flags. Requires a signed-in session.
    pub async fn set_session(&self, update: SessionUpdate) -> Result<(), AuthError> {
        {
            let mut state = self.inner.lock_state();
            if !state.session.is_logged_in() {
                return Err(AuthError::Unauthenticated);
            }
            if let Some(is_admin) = update.is_admin {
                state.session.is_admin = is_admin;
            }
            if let Some(ref doctor_id) = update.doctor_id {
                state.session.doctor_id = Some(doctor_id.clone());
            }
            self.inner.publish(&state);
        }

        let store = &self.inner.store;
        let mut result = Ok(());
        if let Some(is_admin) = update.is_admin {
            let flag = if is_admin { "true" } else { "false" };
            result = result.and(store.write(ADMIN_FLAG_KEY, flag).await);
        }
        if let Some(ref doctor_id) = update.doctor_id {
            result = result.and(store.write(DOCTOR_ID_KEY, doctor_id).await);
        }
        if let Err(e) = result {
            self.mark_storage_degraded(&e);
        }
        Ok(())
    }

    /// Clear the session in memory and in the store. In-flight refreshes are
    /// released without waiting; their results will be discarded.
    pub async fn logout(&self) -> Result<(), StorageError> {
        {
            let mut state = self.inner.lock_state();
            state.generation += 1;
            state.session = Session::default();
            state.forced_stale.clear();
            self.inner.publish(&state);
        }
        self.inner.lock_flights().clear();
        info!("Logged out");

        self.inner.store.clear_all(&SESSION_KEYS).await
    }

    fn generation(&self) -> u64 {
        self.inner.lock_state().generation
    }

    fn mark_storage_degraded(&self, error: &StorageError) {
        warn!(error = %error, "Failed to persist session state; continuing in memory only");
        let mut state = self.inner.lock_state();
        state.session.storage_degraded = true;
        self.inner.publish(&state);
    }

    async fn resolve(
        self,
        kind: CredentialKind,
        interaction: Interaction,
    ) -> Result<Credential, AuthError> {
        let (existing, generation) = {
            let state = self.inner.lock_state();
            let current = state.session.credential(kind).cloned();
            let freshness = if state.forced_stale.contains(&kind) {
                Freshness::Stale
            } else {
                self.inner.options.policy.classify(kind, current.as_ref(), Utc::now())
            };
            match (current, freshness) {
                (Some(credential), Freshness::Fresh) => return Ok(credential),
                (current, _) => (current, state.generation),
            }
        };

        let (flight_id, future) = {
            let mut flights = self.inner.lock_flights();
            match flights.get(&kind) {
                Some(flight) => {
                    debug!(kind = %kind, "Joining in-flight refresh");
                    (flight.id, flight.future.clone())
                }
                None => {
                    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let future = self
                        .clone()
                        .refresh(kind, existing, interaction, generation)
                        .boxed()
                        .shared();
                    flights.insert(
                        kind,
                        Flight {
                            id,
                            future: future.clone(),
                        },
                    );
                    (id, future)
                }
            }
        };

        let outcome = future.await;

        let mut flights = self.inner.lock_flights();
        if flights.get(&kind).is_some_and(|flight| flight.id == flight_id) {
            flights.remove(&kind);
        }
        outcome
    }

    async fn refresh(
        self,
        kind: CredentialKind,
        existing: Option<Credential>,
        interaction: Interaction,
        generation: u64,
    ) -> Result<Credential, AuthError> {
        if kind != CredentialKind::Identity && !self.is_logged_in() {
            return Err(AuthError::Unauthenticated);
        }
        if kind == CredentialKind::CalendarDelegation {
            // The exchange needs a server-auth-code from a live identity session
            self.ensure_fresh_with(CredentialKind::Identity, interaction)
                .await?;
        }

        let adapter = Arc::clone(self.inner.providers.get(kind));
        let interactive = interaction == Interaction::Allowed;
        debug!(
            kind = %kind,
            has_existing = existing.is_some(),
            interactive,
            "Refreshing credential"
        );

        let result = match existing {
            Some(_) if adapter.refresh_is_interactive() && !interactive => {
                Err(AuthError::InteractionRequired(kind))
            }
            Some(ref current) => {
                self.bounded(kind, adapter.refresh_is_interactive(), adapter.refresh(current))
                    .await
            }
            None => self.bounded(kind, interactive, adapter.acquire(interactive)).await,
        };

        match result {
            Ok(credential) => self.commit(credential, generation).await,
            Err(err) => {
                self.handle_failure(kind, &err, generation).await;
                Err(err)
            }
        }
    }

    async fn bounded<F>(
        &self,
        kind: CredentialKind,
        interactive: bool,
        op: F,
    ) -> Result<Credential, AuthError>
    where
        F: Future<Output = Result<Credential, AuthError>>,
    {
        let limit = if interactive {
            self.inner.options.interactive_timeout
        } else {
            self.inner.options.request_timeout
        };
        match tokio::time::timeout(limit, op).await {
            Ok(result) => result,
            Err(_) if interactive => {
                warn!(kind = %kind, "Interactive flow not completed in time");
                Err(AuthError::UserCancelled)
            }
            Err(_) => {
                warn!(kind = %kind, timeout_secs = limit.as_secs(), "Credential refresh timed out");
                Err(AuthError::Network(format!(
                    "{} refresh timed out after {}s",
                    kind,
                    limit.as_secs()
                )))
            }
        }
    }

    async fn commit(
        &self,
        credential: Credential,
        generation: u64,
    ) -> Result<Credential, AuthError> {
        let kind = credential.kind;
        {
            let mut state = self.inner.lock_state();
            if state.generation != generation {
                debug!(kind = %kind, "Discarding refresh result from an ended session");
                return Err(AuthError::Superseded);
            }
            *state.session.slot_mut(kind) = Some(credential.clone());
            state.session.degraded.remove(&kind);
            state.forced_stale.remove(&kind);
            self.inner.publish(&state);
        }

        if let Err(e) = self.inner.store.write_credential(&credential).await {
            self.mark_storage_degraded(&e);
        }

        if self.generation() != generation {
            // Logout ran during the write
            if let Err(e) = self.inner.store.remove_credential(kind).await {
                warn!(kind = %kind, error = %e, "Failed to remove credential written after logout");
            }
            return Err(AuthError::Superseded);
        }

        debug!(kind = %kind, "Credential stored");
        Ok(credential)
    }

    async fn handle_failure(&self, kind: CredentialKind, error: &AuthError, generation: u64) {
        if self.generation() != generation {
            return;
        }

        match error {
            AuthError::ReauthRequired(CredentialKind::Identity)
            | AuthError::ConsentRevoked(CredentialKind::Identity) => {
                warn!(error = %error, "Identity credential is no longer valid, ending session");
                if let Err(e) = self.logout().await {
                    warn!(error = %e, "Failed to clear stored session");
                }
            }
            AuthError::ReauthRequired(revoked) | AuthError::ConsentRevoked(revoked) => {
                let revoked = *revoked;
                warn!(kind = %revoked, error = %error, "Credential revoked; feature disabled");
                {
                    let mut state = self.inner.lock_state();
                    *state.session.slot_mut(revoked) = None;
                    state.session.degraded.insert(revoked);
                    state.forced_stale.remove(&revoked);
                    self.inner.publish(&state);
                }
                if let Err(e) = self.inner.store.remove_credential(revoked).await {
                    warn!(kind = %revoked, error = %e, "Failed to remove revoked credential");
                }
            }
            AuthError::DelegationUnavailable => {
                let mut state = self.inner.lock_state();
                state.session.degraded.insert(kind);
                self.inner.publish(&state);
            }
            _ => {
                debug!(kind = %kind, error = %error, "Refresh failed; keeping current credential");
            }
        }
    }
}
