use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AuthError;

/// The three credential families a session can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub enum CredentialKind {
    /// Primary bearer token proving the doctor's identity to the backend.
    Identity,
    /// Server-minted token letting the backend act on the doctor's calendar.
    CalendarDelegation,
    /// Third-party token for creating and managing video sessions.
    Conferencing,
}

impl CredentialKind {
    pub const ALL: [CredentialKind; 3] = [
        CredentialKind::Identity,
        CredentialKind::CalendarDelegation,
        CredentialKind::Conferencing,
    ];

    /// Persisted record key. Must stay stable across releases.
    pub fn storage_key(self) -> &'static str {
        match self {
            CredentialKind::Identity => "identity",
            CredentialKind::CalendarDelegation => "calendar-delegation",
            CredentialKind::Conferencing => "conferencing",
        }
    }

    /// Only identity and calendar delegation carry a refresh token.
    pub fn supports_refresh_token(self) -> bool {
        !matches!(self, CredentialKind::Conferencing)
    }
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.storage_key())
    }
}

/// A bearer credential with its expiry metadata.
///
/// `expires_at` is either absent (lifetime unknown, treated as short-lived)
/// or strictly after `issued_at`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Credential {
    pub kind: CredentialKind,
    pub token: String,
    pub issued_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub refresh_token: Option<String>,
}

impl Credential {
    pub fn new(
        kind: CredentialKind,
        token: impl Into<String>,
        issued_at: DateTime<Utc>,
        expires_at: Option<DateTime<Utc>>,
        refresh_token: Option<String>,
    ) -> Result<Self, AuthError> {
        let token = token.into();
        if token.is_empty() {
            return Err(AuthError::MalformedResponse(format!("empty {} token", kind)));
        }
        if let Some(expires_at) = expires_at {
            if expires_at <= issued_at {
                return Err(AuthError::MalformedResponse(format!(
                    "{} token expires before it was issued",
                    kind
                )));
            }
        }
        let refresh_token = refresh_token.filter(|_| kind.supports_refresh_token());

        Ok(Self {
            kind,
            token,
            issued_at,
            expires_at,
            refresh_token,
        })
    }

    /// Build from a provider-reported lifetime in seconds. A zero or missing
    /// lifetime leaves the expiry unknown; one too large to represent is
    /// rejected.
    pub fn with_lifetime(
        kind: CredentialKind,
        token: impl Into<String>,
        issued_at: DateTime<Utc>,
        lifetime_secs: Option<u64>,
        refresh_token: Option<String>,
    ) -> Result<Self, AuthError> {
        let expires_at = match lifetime_secs.filter(|secs| *secs > 0) {
            Some(secs) => Some(
                i64::try_from(secs)
                    .ok()
                    .and_then(chrono::Duration::try_seconds)
                    .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
                    .ok_or_else(|| {
                        AuthError::MalformedResponse(format!(
                            "{} lifetime of {}s is out of range",
                            kind, secs
                        ))
                    })?,
            ),
            None => None,
        };
        Self::new(kind, token, issued_at, expires_at, refresh_token)
    }

    /// Header value for bearer-style attachment.
    pub fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("kind", &self.kind)
            .field("token", &"<redacted>")
            .field("issued_at", &self.issued_at)
            .field("expires_at", &self.expires_at)
            .field("has_refresh_token", &self.refresh_token.is_some())
            .finish()
    }
}
