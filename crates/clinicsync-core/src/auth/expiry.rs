use chrono::{DateTime, Duration, Utc};

use super::{Credential, CredentialKind};

/// Refresh identity-family tokens this long before they expire.
const IDENTITY_SAFETY_MARGIN_MINUTES: i64 = 5;

/// Conferencing expiry is observed through its own redirect flow, so no
/// proactive margin.
const CONFERENCING_SAFETY_MARGIN_MINUTES: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Freshness {
    Fresh,
    Stale,
    Absent,
}

/// True iff the expiry is known and `now` is before it by more than the
/// margin. Unknown expiry is never fresh.
pub fn is_fresh(credential: &Credential, now: DateTime<Utc>, safety_margin: Duration) -> bool {
    credential
        .expires_at
        .and_then(|expires_at| expires_at.checked_sub_signed(safety_margin))
        .map_or(false, |limit| now < limit)
}

/// True when the credential is absent or not fresh.
pub fn needs_refresh(
    credential: Option<&Credential>,
    now: DateTime<Utc>,
    safety_margin: Duration,
) -> bool {
    credential.map_or(true, |c| !is_fresh(c, now, safety_margin))
}

/// Per-kind safety margins. Every refresh timing decision goes through here.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpiryPolicy {
    pub identity_margin: Duration,
    pub calendar_margin: Duration,
    pub conferencing_margin: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self {
            identity_margin: Duration::minutes(IDENTITY_SAFETY_MARGIN_MINUTES),
            calendar_margin: Duration::minutes(IDENTITY_SAFETY_MARGIN_MINUTES),
            conferencing_margin: Duration::minutes(CONFERENCING_SAFETY_MARGIN_MINUTES),
        }
    }
}

impl ExpiryPolicy {
    pub fn margin(&self, kind: CredentialKind) -> Duration {
        match kind {
            CredentialKind::Identity => self.identity_margin,
            CredentialKind::CalendarDelegation => self.calendar_margin,
            CredentialKind::Conferencing => self.conferencing_margin,
        }
    }

    pub fn classify(
        &self,
        kind: CredentialKind,
        credential: Option<&Credential>,
        now: DateTime<Utc>,
    ) -> Freshness {
        match credential {
            None => Freshness::Absent,
            Some(_) if needs_refresh(credential, now, self.margin(kind)) => Freshness::Stale,
            Some(_) => Freshness::Fresh,
        }
    }
}
