use thiserror::Error;

use super::CredentialKind;

/// Outcome of a failed credential operation.
///
/// Cloneable so a single refresh result can be handed to every caller that
/// waited on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Sign-in was cancelled")]
    UserCancelled,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Malformed provider response: {0}")]
    MalformedResponse(String),

    #[error("Re-authentication required for {0}")]
    ReauthRequired(CredentialKind),

    #[error("Consent revoked for {0}")]
    ConsentRevoked(CredentialKind),

    #[error("{0} cannot be obtained without user interaction")]
    InteractionRequired(CredentialKind),

    #[error("Calendar delegation exchange returned no usable token")]
    DelegationUnavailable,

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Not signed in")]
    Unauthenticated,

    #[error("Session ended while the refresh was in flight")]
    Superseded,
}

impl AuthError {
    /// Terminal for the affected credential: it must be discarded.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AuthError::ReauthRequired(_) | AuthError::ConsentRevoked(_))
    }

    /// Transient failures a caller may retry without user involvement.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AuthError::Network(_) | AuthError::MalformedResponse(_))
    }

    pub(crate) fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_decode() {
            AuthError::MalformedResponse(err.to_string())
        } else {
            AuthError::Network(err.to_string())
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Storage backend rejected the operation: {0}")]
    Backend(String),

    #[error("Failed to serialize stored value: {0}")]
    Serialization(String),

    #[error("Failed to clear keys: {}", .0.join(", "))]
    Partial(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_errors() {
        assert!(AuthError::ReauthRequired(CredentialKind::Identity).is_terminal());
        assert!(AuthError::ConsentRevoked(CredentialKind::Conferencing).is_terminal());
        assert!(!AuthError::UserCancelled.is_terminal());
        assert!(!AuthError::Network("timeout".into()).is_terminal());
    }

    #[test]
    fn test_malformed_response_is_retryable() {
        assert!(AuthError::MalformedResponse("bad json".into()).is_retryable());
        assert!(AuthError::Network("reset".into()).is_retryable());
        assert!(!AuthError::UserCancelled.is_retryable());
        assert!(!AuthError::DelegationUnavailable.is_retryable());
    }

    #[test]
    fn test_partial_storage_error_lists_keys() {
        let err = StorageError::Partial(vec!["identity".into(), "doctor-id".into()]);
        assert_eq!(err.to_string(), "Failed to clear keys: identity, doctor-id");
    }
}
