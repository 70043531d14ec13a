//! Authentication module for managing credentials and the user session.
//!
//! This module provides:
//! - `Credential`: one bearer token with its expiry metadata
//! - `CredentialStore`: durable key-value persistence of credentials
//! - `ExpiryPolicy`: the single place deciding when a credential is stale
//! - `SessionManager`: single-flight refresh coordination and logout
//!
//! Identity tokens are refreshed five minutes before they expire; a
//! terminal identity failure ends the session.

pub mod credential;
pub mod error;
pub mod expiry;
pub mod session;
pub mod store;

pub use credential::{Credential, CredentialKind};
pub use error::{AuthError, StorageError};
pub use expiry::{ExpiryPolicy, Freshness};
pub use session::{
    Interaction, ProviderSet, Session, SessionManager, SessionOptions, SessionStatus, SessionUpdate,
};
pub use store::{CredentialStore, FileBackend, KeyringBackend, MemoryBackend, StorageBackend};
