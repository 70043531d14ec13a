//! Core library for clinicsync.
//!
//! Owns the credential lifecycle of the clinic scheduling client: three
//! bearer credentials (identity, calendar delegation, conferencing) are
//! acquired through their provider adapters, persisted in the credential
//! store, kept fresh by the session manager and attached to every outbound
//! request by the `ApiClient`.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod providers;

pub use api::{ApiClient, ApiError, ApiRequest, AuthRequirements};
pub use auth::{
    AuthError, Credential, CredentialKind, CredentialStore, ExpiryPolicy, Interaction, ProviderSet,
    Session, SessionManager, SessionOptions, SessionStatus, SessionUpdate, StorageError,
};
pub use config::Config;
