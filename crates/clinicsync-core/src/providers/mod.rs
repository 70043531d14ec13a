//! Provider adapters for the three credential families.
//!
//! Every adapter exposes the same `acquire` / `refresh` capability and hands
//! back a fresh `Credential` value. Adapters never write to the credential
//! store; the session manager persists what they return.

pub mod calendar;
pub mod conferencing;
pub mod identity;
pub mod redirect;

pub use calendar::CalendarDelegationAdapter;
pub use conferencing::ConferencingAdapter;
pub use identity::{ConsentGrant, ConsentRequest, IdentityAdapter, IdentityPlatform};
pub use redirect::{RedirectBroker, RedirectLauncher};

use async_trait::async_trait;

use crate::auth::{AuthError, Credential, CredentialKind};

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    fn kind(&self) -> CredentialKind;

    /// Obtain a brand-new credential. With `interactive == false` the adapter
    /// may only use silent paths.
    async fn acquire(&self, interactive: bool) -> Result<Credential, AuthError>;

    /// Replace an existing credential.
    async fn refresh(&self, existing: &Credential) -> Result<Credential, AuthError>;

    /// Whether `refresh` needs the user in front of the screen.
    fn refresh_is_interactive(&self) -> bool {
        false
    }
}

/// Source of one-time server-auth-codes for the calendar delegation exchange.
#[async_trait]
pub trait AuthCodeSource: Send + Sync {
    async fn server_auth_code(&self) -> Result<String, AuthError>;
}
