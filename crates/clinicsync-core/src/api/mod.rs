//! REST client for the clinic scheduling backend.
//!
//! Every outbound request goes through `ApiClient`, which attaches the
//! session's credentials, retries once after a 401 with a refreshed identity
//! token and ends the session if the server still refuses it.

pub mod client;
pub mod error;

pub use client::{ApiClient, ApiRequest, AuthRequirements};
pub use error::ApiError;
