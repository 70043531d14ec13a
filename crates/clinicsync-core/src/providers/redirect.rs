//! Single-shot delivery of redirect callbacks.
//!
//! The app's URL-scheme handler hands every incoming callback URL to
//! `RedirectBroker::deliver`. At most one flow waits at a time and each flow
//! resolves exactly once.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;
use url::Url;

use crate::auth::AuthError;

/// Opens the provider's authorization page (system browser, in-app tab).
#[async_trait]
pub trait RedirectLauncher: Send + Sync {
    async fn open(&self, url: &Url) -> Result<(), AuthError>;
}

type Outcome = Result<Url, AuthError>;

#[derive(Clone, Default)]
pub struct RedirectBroker {
    pending: Arc<Mutex<Option<oneshot::Sender<Outcome>>>>,
}

impl RedirectBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for a callback. Any flow already waiting is cancelled.
    pub fn register(&self) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let previous = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(tx);
        if let Some(previous) = previous {
            debug!("Superseding pending redirect flow");
            let _ = previous.send(Err(AuthError::UserCancelled));
        }
        rx
    }

    /// Resolve the waiting flow with a callback URL. Returns false when no
    /// flow was waiting.
    pub fn deliver(&self, url: Url) -> bool {
        self.resolve(Ok(url))
    }

    /// The user closed the authorization page.
    pub fn cancel(&self) -> bool {
        self.resolve(Err(AuthError::UserCancelled))
    }

    pub fn is_pending(&self) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|tx| !tx.is_closed())
    }

    fn resolve(&self, outcome: Outcome) -> bool {
        let sender = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }
}
