//! Auth provider boundary.
//!
//! The provider owns the session. Consumers read it with
//! [`AuthProvider::current_session`] and follow changes through a
//! [`Subscription`], which stops delivery as soon as it is dropped.

use async_trait::async_trait;
use futures::Stream;
use reqwest::Url;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;

use crate::model::Session;

pub mod gotrue;
pub mod model;

pub use gotrue::GoTrueClient;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("failed to reach auth provider: {0}")]
    Http(#[from] reqwest::Error),
    #[error("auth provider rejected the request ({status}): {message}")]
    Provider { status: u16, message: String },
    #[error("invalid sign-in redirect: {0}")]
    InvalidRedirect(String),
    #[error("no active session")]
    MissingSession,
    #[error("session file error: {0}")]
    SessionFile(#[from] std::io::Error),
    #[error("invalid auth provider payload: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Session change, in the order the provider emitted it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    SignedIn(Session),
    TokenRefreshed(Session),
    SignedOut,
}

impl SessionEvent {
    pub fn session(&self) -> Option<&Session> {
        match self {
            SessionEvent::SignedIn(s) | SessionEvent::TokenRefreshed(s) => Some(s),
            SessionEvent::SignedOut => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEvent::SignedIn(_) => "signed_in",
            SessionEvent::TokenRefreshed(_) => "token_refreshed",
            SessionEvent::SignedOut => "signed_out",
        }
    }
}

#[async_trait]
pub trait AuthProvider: Send + Sync {
    async fn current_session(&self) -> Result<Option<Session>, AuthError>;

    fn subscribe(&self) -> Subscription;

    /// Start federated sign-in. Returns the URL the user has to visit; the
    /// provider redirects back to `redirect_to` when done.
    async fn sign_in_with_oauth(&self, provider: &str, redirect_to: &Url)
        -> Result<Url, AuthError>;

    /// End the session. The local session is gone afterwards even when the
    /// provider call fails.
    async fn sign_out(&self) -> Result<(), AuthError>;
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    subscribers: Vec<(u64, mpsc::UnboundedSender<SessionEvent>)>,
}

/// Fan-out of session events to live subscriptions. Each subscription gets
/// its own unbounded queue so no event is dropped or merged.
#[derive(Clone, Default)]
pub struct SessionEvents {
    registry: Arc<Mutex<Registry>>,
}

impl SessionEvents {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn subscribe(&self) -> Subscription {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = {
            let mut reg = self.registry();
            reg.next_id += 1;
            let id = reg.next_id;
            reg.subscribers.push((id, tx));
            id
        };
        Subscription {
            id,
            rx,
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        let mut reg = self.registry();
        debug!(event = event.as_str(), subscribers = reg.subscribers.len(), "session event");
        reg.subscribers
            .retain(|(_, tx)| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        self.registry().subscribers.len()
    }
}

/// Live registration for session events. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::UnboundedReceiver<SessionEvent>,
    registry: Weak<Mutex<Registry>>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .subscribers
                .retain(|(id, _)| *id != self.id);
        }
    }
}

impl Stream for Subscription {
    type Item = SessionEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<SessionEvent>> {
        self.rx.poll_recv(cx)
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}
