//! Authorization gate.
//!
//! [`AuthContext`] answers two questions for the admin area: is someone signed
//! in, and are they on the admin allowlist. It is built once, started with
//! [`AuthContext::initialize`], and stopped with [`AuthContext::dispose`] (or
//! by dropping it).
//!
//! ```text
//! Resolving ──initial check / first event──▶ Anonymous
//!                                        ├──▶ AuthenticatedNonAdmin
//!                                        └──▶ AuthenticatedAdmin
//! ```
//!
//! After the first resolution the phase only moves on session events; an
//! admin lookup runs for every event that carries a session.

use reqwest::Url;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::auth::{AuthError, AuthProvider, Subscription};
use crate::model::{AdminAllowlistEntry, Identity, Session};
use crate::store::{ContentStore, Query, StoreError};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthState {
    pub identity: Option<Identity>,
    pub resolving: bool,
    pub is_admin: bool,
}

impl Default for AuthState {
    fn default() -> Self {
        Self {
            identity: None,
            resolving: true,
            is_admin: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    Resolving,
    Anonymous,
    AuthenticatedNonAdmin,
    AuthenticatedAdmin,
}

impl AuthState {
    pub fn phase(&self) -> AuthPhase {
        match (self.resolving, &self.identity, self.is_admin) {
            (true, _, _) => AuthPhase::Resolving,
            (false, None, _) => AuthPhase::Anonymous,
            (false, Some(_), false) => AuthPhase::AuthenticatedNonAdmin,
            (false, Some(_), true) => AuthPhase::AuthenticatedAdmin,
        }
    }
}

/// How a failed allowlist lookup is interpreted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AdminPolicy {
    /// Any lookup error means "not an admin".
    #[default]
    DenyOnUncertainty,
}

impl AdminPolicy {
    pub fn decide(&self, lookup: Result<Option<AdminAllowlistEntry>, StoreError>) -> bool {
        match (self, lookup) {
            (AdminPolicy::DenyOnUncertainty, Ok(Some(entry))) => entry.active,
            (AdminPolicy::DenyOnUncertainty, Ok(None)) => false,
            (AdminPolicy::DenyOnUncertainty, Err(err)) => {
                warn!(?err, "admin lookup failed; denying");
                false
            }
        }
    }
}

/// Read-only view of the admin allowlist table.
#[derive(Clone)]
pub struct AdminDirectory {
    store: Arc<dyn ContentStore>,
    table: String,
}

impl AdminDirectory {
    pub fn new(store: Arc<dyn ContentStore>, table: impl Into<String>) -> Self {
        Self {
            store,
            table: table.into(),
        }
    }

    /// The active allowlist row for `email`. More than one match is an error.
    #[instrument(skip_all)]
    pub async fn lookup(&self, email: &str) -> Result<Option<AdminAllowlistEntry>, StoreError> {
        let query = Query::new().eq("email", email).eq("is_active", true).limit(2);
        let mut rows = self.store.select(&self.table, &query).await?;
        match rows.len() {
            0 => Ok(None),
            1 => Ok(Some(serde_json::from_value(rows.swap_remove(0))?)),
            n => Err(StoreError::Invalid(format!(
                "{n} active allowlist rows for one email"
            ))),
        }
    }
}

/// Where federated sign-in starts and returns to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignInOptions {
    pub provider: String,
    pub redirect_to: Url,
}

/// Shared pieces the event listener needs after `initialize` returns.
#[derive(Clone)]
struct Resolver {
    admins: AdminDirectory,
    policy: AdminPolicy,
    state: Arc<watch::Sender<AuthState>>,
}

impl Resolver {
    async fn is_admin(&self, identity: &Identity) -> bool {
        if identity.email.trim().is_empty() {
            return false;
        }
        self.policy.decide(self.admins.lookup(&identity.email).await)
    }

    async fn apply_session(&self, session: Option<&Session>) {
        match session {
            Some(session) => {
                let identity = session.identity.clone();
                self.state.send_modify(|s| {
                    let same_person = s
                        .identity
                        .as_ref()
                        .is_some_and(|current| current.email == identity.email);
                    if !same_person {
                        s.is_admin = false;
                    }
                    s.identity = Some(identity.clone());
                });
                let is_admin = self.is_admin(&identity).await;
                self.state.send_modify(|s| {
                    s.is_admin = is_admin;
                    s.resolving = false;
                });
                info!(email = %identity.email, is_admin, "session resolved");
            }
            None => {
                self.state.send_modify(|s| {
                    s.identity = None;
                    s.is_admin = false;
                    s.resolving = false;
                });
                info!("session cleared");
            }
        }
    }

    async fn listen(self, mut events: Subscription) {
        while let Some(event) = events.recv().await {
            debug!(event = event.as_str(), "applying session event");
            self.apply_session(event.session()).await;
        }
    }
}

pub struct AuthContext {
    provider: Arc<dyn AuthProvider>,
    sign_in: SignInOptions,
    resolver: Resolver,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl AuthContext {
    pub fn new(
        provider: Arc<dyn AuthProvider>,
        admins: AdminDirectory,
        sign_in: SignInOptions,
    ) -> Self {
        let (state, _) = watch::channel(AuthState::default());
        Self {
            provider,
            sign_in,
            resolver: Resolver {
                admins,
                policy: AdminPolicy::default(),
                state: Arc::new(state),
            },
            listener: Mutex::new(None),
        }
    }

    /// Resolve the current session and start following session events.
    ///
    /// `resolving` is cleared whatever happens. A provider error leaves the
    /// context anonymous and is returned; events are still followed.
    #[instrument(skip_all)]
    pub async fn initialize(&self) -> Result<(), AuthError> {
        // Subscribe before reading so nothing emitted in between is missed.
        let events = self.provider.subscribe();
        let result = match self.provider.current_session().await {
            Ok(session) => {
                self.resolver.apply_session(session.as_ref()).await;
                Ok(())
            }
            Err(err) => {
                self.resolver.apply_session(None).await;
                Err(err)
            }
        };

        let handle = tokio::spawn(self.resolver.clone().listen(events));
        let previous = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
        result
    }

    /// Stop following session events. State stays as last resolved.
    pub fn dispose(&self) {
        let handle = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }

    pub fn state(&self) -> AuthState {
        self.resolver.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<AuthState> {
        self.resolver.state.subscribe()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.resolver.state.borrow().identity.clone()
    }

    pub fn resolving(&self) -> bool {
        self.resolver.state.borrow().resolving
    }

    pub fn is_admin(&self) -> bool {
        self.resolver.state.borrow().is_admin
    }

    pub fn phase(&self) -> AuthPhase {
        self.resolver.state.borrow().phase()
    }

    /// Start federated sign-in; returns the URL to open.
    pub async fn sign_in(&self) -> Result<Url, AuthError> {
        self.provider
            .sign_in_with_oauth(&self.sign_in.provider, &self.sign_in.redirect_to)
            .await
    }

    /// Sign out. Admin access ends locally even if the provider call fails.
    pub async fn sign_out(&self) -> Result<(), AuthError> {
        let result = self.provider.sign_out().await;
        self.resolver.state.send_modify(|s| s.is_admin = false);
        if let Err(err) = &result {
            warn!(?err, "provider sign-out failed");
        }
        result
    }
}

impl Drop for AuthContext {
    fn drop(&mut self) {
        self.dispose();
    }
}
