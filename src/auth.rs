use crate::api::Authorizer;
use crate::error::{Result, TransferError};
use crate::models::{AuthState, AuthStatus, AuthorizationRequest, AuthorizationSession, ProviderRole};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Default)]
struct Slot {
    session: Option<AuthorizationSession>,
    /// Bumped on every begin/logout so a late poll result for an older
    /// attempt can't flip the current session.
    generation: u64,
    timed_out: bool,
    username: Option<String>,
}

struct Shared {
    slot: Mutex<Slot>,
    poller: std::sync::Mutex<Option<JoinHandle<()>>>,
    state_tx: watch::Sender<AuthState>,
}

impl Shared {
    fn publish(&self, slot: &mut Slot, state: AuthState) {
        if let Some(session) = slot.session.as_mut() {
            session.state = state;
            if state != AuthState::PendingAuthorization {
                session.pending_request_id = None;
            }
        }
        self.state_tx.send_replace(state);
    }

    fn abort_poller(&self) {
        if let Ok(mut g) = self.poller.lock() {
            if let Some(h) = g.take() {
                h.abort();
            }
        }
    }

    fn poller_active(&self) -> bool {
        self.poller
            .lock()
            .map(|g| g.as_ref().map(|h| !h.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }
}

/// Authorization lifecycle of one provider:
/// `Unauthenticated -> PendingAuthorization -> Authorized`, back to
/// `Unauthenticated` on logout or when a 401 is observed.
///
/// Completion happens out-of-band, so `poll_until_authorized` runs a
/// background task that calls `check_status` until it turns positive. At most
/// one such task exists per manager; it is aborted on logout and on drop.
pub struct AuthorizationManager {
    provider: Arc<dyn Authorizer>,
    role: ProviderRole,
    shared: Arc<Shared>,
}

impl AuthorizationManager {
    pub fn new(provider: Arc<dyn Authorizer>) -> Self {
        let role = provider.role();
        let (state_tx, _) = watch::channel(AuthState::Unauthenticated);
        Self {
            provider,
            role,
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::default()),
                poller: std::sync::Mutex::new(None),
                state_tx,
            }),
        }
    }

    pub fn role(&self) -> ProviderRole {
        self.role
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Ask the provider directly. Does not touch the session.
    pub async fn check_status(&self) -> Result<AuthStatus> {
        self.provider.check_status().await
    }

    /// Initial state discovery. A positive answer creates (or confirms) an
    /// Authorized session; a negative answer while Authorized means the token
    /// was invalidated elsewhere. A positive answer while pending completes
    /// the attempt and stops the poll loop.
    pub async fn discover(&self) -> Result<AuthStatus> {
        let status = self.provider.check_status().await?;
        let mut slot = self.shared.slot.lock().await;
        let current = slot.session.as_ref().map(|s| s.state);
        match (current, status.authorized) {
            (Some(AuthState::PendingAuthorization), true) => {
                slot.generation += 1;
                self.shared.abort_poller();
                slot.username = status.username.clone();
                self.shared.publish(&mut slot, AuthState::Authorized);
                info!("{} authorization complete", self.role);
            }
            (Some(AuthState::PendingAuthorization), false) => {}
            (_, true) => {
                if slot.session.is_none() {
                    slot.session = Some(self.new_session(AuthState::Authorized, None));
                }
                slot.username = status.username.clone();
                self.shared.publish(&mut slot, AuthState::Authorized);
            }
            (Some(AuthState::Authorized), false) => {
                warn!("{} session is no longer valid", self.role);
                slot.username = None;
                self.shared.publish(&mut slot, AuthState::Unauthenticated);
            }
            _ => {}
        }
        Ok(status)
    }

    /// Start an authorization attempt and return the URL the user must open.
    pub async fn begin_authorization(&self) -> Result<AuthorizationRequest> {
        let mut slot = self.shared.slot.lock().await;
        if let Some(session) = &slot.session {
            if session.state == AuthState::PendingAuthorization {
                return Err(TransferError::AlreadyPending(self.role));
            }
        }
        // A stale finished poller may still be parked in the handle slot.
        self.shared.abort_poller();

        let request = self.provider.begin_authorization().await?;
        slot.generation += 1;
        slot.timed_out = false;
        slot.session = Some(self.new_session(
            AuthState::PendingAuthorization,
            Some(request.request_id.clone()),
        ));
        self.shared.publish(&mut slot, AuthState::PendingAuthorization);
        info!("{} authorization started ({})", self.role, request.request_id);
        Ok(request)
    }

    /// Wait until the pending attempt completes. Starts the poll task if none
    /// is running; concurrent callers share the same task.
    pub async fn poll_until_authorized(
        &self,
        interval: Duration,
        timeout: Option<Duration>,
    ) -> Result<AuthStatus> {
        let mut rx = self.shared.state_tx.subscribe();
        {
            let slot = self.shared.slot.lock().await;
            match slot.session.as_ref().map(|s| s.state) {
                Some(AuthState::Authorized) => {
                    return Ok(AuthStatus {
                        authorized: true,
                        username: slot.username.clone(),
                    })
                }
                Some(AuthState::PendingAuthorization) => {}
                _ => return Err(TransferError::Unauthorized(self.role)),
            }
            if !self.shared.poller_active() {
                let handle = self.spawn_poller(slot.generation, interval, timeout);
                if let Ok(mut g) = self.shared.poller.lock() {
                    *g = Some(handle);
                }
            }
        }

        loop {
            let state = *rx.borrow_and_update();
            match state {
                AuthState::PendingAuthorization => {}
                AuthState::Authorized => {
                    let slot = self.shared.slot.lock().await;
                    return Ok(AuthStatus {
                        authorized: true,
                        username: slot.username.clone(),
                    });
                }
                AuthState::Unauthenticated => {
                    let slot = self.shared.slot.lock().await;
                    return Err(if slot.timed_out {
                        TransferError::AuthorizationTimedOut(self.role)
                    } else {
                        TransferError::Unauthorized(self.role)
                    });
                }
            }
            if rx.changed().await.is_err() {
                return Err(TransferError::Unauthorized(self.role));
            }
        }
    }

    fn spawn_poller(&self, generation: u64, interval: Duration, timeout: Option<Duration>) -> JoinHandle<()> {
        let provider = self.provider.clone();
        let shared = self.shared.clone();
        let role = self.role;
        tokio::spawn(async move {
            let started = Instant::now();
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                match provider.check_status().await {
                    Ok(status) if status.authorized => {
                        let mut slot = shared.slot.lock().await;
                        if slot.generation == generation {
                            info!("{} authorization complete", role);
                            slot.username = status.username;
                            shared.publish(&mut slot, AuthState::Authorized);
                        }
                        return;
                    }
                    Ok(_) => debug!("{} still pending", role),
                    Err(e) => warn!("{} status check failed, still polling: {}", role, e),
                }
                if let Some(limit) = timeout {
                    if started.elapsed() >= limit {
                        let mut slot = shared.slot.lock().await;
                        if slot.generation == generation {
                            warn!("{} authorization timed out after {:?}", role, limit);
                            slot.timed_out = true;
                            shared.publish(&mut slot, AuthState::Unauthenticated);
                        }
                        return;
                    }
                }
            }
        })
    }

    /// Hand the out-of-band callback to the provider. The state change is
    /// left to the poll loop, which sees the new token on its next check.
    pub async fn complete_authorization(&self, callback: &str) -> Result<()> {
        self.provider.complete_authorization(callback).await
    }

    /// Back to Unauthenticated from any state. Fails only when no session has
    /// ever been created for this provider.
    pub async fn logout(&self) -> Result<()> {
        let mut slot = self.shared.slot.lock().await;
        if slot.session.is_none() {
            return Err(TransferError::NotSupported(self.role));
        }
        self.shared.abort_poller();
        slot.generation += 1;
        slot.username = None;
        self.shared.publish(&mut slot, AuthState::Unauthenticated);
        info!("{} logged out", self.role);
        self.provider.logout().await
    }

    /// Called by components that saw a 401 from this provider.
    pub async fn invalidate(&self) {
        let mut slot = self.shared.slot.lock().await;
        if slot.session.as_ref().map(|s| s.state) == Some(AuthState::Authorized) {
            warn!("{} token rejected upstream, session invalidated", self.role);
            slot.username = None;
            self.shared.publish(&mut slot, AuthState::Unauthenticated);
        }
    }

    pub fn state(&self) -> AuthState {
        *self.shared.state_tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<AuthState> {
        self.shared.state_tx.subscribe()
    }

    pub async fn session(&self) -> Option<AuthorizationSession> {
        self.shared.slot.lock().await.session.clone()
    }

    pub async fn username(&self) -> Option<String> {
        self.shared.slot.lock().await.username.clone()
    }

    pub fn is_polling(&self) -> bool {
        self.shared.poller_active()
    }

    pub fn require_authorized(&self) -> Result<()> {
        if self.state() == AuthState::Authorized {
            Ok(())
        } else {
            Err(TransferError::Unauthorized(self.role))
        }
    }

    fn new_session(&self, state: AuthState, pending_request_id: Option<String>) -> AuthorizationSession {
        AuthorizationSession {
            provider: self.role,
            state,
            pending_request_id,
        }
    }
}

impl Drop for AuthorizationManager {
    fn drop(&mut self) {
        self.shared.abort_poller();
    }
}
