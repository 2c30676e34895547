use std::sync::Arc;
use tokio::sync::{broadcast, watch};

use crate::error::{NotifierError, Result};
use crate::gmail_api::{Authorizer, CredentialStore, KeyringEntry};
use crate::types::{Credential, SessionState};

/// One edge taken by the session state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateChange {
    pub from: SessionState,
    pub to: SessionState,
}

/// Identifies the session an async operation was started in. Logging out
/// bumps the epoch, so completions carrying an older ticket are dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionTicket {
    epoch: u64,
}

/// Owns the credential and the session state. Every method is synchronous
/// and must be called from the owning task; network round-trips are run
/// elsewhere and their results handed back through the `finish_*` methods.
pub struct SessionManager<K: KeyringEntry> {
    state: SessionState,
    credential: Option<Credential>,
    epoch: u64,
    store: CredentialStore<K>,
    authorizer: Arc<dyn Authorizer>,
    state_tx: watch::Sender<SessionState>,
    changes_tx: broadcast::Sender<StateChange>,
}

impl<K: KeyringEntry> SessionManager<K> {
    pub fn new(store: CredentialStore<K>, authorizer: Arc<dyn Authorizer>) -> Self {
        let (state_tx, _) = watch::channel(SessionState::SignedOut);
        let (changes_tx, _) = broadcast::channel(32);
        Self {
            state: SessionState::SignedOut,
            credential: None,
            epoch: 0,
            store,
            authorizer,
            state_tx,
            changes_tx,
        }
    }

    pub fn current_state(&self) -> SessionState {
        self.state
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    pub fn change_sender(&self) -> broadcast::Sender<StateChange> {
        self.changes_tx.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateChange> {
        self.changes_tx.subscribe()
    }

    pub fn authorizer(&self) -> Arc<dyn Authorizer> {
        self.authorizer.clone()
    }

    fn ticket(&self) -> SessionTicket {
        SessionTicket { epoch: self.epoch }
    }

    fn transition(&mut self, next: SessionState) {
        let from = self.state;
        if !from.can_transition_to(next) {
            tracing::error!("Refusing illegal session transition {} -> {}", from, next);
            return;
        }
        self.state = next;
        tracing::info!("Session {} -> {}", from, next);
        self.state_tx.send_replace(next);
        // No subscribers is fine
        let _ = self.changes_tx.send(StateChange { from, to: next });
    }

    /// Start an interactive login. `Ok(None)` means the session is already
    /// ready and there is nothing to do.
    pub fn begin_login(&mut self) -> Result<Option<SessionTicket>> {
        match self.state {
            SessionState::Authenticating => Err(NotifierError::AlreadyInProgress),
            SessionState::Ready => Ok(None),
            SessionState::SignedOut | SessionState::Error => {
                self.transition(SessionState::Authenticating);
                Ok(Some(self.ticket()))
            }
        }
    }

    /// Start a silent login from the refresh token in the keyring, if any.
    pub fn begin_restore(&mut self) -> Result<Option<(SessionTicket, String)>> {
        if self.state != SessionState::SignedOut {
            return Ok(None);
        }
        match self.store.load_refresh_token()? {
            Some(refresh_token) => {
                self.transition(SessionState::Authenticating);
                Ok(Some((self.ticket(), refresh_token)))
            }
            None => Ok(None),
        }
    }

    /// Apply the outcome of a login or restore. A stale ticket is ignored and
    /// reported as `Ok(false)`.
    pub fn finish_login(
        &mut self,
        ticket: SessionTicket,
        outcome: Result<Credential>,
    ) -> Result<bool> {
        if ticket != self.ticket() || self.state != SessionState::Authenticating {
            tracing::debug!("Discarding login result from a previous session");
            return Ok(false);
        }

        match outcome {
            Ok(credential) => {
                if let Some(refresh_token) = &credential.refresh_token {
                    if let Err(e) = self.store.save_refresh_token(refresh_token) {
                        tracing::warn!("Failed to save refresh token to keyring: {}", e);
                    }
                } else {
                    tracing::warn!("No refresh token granted; the session will not survive a restart");
                }
                self.credential = Some(credential);
                self.transition(SessionState::Ready);
                Ok(true)
            }
            Err(e) => {
                if let NotifierError::AuthDenied(_) = e {
                    // A rejected grant is worthless; do not retry it on the next start
                    if let Err(clear_err) = self.store.clear() {
                        tracing::warn!("Failed to clear rejected token: {}", clear_err);
                    }
                }
                tracing::warn!("Login failed: {}", e);
                self.credential = None;
                self.transition(SessionState::Error);
                Err(e)
            }
        }
    }

    /// Credential copy for one fetch; only available while ready.
    pub fn snapshot(&self) -> Option<(SessionTicket, Credential)> {
        match (&self.state, &self.credential) {
            (SessionState::Ready, Some(credential)) => Some((self.ticket(), credential.clone())),
            _ => None,
        }
    }

    pub fn apply_refreshed(&mut self, ticket: SessionTicket, refreshed: Credential) {
        if ticket != self.ticket() || self.state != SessionState::Ready {
            return;
        }
        let merged = match &self.credential {
            Some(current) => current.merge_refreshed(refreshed),
            None => refreshed,
        };
        let rotated = merged.refresh_token != self.credential.as_ref().and_then(|c| c.refresh_token.clone());
        if rotated {
            if let Some(token) = &merged.refresh_token {
                if let Err(e) = self.store.save_refresh_token(token) {
                    tracing::warn!("Failed to save rotated refresh token: {}", e);
                }
            }
        }
        tracing::debug!("Access token refreshed");
        self.credential = Some(merged);
    }

    /// The server rejected the credential even after a refresh.
    pub fn expire(&mut self, ticket: SessionTicket) {
        if ticket != self.ticket() || self.state != SessionState::Ready {
            return;
        }
        self.credential = None;
        self.transition(SessionState::Error);
    }

    /// Clear local state unconditionally. Returns the token to revoke
    /// remotely, if there was one.
    pub fn logout(&mut self) -> Option<String> {
        self.epoch += 1;
        let token = self
            .credential
            .take()
            .and_then(|c| c.refresh_token.or(Some(c.access_token)));

        if let Err(e) = self.store.clear() {
            tracing::warn!("Failed to remove credential from keyring: {}", e);
        }
        if self.state != SessionState::SignedOut {
            self.transition(SessionState::SignedOut);
        }
        token
    }
}
