use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};

use crate::error::{NotifierError, Result};
use crate::gmail_api::{Authorizer, KeyringEntry, MailFeed};
use crate::poller::{FetchTicket, FetchTrigger, MessageBatch, MessagePoller, PollOutcome};
use crate::session::{SessionManager, SessionTicket, StateChange};
use crate::types::{Credential, Feed, LoginPrompt, SessionState};

#[derive(Debug)]
pub enum NotifierCommand {
    Login(LoginPrompt, oneshot::Sender<Result<()>>),
    Restore(oneshot::Sender<Result<bool>>),
    Logout(oneshot::Sender<()>),
    Start(Duration, oneshot::Sender<()>),
    Stop(oneshot::Sender<()>),
    CheckNow(oneshot::Sender<()>),
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum NotifierEvent {
    Messages(MessageBatch),
    FetchFailed(NotifierError),
}

enum LoginReply {
    Login(oneshot::Sender<Result<()>>),
    Restore(oneshot::Sender<Result<bool>>),
}

// Work finished off the owning task, posted back to it
enum Completion {
    Login {
        ticket: SessionTicket,
        outcome: Result<Credential>,
        reply: LoginReply,
    },
    Fetch {
        ticket: FetchTicket,
        outcome: FetchOutcome,
    },
}

struct FetchOutcome {
    result: Result<Feed>,
    refreshed: Option<Credential>,
}

/// Cheap, cloneable front door to a running `NotifierService`.
#[derive(Clone)]
pub struct NotifierHandle {
    commands: mpsc::Sender<NotifierCommand>,
    state_rx: watch::Receiver<SessionState>,
    state_changes: broadcast::Sender<StateChange>,
    events: broadcast::Sender<NotifierEvent>,
}

impl NotifierHandle {
    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> NotifierCommand,
    ) -> Result<T> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.commands
            .send(command(reply_tx))
            .await
            .map_err(|_| NotifierError::ServiceClosed)?;
        reply_rx.await.map_err(|_| NotifierError::ServiceClosed)
    }

    /// Interactive sign-in. Resolves once the session is ready or failed.
    pub async fn login(&self, prompt: LoginPrompt) -> Result<()> {
        self.request(|reply| NotifierCommand::Login(prompt, reply))
            .await?
    }

    /// Silent sign-in from the keyring. `Ok(false)` when nothing is stored.
    pub async fn restore(&self) -> Result<bool> {
        self.request(NotifierCommand::Restore).await?
    }

    /// Always ends signed out; remote revocation is best-effort.
    pub async fn logout(&self) -> Result<()> {
        self.request(NotifierCommand::Logout).await
    }

    pub async fn start(&self, interval: Duration) -> Result<()> {
        self.request(|reply| NotifierCommand::Start(interval, reply))
            .await
    }

    pub async fn stop(&self) -> Result<()> {
        self.request(NotifierCommand::Stop).await
    }

    pub async fn check_now(&self) -> Result<()> {
        self.request(NotifierCommand::CheckNow).await
    }

    pub async fn shutdown(&self) {
        let _ = self.commands.send(NotifierCommand::Shutdown).await;
    }

    pub fn current_state(&self) -> SessionState {
        *self.state_rx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_rx.clone()
    }

    pub fn subscribe_state(&self) -> broadcast::Receiver<StateChange> {
        self.state_changes.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<NotifierEvent> {
        self.events.subscribe()
    }
}

/// Single owner of the session and poller. Commands, timer ticks and network
/// completions are all handled on this one task, so none of the state it
/// owns needs a lock.
pub struct NotifierService<K: KeyringEntry> {
    session: SessionManager<K>,
    poller: MessagePoller,
    feed: Arc<dyn MailFeed>,
    command_rx: mpsc::Receiver<NotifierCommand>,
    completion_tx: mpsc::Sender<Completion>,
    completion_rx: mpsc::Receiver<Completion>,
    event_tx: broadcast::Sender<NotifierEvent>,
    ticker: Option<Interval>,
}

impl<K: KeyringEntry + 'static> NotifierService<K> {
    pub fn spawn(
        session: SessionManager<K>,
        feed: Arc<dyn MailFeed>,
        only_new: bool,
    ) -> (NotifierHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(100);
        let (completion_tx, completion_rx) = mpsc::channel(100);
        let (event_tx, _) = broadcast::channel(100);

        let handle = NotifierHandle {
            commands: command_tx,
            state_rx: session.watch_state(),
            state_changes: session.change_sender(),
            events: event_tx.clone(),
        };

        let mut service = NotifierService {
            session,
            poller: MessagePoller::new(only_new),
            feed,
            command_rx,
            completion_tx,
            completion_rx,
            event_tx,
            ticker: None,
        };
        let join = tokio::spawn(async move {
            service.run().await;
        });
        (handle, join)
    }

    async fn run(&mut self) {
        loop {
            tokio::select! {
                biased;

                command = self.command_rx.recv() => {
                    match command {
                        Some(NotifierCommand::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }

                Some(completion) = self.completion_rx.recv() => {
                    self.handle_completion(completion);
                }

                _ = next_tick(&mut self.ticker) => {
                    self.begin_fetch(FetchTrigger::Timer);
                }
            }
        }
        tracing::debug!("Notifier service stopped");
    }

    fn handle_command(&mut self, command: NotifierCommand) {
        match command {
            NotifierCommand::Login(prompt, reply) => match self.session.begin_login() {
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
                Ok(None) => {
                    let _ = reply.send(Ok(()));
                }
                Ok(Some(ticket)) => {
                    let authorizer = self.session.authorizer();
                    let completion_tx = self.completion_tx.clone();
                    tokio::spawn(async move {
                        let outcome = authorizer.authorize(prompt).await;
                        let _ = completion_tx
                            .send(Completion::Login {
                                ticket,
                                outcome,
                                reply: LoginReply::Login(reply),
                            })
                            .await;
                    });
                }
            },
            NotifierCommand::Restore(reply) => match self.session.begin_restore() {
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
                Ok(None) => {
                    let _ = reply.send(Ok(self.session.current_state() == SessionState::Ready));
                }
                Ok(Some((ticket, refresh_token))) => {
                    let authorizer = self.session.authorizer();
                    let completion_tx = self.completion_tx.clone();
                    tokio::spawn(async move {
                        let outcome = authorizer
                            .refresh(&refresh_token)
                            .await
                            .map(|c| {
                                if c.refresh_token.is_some() {
                                    c
                                } else {
                                    c.with_refresh_token(refresh_token.clone())
                                }
                            });
                        let _ = completion_tx
                            .send(Completion::Login {
                                ticket,
                                outcome,
                                reply: LoginReply::Restore(reply),
                            })
                            .await;
                    });
                }
            },
            NotifierCommand::Logout(reply) => {
                let token = self.session.logout();
                self.poller.reset();
                let authorizer = self.session.authorizer();
                tokio::spawn(async move {
                    if let Some(token) = token {
                        if let Err(e) = authorizer.revoke(&token).await {
                            tracing::warn!("{}", e);
                        }
                    }
                    let _ = reply.send(());
                });
            }
            NotifierCommand::Start(interval, reply) => {
                self.poller.start(interval);
                let mut ticker = interval_at(Instant::now(), interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ticker = Some(ticker);
                let _ = reply.send(());
            }
            NotifierCommand::Stop(reply) => {
                self.poller.stop();
                self.ticker = None;
                let _ = reply.send(());
            }
            NotifierCommand::CheckNow(reply) => {
                self.begin_fetch(FetchTrigger::Manual);
                let _ = reply.send(());
            }
            NotifierCommand::Shutdown => {}
        }
    }

    fn handle_completion(&mut self, completion: Completion) {
        match completion {
            Completion::Login {
                ticket,
                outcome,
                reply,
            } => {
                let result = self.session.finish_login(ticket, outcome);
                // A stale completion must not kick off a fetch for whichever
                // session happens to be ready now
                let ready = matches!(result, Ok(true))
                    && self.session.current_state() == SessionState::Ready;
                match reply {
                    LoginReply::Login(reply) => {
                        let _ = reply.send(result.and_then(|applied| {
                            if applied {
                                Ok(())
                            } else {
                                Err(NotifierError::AuthDenied(
                                    "login abandoned by logout".to_string(),
                                ))
                            }
                        }));
                    }
                    LoginReply::Restore(reply) => {
                        let _ = reply.send(result.map(|_| ready));
                    }
                }
                if ready && self.poller.is_running() {
                    self.begin_fetch(FetchTrigger::SessionReady);
                }
            }
            Completion::Fetch { ticket, outcome } => {
                if let Some(refreshed) = outcome.refreshed {
                    self.session.apply_refreshed(ticket.session, refreshed);
                }
                if let Err(NotifierError::Unauthorized) = outcome.result {
                    self.session.expire(ticket.session);
                }

                let event = match self.poller.complete(ticket, outcome.result) {
                    Some(PollOutcome::Messages(batch)) => {
                        tracing::debug!(
                            "Fetched {} messages ({} new, {} unread)",
                            batch.messages.len(),
                            batch.new_messages.len(),
                            batch.unread_count
                        );
                        NotifierEvent::Messages(batch)
                    }
                    Some(PollOutcome::Failed(e)) => {
                        tracing::warn!("Fetch failed: {}", e);
                        NotifierEvent::FetchFailed(e)
                    }
                    None => return,
                };
                let _ = self.event_tx.send(event);
            }
        }
    }

    fn begin_fetch(&mut self, trigger: FetchTrigger) {
        let Some((session_ticket, credential)) = self.session.snapshot() else {
            tracing::debug!(
                "Skipping {:?} fetch: session is {}",
                trigger,
                self.session.current_state()
            );
            return;
        };
        let Some(ticket) = self.poller.try_begin(trigger, session_ticket) else {
            return;
        };

        let feed = self.feed.clone();
        let authorizer = self.session.authorizer();
        let completion_tx = self.completion_tx.clone();
        tokio::spawn(async move {
            let outcome = run_fetch(feed.as_ref(), authorizer.as_ref(), credential).await;
            let _ = completion_tx
                .send(Completion::Fetch { ticket, outcome })
                .await;
        });
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// At most one refresh per fetch, whether it is proactive or after a 401
async fn run_fetch(
    feed: &dyn MailFeed,
    authorizer: &dyn Authorizer,
    mut credential: Credential,
) -> FetchOutcome {
    let mut refreshed = None;
    let mut refresh_used = false;

    if credential.needs_refresh(Utc::now()) {
        if let Some(refresh_token) = credential.refresh_token.clone() {
            // A failed attempt leaves the one refresh for a 401
            match authorizer.refresh(&refresh_token).await {
                Ok(fresh) => {
                    refresh_used = true;
                    credential = credential.merge_refreshed(fresh);
                    refreshed = Some(credential.clone());
                }
                Err(e) => tracing::warn!("Proactive token refresh failed: {}", e),
            }
        }
    }

    let mut result = feed.fetch(&credential.access_token).await;

    if let Err(NotifierError::Unauthorized) = result {
        match credential.refresh_token.clone() {
            Some(refresh_token) if !refresh_used => {
                tracing::info!("Access token rejected, refreshing");
                match authorizer.refresh(&refresh_token).await {
                    Ok(fresh) => {
                        credential = credential.merge_refreshed(fresh);
                        refreshed = Some(credential.clone());
                        result = feed.fetch(&credential.access_token).await;
                    }
                    Err(e) => tracing::warn!("Silent token refresh failed: {}", e),
                }
            }
            _ => {}
        }
    }

    FetchOutcome { result, refreshed }
}
