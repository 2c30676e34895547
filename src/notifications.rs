use notify_rust::Notification;
#[cfg(all(unix, not(target_os = "macos")))]
use notify_rust::{ActionResponse, NotificationHandle};
#[cfg(all(unix, not(target_os = "macos")))]
use std::collections::HashMap;
use std::fmt;
#[cfg(all(unix, not(target_os = "macos")))]
use std::sync::atomic::{AtomicUsize, Ordering};
#[cfg(all(unix, not(target_os = "macos")))]
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

use crate::config::Settings;
use crate::error::{NotifierError, Result};
use crate::service::{NotifierEvent, NotifierHandle};
use crate::session::StateChange;
use crate::types::{MessageSummary, SessionState};

const APP_NAME: &str = "Gmail Notifier";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NotificationContent {
    pub summary: String,
    pub body: String,
    /// Opened when the notification is clicked.
    pub url: Option<String>,
}

impl NotificationContent {
    pub fn for_message(message: &MessageSummary, show_snippets: bool) -> Self {
        let mut body = message.author.clone();
        if show_snippets && !message.snippet.is_empty() {
            body.push('\n');
            body.push_str(&message.snippet);
        }
        Self {
            summary: message.subject.clone(),
            body,
            url: Some(message.url.clone()).filter(|url| !url.is_empty()),
        }
    }
}

// Define a trait for notification delivery to allow mocking
#[cfg_attr(test, mockall::automock)]
pub trait NotificationSink: Send {
    fn deliver(&mut self, message_id: &str, content: &NotificationContent) -> Result<()>;

    /// Take down the notification for a message that left the feed.
    fn retract(&mut self, message_id: &str);

    fn retract_all(&mut self);
}

// Every clickable notification parks one OS thread in a D-Bus wait until it
// is clicked or closed. Past this many, notifications are shown without the
// click action.
#[cfg(all(unix, not(target_os = "macos")))]
const MAX_ACTION_WAITERS: usize = 8;

/// notify-rust backed sink. Only XDG servers hand back a handle that can be
/// closed later, so retraction is a no-op elsewhere.
#[derive(Default)]
pub struct DesktopNotifier {
    #[cfg(all(unix, not(target_os = "macos")))]
    shown: HashMap<String, NotificationHandle>,
    #[cfg(all(unix, not(target_os = "macos")))]
    action_waiters: Arc<AtomicUsize>,
}

#[cfg(all(unix, not(target_os = "macos")))]
impl DesktopNotifier {
    fn spawn_action_waiter(&self, notification_id: u32, url: String) {
        let waiters = self.action_waiters.clone();
        waiters.fetch_add(1, Ordering::SeqCst);

        let thread_waiters = waiters.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("notification-{}", notification_id))
            .spawn(move || {
                let on_action = |response: &ActionResponse<'_>| {
                    if let ActionResponse::Custom(action) = response {
                        if *action == "default" {
                            if let Err(e) = open::that(&url) {
                                tracing::warn!("Could not open {}: {}", url, e);
                            }
                        }
                    }
                };
                let result = notify_rust::handle_action(notification_id, on_action);
                if let Err(e) = result {
                    tracing::debug!("Stopped waiting for notification {}: {}", notification_id, e);
                }
                thread_waiters.fetch_sub(1, Ordering::SeqCst);
            });

        if let Err(e) = spawned {
            waiters.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!("Could not start notification action thread: {}", e);
        }
    }
}

impl NotificationSink for DesktopNotifier {
    fn deliver(&mut self, message_id: &str, content: &NotificationContent) -> Result<()> {
        let mut notification = Notification::new();
        notification
            .appname(APP_NAME)
            .summary(&content.summary)
            .body(&content.body);

        #[cfg(all(unix, not(target_os = "macos")))]
        {
            // A message that comes back replaces its old notification
            self.retract(message_id);

            notification.hint(notify_rust::Hint::Category("email.arrived".to_string()));
            let clickable = content.url.is_some()
                && self.action_waiters.load(Ordering::SeqCst) < MAX_ACTION_WAITERS;
            if clickable {
                notification.action("default", "Open");
            }
            let handle = notification
                .show()
                .map_err(|e| NotifierError::Notification(e.to_string()))?;
            if let (true, Some(url)) = (clickable, content.url.clone()) {
                self.spawn_action_waiter(handle.id(), url);
            }
            self.shown.insert(message_id.to_string(), handle);
        }

        #[cfg(not(all(unix, not(target_os = "macos"))))]
        {
            tracing::trace!("Showing notification for {}", message_id);
            notification
                .show()
                .map_err(|e| NotifierError::Notification(e.to_string()))?;
        }

        Ok(())
    }

    fn retract(&mut self, message_id: &str) {
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            if let Some(handle) = self.shown.remove(message_id) {
                handle.close();
            }
        }

        #[cfg(not(all(unix, not(target_os = "macos"))))]
        {
            tracing::trace!("Cannot retract notification for {} on this platform", message_id);
        }
    }

    fn retract_all(&mut self) {
        #[cfg(all(unix, not(target_os = "macos")))]
        {
            for (_, handle) in self.shown.drain() {
                handle.close();
            }
        }
    }
}

/// What the status line (the tray icon, in GUI terms) shows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Status {
    SignedOut,
    SigningIn,
    Waiting,
    Unread(u32),
    UpToDate,
    Degraded(String),
    NeedsSignIn,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::SignedOut => write!(f, "No account"),
            Status::SigningIn => write!(f, "Signing in"),
            Status::Waiting => write!(f, "Waiting for first check"),
            Status::Unread(count) => write!(f, "{} unread", count),
            Status::UpToDate => write!(f, "Up to date"),
            Status::Degraded(cause) => write!(f, "Check failed ({})", cause),
            Status::NeedsSignIn => write!(f, "Sign-in required"),
        }
    }
}

/// Turns service events into notifications and status updates.
pub struct Presenter<S: NotificationSink> {
    sink: S,
    show_snippets: bool,
    show_unread_count: bool,
    status: Status,
}

impl<S: NotificationSink> Presenter<S> {
    pub fn new(sink: S, settings: &Settings) -> Self {
        Self {
            sink,
            show_snippets: settings.show_snippets,
            show_unread_count: settings.show_unread_count,
            status: Status::SignedOut,
        }
    }

    pub fn status(&self) -> &Status {
        &self.status
    }

    fn set_status(&mut self, status: Status) {
        if self.status != status {
            tracing::info!("Status: {}", status);
            self.status = status;
        }
    }

    pub fn on_state_change(&mut self, change: StateChange) {
        if change.to == SessionState::SignedOut {
            self.sink.retract_all();
        }
        let status = match change.to {
            SessionState::SignedOut => Status::SignedOut,
            SessionState::Authenticating => Status::SigningIn,
            SessionState::Ready => Status::Waiting,
            SessionState::Error => Status::NeedsSignIn,
        };
        self.set_status(status);
    }

    pub fn on_event(&mut self, event: &NotifierEvent) {
        match event {
            NotifierEvent::Messages(batch) => {
                for message in &batch.messages {
                    tracing::info!(
                        "{}  {}  {}",
                        message.received_at.format("%Y-%m-%d %H:%M"),
                        message.author,
                        message.subject
                    );
                }
                for id in &batch.removed_ids {
                    self.sink.retract(id);
                }
                // Oldest first, so the newest ends up on top of the stack
                for message in batch.new_messages.iter().rev() {
                    let content = NotificationContent::for_message(message, self.show_snippets);
                    if let Err(e) = self.sink.deliver(&message.id, &content) {
                        tracing::warn!("Failed to show notification for {}: {}", message.id, e);
                    }
                }

                let status = if !self.show_unread_count {
                    Status::UpToDate
                } else if batch.unread_count > 0 {
                    Status::Unread(batch.unread_count)
                } else {
                    Status::UpToDate
                };
                self.set_status(status);
            }
            NotifierEvent::FetchFailed(e) if e.needs_user_action() => {
                self.set_status(Status::NeedsSignIn);
            }
            NotifierEvent::FetchFailed(e) => {
                self.set_status(Status::Degraded(e.to_string()));
            }
        }
    }

    /// Runs until the service goes away.
    pub async fn run(mut self, handle: NotifierHandle) {
        let mut state_changes = handle.subscribe_state();
        let mut events = handle.subscribe();
        drop(handle);

        loop {
            tokio::select! {
                change = state_changes.recv() => match change {
                    Ok(change) => self.on_state_change(change),
                    Err(RecvError::Lagged(n)) => tracing::debug!("Missed {} state changes", n),
                    Err(RecvError::Closed) => break,
                },
                event = events.recv() => match event {
                    Ok(event) => self.on_event(&event),
                    Err(RecvError::Lagged(n)) => tracing::warn!("Missed {} notifier events", n),
                    Err(RecvError::Closed) => break,
                },
            }
        }
    }
}

pub fn spawn_presenter<S: NotificationSink + 'static>(
    presenter: Presenter<S>,
    handle: NotifierHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(presenter.run(handle))
}
