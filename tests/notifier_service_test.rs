use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, TimeZone, Utc};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, Notify};

use gmail_notifier::error::{NotifierError, Result};
use gmail_notifier::gmail_api::{Authorizer, CredentialStore, KeyringEntry, MailFeed};
use gmail_notifier::service::{NotifierEvent, NotifierHandle, NotifierService};
use gmail_notifier::session::SessionManager;
use gmail_notifier::types::{Credential, Feed, LoginPrompt, MessageSummary, SessionState};

// Keyring stand-in whose contents the test can inspect
struct MemoryKeyring(Arc<Mutex<Option<String>>>);

impl KeyringEntry for MemoryKeyring {
    fn get_password(&self) -> std::result::Result<String, keyring::Error> {
        self.0.lock().unwrap().clone().ok_or(keyring::Error::NoEntry)
    }
    fn set_password(&self, password: &str) -> std::result::Result<(), keyring::Error> {
        *self.0.lock().unwrap() = Some(password.to_string());
        Ok(())
    }
    fn delete_password(&self) -> std::result::Result<(), keyring::Error> {
        self.0.lock().unwrap().take().map(|_| ()).ok_or(keyring::Error::NoEntry)
    }
}

#[derive(Default)]
struct FakeAuthorizer {
    /// Holds back the first `authorize` call until notified.
    gate: Option<Arc<Notify>>,
    /// Lifetime of the access token handed out by `authorize`.
    access_ttl: Option<ChronoDuration>,
    /// This many leading `refresh` calls fail with a network error.
    failing_refreshes: usize,
    revoke_fails: bool,
    authorize_calls: AtomicUsize,
    refresh_calls: AtomicUsize,
    revoke_calls: AtomicUsize,
}

#[async_trait]
impl Authorizer for FakeAuthorizer {
    async fn authorize(&self, _prompt: LoginPrompt) -> Result<Credential> {
        let call = self.authorize_calls.fetch_add(1, Ordering::SeqCst);
        if let (0, Some(gate)) = (call, &self.gate) {
            gate.notified().await;
        }
        let mut credential =
            Credential::new("access-1".to_string()).with_refresh_token("refresh-1".to_string());
        if let Some(ttl) = self.access_ttl {
            credential = credential.with_expiry(Utc::now() + ttl);
        }
        Ok(credential)
    }

    async fn refresh(&self, _refresh_token: &str) -> Result<Credential> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.failing_refreshes {
            return Err(NotifierError::NetworkError("token endpoint unreachable".to_string()));
        }
        Ok(Credential::new(format!("access-{}", n + 1)))
    }

    async fn revoke(&self, _token: &str) -> Result<()> {
        self.revoke_calls.fetch_add(1, Ordering::SeqCst);
        if self.revoke_fails {
            Err(NotifierError::RevocationFailed("server said no".to_string()))
        } else {
            Ok(())
        }
    }
}

type Responder = Box<dyn Fn(&str, usize) -> Result<Feed> + Send + Sync>;

struct FakeFeed {
    latency: Duration,
    respond: Responder,
    calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    tokens: Mutex<Vec<String>>,
}

impl FakeFeed {
    fn new(latency: Duration, respond: impl Fn(&str, usize) -> Result<Feed> + Send + Sync + 'static) -> Self {
        Self {
            latency,
            respond: Box::new(respond),
            calls: AtomicUsize::new(0),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            tokens: Mutex::new(Vec::new()),
        }
    }

    /// Returns the listed id sets in order, repeating the last one.
    fn sequence(batches: Vec<Vec<&'static str>>) -> Self {
        Self::new(Duration::ZERO, move |_, call| {
            let ids = &batches[call.min(batches.len() - 1)];
            Ok(feed(ids))
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn tokens(&self) -> Vec<String> {
        self.tokens.lock().unwrap().clone()
    }
}

#[async_trait]
impl MailFeed for FakeFeed {
    async fn fetch(&self, access_token: &str) -> Result<Feed> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        self.tokens.lock().unwrap().push(access_token.to_string());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);
        (self.respond)(access_token, call)
    }
}

fn feed(ids: &[&str]) -> Feed {
    let newest = Utc.with_ymd_and_hms(2024, 3, 2, 12, 0, 0).unwrap();
    let messages = ids
        .iter()
        .enumerate()
        .map(|(i, id)| MessageSummary {
            id: id.to_string(),
            received_at: newest - ChronoDuration::hours(i as i64),
            subject: format!("subject {}", id),
            author: "someone@example.com".to_string(),
            snippet: String::new(),
            url: format!("https://mail.google.com/mail?message_id={}", id),
        })
        .collect();
    Feed {
        messages,
        unread_count: ids.len() as u32,
    }
}

struct Harness {
    handle: NotifierHandle,
    keyring: Arc<Mutex<Option<String>>>,
    auth: Arc<FakeAuthorizer>,
    feed: Arc<FakeFeed>,
}

fn spawn(auth: FakeAuthorizer, feed: FakeFeed, only_new: bool, stored: Option<&str>) -> Harness {
    let keyring = Arc::new(Mutex::new(stored.map(str::to_string)));
    let auth = Arc::new(auth);
    let feed = Arc::new(feed);
    let session = SessionManager::new(
        CredentialStore::new(MemoryKeyring(keyring.clone())),
        auth.clone(),
    );
    let (handle, _join) = NotifierService::spawn(session, feed.clone(), only_new);
    Harness {
        handle,
        keyring,
        auth,
        feed,
    }
}

async fn next_event(events: &mut broadcast::Receiver<NotifierEvent>) -> NotifierEvent {
    tokio::time::timeout(Duration::from_secs(900), events.recv())
        .await
        .expect("no event before timeout")
        .expect("event channel closed")
}

async fn next_batch_ids(events: &mut broadcast::Receiver<NotifierEvent>) -> (Vec<String>, Vec<String>) {
    match next_event(events).await {
        NotifierEvent::Messages(batch) => (
            batch.messages.iter().map(|m| m.id.clone()).collect(),
            batch.new_messages.iter().map(|m| m.id.clone()).collect(),
        ),
        other => panic!("expected messages, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn test_only_new_messages_across_polls() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::sequence(vec![vec!["a", "b"], vec!["c", "a", "b"]]),
        true,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    assert_eq!(h.handle.current_state(), SessionState::Ready);
    assert_eq!(h.keyring.lock().unwrap().as_deref(), Some("refresh-1"));

    h.handle.start(Duration::from_secs(60)).await.unwrap();

    let (messages, new) = next_batch_ids(&mut events).await;
    assert_eq!(messages, vec!["a", "b"]);
    assert_eq!(new, vec!["a", "b"]);

    let (messages, new) = next_batch_ids(&mut events).await;
    assert_eq!(messages, vec!["c"]);
    assert_eq!(new, vec!["c"]);
}

#[tokio::test(start_paused = true)]
async fn test_full_list_when_only_new_is_off() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::sequence(vec![vec!["a", "b"], vec!["c", "a", "b"]]),
        false,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    h.handle.start(Duration::from_secs(60)).await.unwrap();

    let (messages, _) = next_batch_ids(&mut events).await;
    assert_eq!(messages, vec!["a", "b"]);

    let (messages, new) = next_batch_ids(&mut events).await;
    assert_eq!(messages, vec!["c", "a", "b"]);
    assert_eq!(new, vec!["c"]);
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetches_never_overlap() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::new(Duration::from_secs(150), |_, _| Ok(feed(&["a"]))),
        false,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    h.handle.start(Duration::from_secs(60)).await.unwrap();

    for _ in 0..3 {
        next_batch_ids(&mut events).await;
    }
    assert_eq!(h.feed.max_active.load(Ordering::SeqCst), 1);
    assert!(h.feed.calls() >= 3);
}

#[tokio::test(start_paused = true)]
async fn test_second_rejection_after_refresh_is_unauthorized() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::new(Duration::ZERO, |_, _| Err(NotifierError::Unauthorized)),
        false,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    h.handle.check_now().await.unwrap();

    match next_event(&mut events).await {
        NotifierEvent::FetchFailed(NotifierError::Unauthorized) => {}
        other => panic!("expected Unauthorized, got {:?}", other),
    }
    assert_eq!(h.auth.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.feed.tokens(), vec!["access-1", "access-2"]);
    assert_eq!(h.handle.current_state(), SessionState::Error);
}

#[tokio::test(start_paused = true)]
async fn test_silent_refresh_recovers_from_one_rejection() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::new(Duration::ZERO, |token, _| {
            if token == "access-1" {
                Err(NotifierError::Unauthorized)
            } else {
                Ok(feed(&["a"]))
            }
        }),
        false,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    h.handle.check_now().await.unwrap();
    let (messages, _) = next_batch_ids(&mut events).await;
    assert_eq!(messages, vec!["a"]);
    assert_eq!(h.handle.current_state(), SessionState::Ready);

    // The refreshed token is kept for later fetches
    h.handle.check_now().await.unwrap();
    next_batch_ids(&mut events).await;
    assert_eq!(h.feed.tokens(), vec!["access-1", "access-2", "access-2"]);
    assert_eq!(h.auth.refresh_calls.load(Ordering::SeqCst), 1);
    assert_eq!(h.keyring.lock().unwrap().as_deref(), Some("refresh-1"));
}

#[tokio::test(start_paused = true)]
async fn test_near_expiry_token_is_refreshed_before_fetch() {
    let h = spawn(
        FakeAuthorizer {
            access_ttl: Some(ChronoDuration::seconds(5)),
            ..FakeAuthorizer::default()
        },
        FakeFeed::sequence(vec![vec!["a"]]),
        false,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    h.handle.check_now().await.unwrap();
    next_batch_ids(&mut events).await;

    assert_eq!(h.feed.tokens(), vec!["access-2"]);
    assert_eq!(h.auth.refresh_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_early_refresh_keeps_the_retry_for_a_rejection() {
    let h = spawn(
        FakeAuthorizer {
            access_ttl: Some(ChronoDuration::seconds(5)),
            failing_refreshes: 1,
            ..FakeAuthorizer::default()
        },
        FakeFeed::new(Duration::ZERO, |token, _| {
            if token == "access-1" {
                Err(NotifierError::Unauthorized)
            } else {
                Ok(feed(&["a"]))
            }
        }),
        false,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    h.handle.check_now().await.unwrap();

    let (messages, _) = next_batch_ids(&mut events).await;
    assert_eq!(messages, vec!["a"]);
    assert_eq!(h.auth.refresh_calls.load(Ordering::SeqCst), 2);
    assert_eq!(h.feed.tokens(), vec!["access-1", "access-3"]);
    assert_eq!(h.handle.current_state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_stop_discards_in_flight_result() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::new(Duration::from_secs(100), |_, _| Ok(feed(&["a"]))),
        false,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    h.handle.start(Duration::from_secs(60)).await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.feed.calls(), 1);

    h.handle.stop().await.unwrap();
    tokio::time::sleep(Duration::from_secs(200)).await;
    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    assert_eq!(h.feed.calls(), 1);

    h.handle.check_now().await.unwrap();
    let (messages, _) = next_batch_ids(&mut events).await;
    assert_eq!(messages, vec!["a"]);
    assert_eq!(h.feed.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_second_login_while_authenticating() {
    let gate = Arc::new(Notify::new());
    let h = spawn(
        FakeAuthorizer {
            gate: Some(gate.clone()),
            ..FakeAuthorizer::default()
        },
        FakeFeed::sequence(vec![vec![]]),
        false,
        None,
    );

    let first = {
        let handle = h.handle.clone();
        tokio::spawn(async move { handle.login(LoginPrompt::OpenBrowser).await })
    };
    let mut state = h.handle.watch_state();
    state
        .wait_for(|s| *s == SessionState::Authenticating)
        .await
        .unwrap();

    assert_eq!(
        h.handle.login(LoginPrompt::OpenBrowser).await,
        Err(NotifierError::AlreadyInProgress)
    );

    gate.notify_one();
    assert_eq!(first.await.unwrap(), Ok(()));
    assert_eq!(h.handle.current_state(), SessionState::Ready);
    assert_eq!(h.auth.authorize_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_logout_during_login_wins() {
    let gate = Arc::new(Notify::new());
    let h = spawn(
        FakeAuthorizer {
            gate: Some(gate.clone()),
            ..FakeAuthorizer::default()
        },
        FakeFeed::sequence(vec![vec![]]),
        false,
        None,
    );

    let login = {
        let handle = h.handle.clone();
        tokio::spawn(async move { handle.login(LoginPrompt::OpenBrowser).await })
    };
    h.handle
        .watch_state()
        .wait_for(|s| *s == SessionState::Authenticating)
        .await
        .unwrap();

    h.handle.logout().await.unwrap();
    assert_eq!(h.handle.current_state(), SessionState::SignedOut);

    gate.notify_one();
    assert!(matches!(
        login.await.unwrap(),
        Err(NotifierError::AuthDenied(_))
    ));
    assert_eq!(h.handle.current_state(), SessionState::SignedOut);
    assert!(h.keyring.lock().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_logout_discards_in_flight_fetch() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::new(Duration::from_secs(100), |_, _| Err(NotifierError::Unauthorized)),
        false,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    h.handle.check_now().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.feed.calls(), 1);

    h.handle.logout().await.unwrap();
    tokio::time::sleep(Duration::from_secs(300)).await;

    assert!(matches!(
        events.try_recv(),
        Err(broadcast::error::TryRecvError::Empty)
    ));
    // The late rejection must not touch the signed-out session
    assert_eq!(h.handle.current_state(), SessionState::SignedOut);
    assert_eq!(h.auth.refresh_calls.load(Ordering::SeqCst), 1);
    assert!(h.keyring.lock().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_late_login_result_does_not_trigger_a_fetch() {
    let gate = Arc::new(Notify::new());
    let h = spawn(
        FakeAuthorizer {
            gate: Some(gate.clone()),
            ..FakeAuthorizer::default()
        },
        FakeFeed::sequence(vec![vec!["a"]]),
        false,
        None,
    );
    let mut events = h.handle.subscribe();

    let abandoned = {
        let handle = h.handle.clone();
        tokio::spawn(async move { handle.login(LoginPrompt::OpenBrowser).await })
    };
    h.handle
        .watch_state()
        .wait_for(|s| *s == SessionState::Authenticating)
        .await
        .unwrap();
    h.handle.logout().await.unwrap();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    h.handle.start(Duration::from_secs(60)).await.unwrap();
    next_batch_ids(&mut events).await;
    assert_eq!(h.feed.calls(), 1);

    gate.notify_one();
    assert!(matches!(
        abandoned.await.unwrap(),
        Err(NotifierError::AuthDenied(_))
    ));
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(h.feed.calls(), 1);
    assert!(events.try_recv().is_err());
    assert_eq!(h.handle.current_state(), SessionState::Ready);
}

#[tokio::test(start_paused = true)]
async fn test_logout_succeeds_when_revocation_fails() {
    let h = spawn(
        FakeAuthorizer {
            revoke_fails: true,
            ..FakeAuthorizer::default()
        },
        FakeFeed::sequence(vec![vec![]]),
        false,
        None,
    );
    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();

    assert_eq!(h.handle.logout().await, Ok(()));
    assert_eq!(h.handle.current_state(), SessionState::SignedOut);
    assert_eq!(h.auth.revoke_calls.load(Ordering::SeqCst), 1);
    assert!(h.keyring.lock().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_fetch_error_does_not_stop_polling() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::new(Duration::ZERO, |_, call| {
            if call == 0 {
                Err(NotifierError::fetch("connection reset"))
            } else {
                Ok(feed(&["a"]))
            }
        }),
        true,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.login(LoginPrompt::OpenBrowser).await.unwrap();
    h.handle.start(Duration::from_secs(60)).await.unwrap();

    match next_event(&mut events).await {
        NotifierEvent::FetchFailed(NotifierError::FetchError { cause }) => {
            assert_eq!(cause, "connection reset")
        }
        other => panic!("expected a fetch error, got {:?}", other),
    }
    assert_eq!(h.handle.current_state(), SessionState::Ready);

    let (messages, _) = next_batch_ids(&mut events).await;
    assert_eq!(messages, vec!["a"]);
}

#[tokio::test(start_paused = true)]
async fn test_restore_from_keyring() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::sequence(vec![vec!["a"]]),
        false,
        Some("stored-refresh"),
    );
    let mut events = h.handle.subscribe();

    assert_eq!(h.handle.restore().await, Ok(true));
    assert_eq!(h.handle.current_state(), SessionState::Ready);
    assert_eq!(h.auth.authorize_calls.load(Ordering::SeqCst), 0);
    assert_eq!(h.keyring.lock().unwrap().as_deref(), Some("stored-refresh"));

    h.handle.check_now().await.unwrap();
    next_batch_ids(&mut events).await;
    assert_eq!(h.feed.tokens(), vec!["access-2"]);
}

#[tokio::test(start_paused = true)]
async fn test_restore_without_stored_token() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::sequence(vec![vec![]]),
        false,
        None,
    );
    assert_eq!(h.handle.restore().await, Ok(false));
    assert_eq!(h.handle.current_state(), SessionState::SignedOut);
}

#[tokio::test(start_paused = true)]
async fn test_check_now_while_signed_out_does_nothing() {
    let h = spawn(
        FakeAuthorizer::default(),
        FakeFeed::sequence(vec![vec!["a"]]),
        false,
        None,
    );
    let mut events = h.handle.subscribe();

    h.handle.check_now().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(events.try_recv().is_err());
    assert_eq!(h.feed.calls(), 0);
}
