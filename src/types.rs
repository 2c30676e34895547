use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;

// Raw Gmail Atom 0.3 feed, as served by /mail/feed/atom
#[derive(Debug, Deserialize)]
pub struct AtomFeed {
    pub fullcount: Option<u32>,
    #[serde(rename = "entry", default)]
    pub entries: Vec<AtomEntry>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AtomEntry {
    pub id: Option<String>,
    pub title: Option<String>,
    pub summary: Option<String>,
    pub link: Option<AtomLink>,
    pub issued: Option<String>,
    pub modified: Option<String>,
    pub author: Option<AtomAuthor>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AtomLink {
    #[serde(rename = "@href")]
    pub href: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AtomAuthor {
    pub name: Option<String>,
    pub email: Option<String>,
}

/// Metadata for one message in the feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageSummary {
    pub id: String,
    pub received_at: DateTime<Utc>,
    pub subject: String,
    pub author: String,
    pub snippet: String,
    pub url: String,
}

/// One parsed fetch: summaries newest first, plus the server's unread count.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Feed {
    pub messages: Vec<MessageSummary>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    SignedOut,
    Authenticating,
    Ready,
    Error,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (SignedOut, Authenticating)
                | (Authenticating, Ready)
                | (Authenticating, Error)
                | (Authenticating, SignedOut)
                | (Ready, SignedOut)
                | (Ready, Error)
                | (Error, Authenticating)
                | (Error, SignedOut)
        )
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::SignedOut => "signed out",
            SessionState::Authenticating => "authenticating",
            SessionState::Ready => "ready",
            SessionState::Error => "error",
        };
        f.write_str(name)
    }
}

/// How the interactive consent page is put in front of the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoginPrompt {
    OpenBrowser,
    PrintUrl,
}

// Refresh this long before the server-side expiry
const EXPIRY_LEEWAY_SECS: i64 = 30;

#[derive(Clone, PartialEq, Eq)]
pub struct Credential {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub scopes: Vec<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credential {
    pub fn new(access_token: String) -> Self {
        Self {
            access_token,
            refresh_token: None,
            scopes: vec![],
            expires_at: None,
        }
    }

    pub fn with_refresh_token(mut self, token: String) -> Self {
        self.refresh_token = Some(token);
        self
    }

    pub fn with_scopes(mut self, scopes: Vec<String>) -> Self {
        self.scopes = scopes;
        self
    }

    pub fn with_expiry(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expiry) => now + Duration::seconds(EXPIRY_LEEWAY_SECS) >= expiry,
            None => false,
        }
    }

    /// Keep the refresh token when a refresh response omits it.
    pub fn merge_refreshed(&self, mut refreshed: Credential) -> Credential {
        if refreshed.refresh_token.is_none() {
            refreshed.refresh_token = self.refresh_token.clone();
        }
        if refreshed.scopes.is_empty() {
            refreshed.scopes = self.scopes.clone();
        }
        refreshed
    }
}

// Tokens stay out of logs
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("scopes", &self.scopes)
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [SessionState; 4] = [
        SessionState::SignedOut,
        SessionState::Authenticating,
        SessionState::Ready,
        SessionState::Error,
    ];

    #[test]
    fn test_signed_out_cannot_jump_to_ready() {
        assert!(!SessionState::SignedOut.can_transition_to(SessionState::Ready));
        assert!(!SessionState::SignedOut.can_transition_to(SessionState::Error));
    }

    #[test]
    fn test_no_self_transitions() {
        for state in ALL {
            assert!(!state.can_transition_to(state), "{state} -> {state}");
        }
    }

    #[test]
    fn test_ready_is_only_reached_through_authenticating() {
        for state in ALL {
            if state.can_transition_to(SessionState::Ready) {
                assert_eq!(state, SessionState::Authenticating);
            }
        }
    }

    #[test]
    fn test_credential_needs_refresh_near_expiry() {
        let now = Utc::now();
        let fresh = Credential::new("a".to_string()).with_expiry(now + Duration::minutes(10));
        let stale = Credential::new("a".to_string()).with_expiry(now + Duration::seconds(10));
        let unknown = Credential::new("a".to_string());

        assert!(!fresh.needs_refresh(now));
        assert!(stale.needs_refresh(now));
        assert!(!unknown.needs_refresh(now));
    }

    #[test]
    fn test_merge_refreshed_keeps_refresh_token() {
        let original = Credential::new("old".to_string())
            .with_refresh_token("refresh".to_string())
            .with_scopes(vec!["scope".to_string()]);
        let merged = original.merge_refreshed(Credential::new("new".to_string()));

        assert_eq!(merged.access_token, "new");
        assert_eq!(merged.refresh_token.as_deref(), Some("refresh"));
        assert_eq!(merged.scopes, vec!["scope".to_string()]);
    }

    #[test]
    fn test_credential_debug_redacts_tokens() {
        let credential =
            Credential::new("secret-access".to_string()).with_refresh_token("secret-refresh".to_string());
        let printed = format!("{:?}", credential);
        assert!(!printed.contains("secret-access"));
        assert!(!printed.contains("secret-refresh"));
    }
}
