use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;

use crate::error::{NotifierError, Result};
use crate::types::{AtomEntry, AtomFeed, Feed, MessageSummary};

// Seam between the poller and the network so fetches can be mocked
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MailFeed: Send + Sync {
    /// One authenticated round-trip. HTTP 401 maps to `Unauthorized`;
    /// every other failure maps to `FetchError`.
    async fn fetch(&self, access_token: &str) -> Result<Feed>;
}

pub struct GmailFeedClient {
    client: reqwest::Client,
    feed_url: String,
}

impl GmailFeedClient {
    pub fn new(client: reqwest::Client, feed_url: String) -> Self {
        Self { client, feed_url }
    }
}

#[async_trait]
impl MailFeed for GmailFeedClient {
    async fn fetch(&self, access_token: &str) -> Result<Feed> {
        let response = self
            .client
            .get(&self.feed_url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| NotifierError::fetch(e.to_string()))?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(NotifierError::Unauthorized),
            status if status.is_success() => {
                let body = response
                    .text()
                    .await
                    .map_err(|e| NotifierError::fetch(e.to_string()))?;
                parse_feed(&body)
            }
            status => Err(NotifierError::fetch(format!(
                "Failed to fetch feed: {}",
                status
            ))),
        }
    }
}

/// Parse a Gmail Atom document into summaries ordered newest first.
pub fn parse_feed(xml: &str) -> Result<Feed> {
    let raw: AtomFeed =
        quick_xml::de::from_str(xml).map_err(|e| NotifierError::fetch(format!("malformed feed: {}", e)))?;

    let mut messages = raw
        .entries
        .iter()
        .map(summary_from_entry)
        .collect::<Result<Vec<_>>>()?;
    // Stable, so entries with equal timestamps keep server order
    messages.sort_by(|a, b| b.received_at.cmp(&a.received_at));

    let unread_count = raw.fullcount.unwrap_or(messages.len() as u32);
    Ok(Feed {
        messages,
        unread_count,
    })
}

fn summary_from_entry(entry: &AtomEntry) -> Result<MessageSummary> {
    let id = entry
        .id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| NotifierError::fetch("feed entry without id"))?
        .to_string();

    let timestamp = entry
        .issued
        .as_deref()
        .or(entry.modified.as_deref())
        .ok_or_else(|| NotifierError::fetch(format!("entry {} has no timestamp", id)))?;
    let received_at = DateTime::parse_from_rfc3339(timestamp.trim())
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| NotifierError::fetch(format!("entry {} has bad timestamp: {}", id, e)))?;

    let author = match &entry.author {
        Some(author) => match (author.name.as_deref(), author.email.as_deref()) {
            (Some(name), Some(email)) if !name.is_empty() => format!("{} <{}>", name, email),
            (_, Some(email)) => email.to_string(),
            (Some(name), None) => name.to_string(),
            (None, None) => "(unknown sender)".to_string(),
        },
        None => "(unknown sender)".to_string(),
    };

    Ok(MessageSummary {
        id,
        received_at,
        subject: entry
            .title
            .clone()
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| "(no subject)".to_string()),
        author,
        snippet: entry.summary.clone().unwrap_or_default(),
        url: entry
            .link
            .as_ref()
            .and_then(|link| link.href.clone())
            .unwrap_or_default(),
    })
}
