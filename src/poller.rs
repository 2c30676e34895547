use std::collections::HashSet;
use std::time::Duration;

use crate::error::Result;
use crate::session::SessionTicket;
use crate::types::{Feed, MessageSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchTrigger {
    Timer,
    Manual,
    SessionReady,
}

/// Handed out when a fetch starts and returned with its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket {
    generation: u64,
    pub session: SessionTicket,
}

/// Result of one fetch as seen by consumers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageBatch {
    /// Newest first. Only the unseen ones when "only new" is on.
    pub messages: Vec<MessageSummary>,
    /// Messages whose id was absent from the previous fetch.
    pub new_messages: Vec<MessageSummary>,
    /// Ids from the previous fetch that are gone now (read or archived
    /// elsewhere). Sorted.
    pub removed_ids: Vec<String>,
    pub unread_count: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollOutcome {
    Messages(MessageBatch),
    Failed(crate::error::NotifierError),
}

/// Polling bookkeeping. The timer itself lives with the owning task; this
/// decides whether a fetch may start and what a finished fetch means.
#[derive(Debug)]
pub struct MessagePoller {
    interval: Option<Duration>,
    generation: u64,
    in_flight: bool,
    only_new: bool,
    seen_ids: HashSet<String>,
}

impl MessagePoller {
    pub fn new(only_new: bool) -> Self {
        Self {
            interval: None,
            generation: 0,
            in_flight: false,
            only_new,
            seen_ids: HashSet::new(),
        }
    }

    pub fn start(&mut self, interval: Duration) {
        tracing::info!("Polling every {:?}", interval);
        self.interval = Some(interval);
    }

    /// Stop the timer. A fetch still in flight finishes but its result is
    /// thrown away.
    pub fn stop(&mut self) {
        if self.interval.take().is_some() {
            tracing::info!("Polling stopped");
        }
        self.generation += 1;
    }

    /// Forget everything learned from the current account.
    pub fn reset(&mut self) {
        self.generation += 1;
        self.seen_ids.clear();
    }

    pub fn is_running(&self) -> bool {
        self.interval.is_some()
    }

    pub fn in_flight(&self) -> bool {
        self.in_flight
    }

    pub fn try_begin(&mut self, trigger: FetchTrigger, session: SessionTicket) -> Option<FetchTicket> {
        if trigger == FetchTrigger::Timer && !self.is_running() {
            return None;
        }
        if self.in_flight {
            tracing::debug!("Skipping {:?} fetch: previous fetch still in flight", trigger);
            return None;
        }
        self.in_flight = true;
        tracing::debug!("Starting {:?} fetch", trigger);
        Some(FetchTicket {
            generation: self.generation,
            session,
        })
    }

    /// `None` when the result belongs to a stopped or reset run.
    pub fn complete(&mut self, ticket: FetchTicket, result: Result<Feed>) -> Option<PollOutcome> {
        self.in_flight = false;
        if ticket.generation != self.generation {
            tracing::debug!("Discarding result of a fetch started before stop");
            return None;
        }

        match result {
            Ok(feed) => {
                let new_messages: Vec<MessageSummary> = feed
                    .messages
                    .iter()
                    .filter(|m| !self.seen_ids.contains(&m.id))
                    .cloned()
                    .collect();
                let current: HashSet<String> =
                    feed.messages.iter().map(|m| m.id.clone()).collect();
                let mut removed_ids: Vec<String> =
                    self.seen_ids.difference(&current).cloned().collect();
                removed_ids.sort();
                self.seen_ids = current;

                let messages = if self.only_new {
                    new_messages.clone()
                } else {
                    feed.messages
                };
                Some(PollOutcome::Messages(MessageBatch {
                    messages,
                    new_messages,
                    removed_ids,
                    unread_count: feed.unread_count,
                }))
            }
            Err(e) => Some(PollOutcome::Failed(e)),
        }
    }
}
