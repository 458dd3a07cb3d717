//! # Subscription Registry
//!
//! Keeps the set of topics a channel group wants, independently of whether a
//! connection is currently up. STOMP subscriptions die with the connection,
//! so every reconnect re-issues all of them under fresh ids rather than
//! trying to resume the old ones.
//!
//! The registry itself does no I/O. Mutations return the frames the caller
//! should put on the wire, tagged with the connection generation they were
//! computed for, so a request that races with a reconnect can be recognised
//! as stale and dropped.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use crate::core::topics::TopicClass;
use crate::error::DecodeError;

/// Receives the raw body of every `MESSAGE` on its topic. Returning an error
/// means "this one frame was bad"; the connection logs it and moves on.
pub type TopicHandler = Arc<dyn Fn(&str) -> Result<(), DecodeError> + Send + Sync>;

/// Registry shared between a channel group handle and its connection task.
pub type SharedRegistry = Arc<Mutex<SubscriptionRegistry>>;

struct Subscription {
    class: TopicClass,
    handler: TopicHandler,
    /// STOMP subscription id while live on the current connection.
    live_id: Option<String>,
}

/// A SUBSCRIBE the connection should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveSubscribe {
    pub generation: u64,
    pub id: String,
    pub topic: String,
}

/// An UNSUBSCRIBE the connection should send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiveUnsubscribe {
    pub generation: u64,
    pub id: String,
}

#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<String, Subscription>,
    /// `Some` while attached to a live connection.
    generation: Option<u64>,
    generations_issued: u64,
    ids_issued: u64,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> SharedRegistry {
        Arc::new(Mutex::new(Self::new()))
    }

    /// Registers (or re-registers) `topic`.
    ///
    /// Returns the SUBSCRIBE to send when a connection is live and the topic
    /// is not already subscribed on it. On an inactive connection the topic
    /// is queued and goes out with the next [`resubscribe_all`].
    ///
    /// [`resubscribe_all`]: SubscriptionRegistry::resubscribe_all
    pub fn subscribe(&mut self, topic: impl Into<String>, class: TopicClass, handler: TopicHandler) -> Option<LiveSubscribe> {
        let topic = topic.into();
        if let Some(existing) = self.entries.get_mut(&topic) {
            existing.class = class;
            existing.handler = handler;
            if existing.live_id.is_some() {
                tracing::debug!(topic = %topic, "Handler replaced on live subscription");
                return None;
            }
        } else {
            self.entries.insert(
                topic.clone(),
                Subscription {
                    class,
                    handler,
                    live_id: None,
                },
            );
        }

        let Some(generation) = self.generation else {
            tracing::debug!(topic = %topic, "Connection inactive; subscription queued");
            return None;
        };
        let id = self.issue_id();
        if let Some(entry) = self.entries.get_mut(&topic) {
            entry.live_id = Some(id.clone());
        }
        Some(LiveSubscribe { generation, id, topic })
    }

    /// Forgets `topic`. It will never be replayed. Returns the UNSUBSCRIBE to
    /// send if the topic was live.
    pub fn unsubscribe(&mut self, topic: &str) -> Option<LiveUnsubscribe> {
        let removed = self.entries.remove(topic)?;
        let generation = self.generation?;
        removed.live_id.map(|id| LiveUnsubscribe { generation, id })
    }

    /// Attaches to a fresh connection and re-issues every registered topic
    /// under new ids.
    pub fn resubscribe_all(&mut self) -> Vec<LiveSubscribe> {
        self.generations_issued += 1;
        let generation = self.generations_issued;
        self.generation = Some(generation);

        let topics: Vec<String> = self.entries.keys().cloned().collect();
        let mut out = Vec::with_capacity(topics.len());
        for topic in topics {
            let id = self.issue_id();
            if let Some(entry) = self.entries.get_mut(&topic) {
                entry.live_id = Some(id.clone());
            }
            out.push(LiveSubscribe { generation, id, topic });
        }
        out
    }

    /// The connection went away. Everything becomes queued again.
    pub fn detach(&mut self) {
        self.generation = None;
        for entry in self.entries.values_mut() {
            entry.live_id = None;
        }
    }

    pub fn is_current(&self, generation: u64) -> bool {
        self.generation == Some(generation)
    }

    /// Finds the handler for an inbound MESSAGE, by subscription id first and
    /// destination second.
    pub fn route(&self, subscription_id: Option<&str>, destination: Option<&str>) -> Option<(String, TopicClass, TopicHandler)> {
        if let Some(id) = subscription_id {
            let hit = self
                .entries
                .iter()
                .find(|(_, s)| s.live_id.as_deref() == Some(id));
            if let Some((topic, s)) = hit {
                return Some((topic.clone(), s.class, Arc::clone(&s.handler)));
            }
        }
        let topic = destination?;
        self.entries
            .get(topic)
            .map(|s| (topic.to_string(), s.class, Arc::clone(&s.handler)))
    }

    pub fn topics(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn issue_id(&mut self) -> String {
        self.ids_issued += 1;
        format!("sub-{}", self.ids_issued)
    }
}
