//! Subscription registry
//!
//! Tracks which project / calendar topics this client is interested in.
//! The registry only holds local interest; the manager sends the matching
//! control frames and re-issues every subscription after a reconnect, since
//! the server forgets them when the transport drops.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use tracing::debug;

/// Subscription key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "lowercase")]
pub enum Topic {
    /// Project-level changes, keyed by project id
    Project(String),
    /// Schedule changes inside a project calendar, keyed by project id
    Calendar(String),
}

impl Topic {
    pub fn kind(&self) -> &'static str {
        match self {
            Topic::Project(_) => "project",
            Topic::Calendar(_) => "calendar",
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Topic::Project(id) | Topic::Calendar(id) => id,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind(), self.id())
    }
}

/// Local interest set
///
/// Ordered so that re-subscription after a reconnect is deterministic.
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    topics: BTreeSet<Topic>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` when the topic was not present before
    pub fn subscribe(&mut self, topic: Topic) -> bool {
        let added = self.topics.insert(topic.clone());
        debug!("subscribe {} (new: {}), total: {}", topic, added, self.topics.len());
        added
    }

    /// Returns `true` when the topic was present
    pub fn unsubscribe(&mut self, topic: &Topic) -> bool {
        let removed = self.topics.remove(topic);
        debug!("unsubscribe {} (removed: {}), remaining: {}", topic, removed, self.topics.len());
        removed
    }

    pub fn contains(&self, topic: &Topic) -> bool {
        self.topics.contains(topic)
    }

    /// Whether an inbound event scoped to `topic` should reach subscribers.
    /// Events without a topic are always delivered.
    pub fn is_interested(&self, topic: Option<&Topic>) -> bool {
        match topic {
            Some(topic) => self.topics.contains(topic),
            None => true,
        }
    }

    /// Every topic currently subscribed, in stable order
    pub fn topics(&self) -> Vec<Topic> {
        self.topics.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}
