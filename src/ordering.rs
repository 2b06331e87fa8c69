//!
//! This module defines the per-topic manager that validates ordering metadata and
//! collapses duplicate publishes on ordered topics.
//!
use crate::error::ConfigError;
use crate::message::Message;
use crate::topic::Topic;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Derives a deduplication key from message content.
pub fn content_dedup_key(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    hex::encode(hasher.finalize())
}

#[derive(Debug)]
struct DedupRecord {
    dedup_key: String,
    first_seen_at: Instant,
}

/// Outcome of offering a message to the manager.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Admission {
    /// First sighting within the window; the message must be fanned out.
    Admitted { dedup_key: String },

    /// Already delivered; the publish is acknowledged without new deliveries.
    Duplicate { dedup_key: String },
}

pub(crate) struct OrderingManager {
    topic_id: String,
    window: Duration,
    content_based_dedup: bool,

    /// dedup key -> first seen
    records: HashMap<String, Instant>,

    /// Records in first-seen order, so expiry only ever looks at the front.
    expiry: VecDeque<DedupRecord>,
}

impl OrderingManager {
    pub(crate) fn new(topic: &Topic) -> Self {
        OrderingManager {
            topic_id: topic.id().to_owned(),
            window: topic.dedup_window(),
            content_based_dedup: topic.content_based_dedup(),
            records: HashMap::new(),
            expiry: VecDeque::new(),
        }
    }

    /// Validates ordering metadata and records the dedup key.
    ///
    /// # Errors
    /// Raise ConfigError::MissingGroupId when the message carries no group id, and
    /// ConfigError::MissingDedupKey when no key is supplied and content based deduplication is off.
    /// A rejected message leaves no record behind.
    pub(crate) fn admit(&mut self, message: &Message, now: Instant) -> Result<Admission, ConfigError> {
        match message.group_id() {
            Some(group_id) if !group_id.is_empty() => {}
            _ => {
                return Err(ConfigError::MissingGroupId {
                    topic: self.topic_id.clone(),
                })
            }
        }

        let dedup_key = match message.dedup_key() {
            Some(key) if !key.is_empty() => key.to_owned(),
            _ if self.content_based_dedup => content_dedup_key(message.body()),
            _ => {
                return Err(ConfigError::MissingDedupKey {
                    topic: self.topic_id.clone(),
                })
            }
        };

        self.purge_expired(now);

        if self.records.contains_key(&dedup_key) {
            return Ok(Admission::Duplicate { dedup_key });
        }

        self.records.insert(dedup_key.clone(), now);
        self.expiry.push_back(DedupRecord {
            dedup_key: dedup_key.clone(),
            first_seen_at: now,
        });
        Ok(Admission::Admitted { dedup_key })
    }

    fn purge_expired(&mut self, now: Instant) {
        while let Some(record) = self.expiry.front() {
            if now.saturating_duration_since(record.first_seen_at) < self.window {
                break;
            }
            if let Some(record) = self.expiry.pop_front() {
                self.records.remove(&record.dedup_key);
                debug!(topic = %self.topic_id, dedup_key = %record.dedup_key, "Dedup record expired");
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn tracked(&self) -> usize {
        self.records.len()
    }
}
