use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::Serialize;
use serde_json::Value;
use std::collections::VecDeque;

/// An outbound event held while the transport is offline.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedEvent {
    pub id: String,
    pub name: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
}

/// FIFO buffer of events emitted while disconnected.
///
/// Ids are `<prefix>-<counter>`; the prefix is random per queue so ids stay
/// unique across transport instances in one process.
#[derive(Debug)]
pub struct OfflineQueue {
    events: VecDeque<QueuedEvent>,
    id_prefix: String,
    next_id: u64,
}

impl Default for OfflineQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineQueue {
    pub fn new() -> Self {
        let mut prefix_bytes = [0u8; 8];
        rand::rng().fill_bytes(&mut prefix_bytes);
        Self {
            events: VecDeque::new(),
            id_prefix: hex::encode(prefix_bytes),
            next_id: 0,
        }
    }

    /// Appends an event and returns its id.
    pub fn push(&mut self, name: impl Into<String>, payload: Value) -> String {
        self.next_id += 1;
        let id = format!("{}-{}", self.id_prefix, self.next_id);
        self.events.push_back(QueuedEvent {
            id: id.clone(),
            name: name.into(),
            payload,
            enqueued_at: Utc::now(),
        });
        id
    }

    pub fn front(&self) -> Option<&QueuedEvent> {
        self.events.front()
    }

    pub fn pop_front(&mut self) -> Option<QueuedEvent> {
        self.events.pop_front()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedEvent> {
        self.events.iter()
    }
}
