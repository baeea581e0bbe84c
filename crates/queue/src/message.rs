//! JSON wire messages.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Entry on the ready list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadyMessage {
    pub task_id: Uuid,
}

/// Entry on the delayed list.  `retry_at` is epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayedMessage {
    pub task_id: Uuid,
    pub retry_at: i64,
}

impl DelayedMessage {
    pub fn new(task_id: Uuid, retry_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            retry_at: retry_at.timestamp_millis(),
        }
    }

    pub fn retry_at(&self) -> Option<DateTime<Utc>> {
        Utc.timestamp_millis_opt(self.retry_at).single()
    }

    pub fn is_mature(&self, now: DateTime<Utc>) -> bool {
        self.retry_at <= now.timestamp_millis()
    }
}

/// A raw delayed-list entry: backend id plus the undecoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueEntry {
    pub id: i64,
    pub payload: String,
}
