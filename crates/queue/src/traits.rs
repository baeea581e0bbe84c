use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::warn;
use uuid::Uuid;

use crate::{
    QueueError,
    message::{DelayedMessage, QueueEntry, ReadyMessage},
};

/// Transport for task references.
///
/// Implementors supply the raw list operations; the typed helpers are
/// provided on top of them.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn push_ready(&self, payload: String) -> Result<(), QueueError>;

    /// Pop the oldest ready payload, if any.
    async fn pop_ready(&self) -> Result<Option<String>, QueueError>;

    async fn push_delayed(&self, payload: String) -> Result<(), QueueError>;

    /// Every delayed entry, oldest first.
    async fn scan_delayed(&self) -> Result<Vec<QueueEntry>, QueueError>;

    /// Remove one delayed entry.  `false` means another caller removed it first.
    async fn remove_delayed(&self, id: i64) -> Result<bool, QueueError>;

    /// Wait until the ready list may have work or `timeout` elapses.
    async fn wait_for_ready(&self, timeout: Duration) {
        tokio::time::sleep(timeout).await;
    }

    async fn enqueue(&self, task_id: Uuid) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&ReadyMessage { task_id })?;
        self.push_ready(payload).await
    }

    async fn schedule_retry(&self, task_id: Uuid, retry_at: DateTime<Utc>) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&DelayedMessage::new(task_id, retry_at))?;
        self.push_delayed(payload).await
    }

    /// Pop the next well-formed ready message.  Malformed payloads are
    /// logged and dropped.
    async fn dequeue(&self) -> Result<Option<ReadyMessage>, QueueError> {
        while let Some(payload) = self.pop_ready().await? {
            match serde_json::from_str::<ReadyMessage>(&payload) {
                Ok(msg) => return Ok(Some(msg)),
                Err(err) => warn!(%payload, error = %err, "dropping malformed ready message"),
            }
        }
        Ok(None)
    }

    /// Remove and return delayed messages whose `retry_at` has passed.
    ///
    /// Scans the whole delayed list.  An entry is returned only to the
    /// caller whose removal succeeded.  Malformed entries are discarded.
    async fn take_matured(
        &self,
        now: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<DelayedMessage>, QueueError> {
        let mut matured = Vec::new();
        for entry in self.scan_delayed().await? {
            if limit.is_some_and(|max| matured.len() >= max) {
                break;
            }
            match serde_json::from_str::<DelayedMessage>(&entry.payload) {
                Ok(msg) if msg.is_mature(now) => {
                    if self.remove_delayed(entry.id).await? {
                        matured.push(msg);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!(payload = %entry.payload, error = %err, "discarding malformed delayed message");
                    self.remove_delayed(entry.id).await?;
                }
            }
        }
        Ok(matured)
    }
}
