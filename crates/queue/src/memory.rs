//! In-process queue for tests and single-process deployments.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};

use crate::{QueueError, message::QueueEntry, traits::TaskQueue};

#[derive(Default)]
struct Lists {
    ready: VecDeque<String>,
    delayed: Vec<QueueEntry>,
    next_id: i64,
}

#[derive(Default)]
pub struct MemoryQueue {
    lists: Mutex<Lists>,
    ready_signal: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn ready_len(&self) -> usize {
        self.lists.lock().await.ready.len()
    }

    pub async fn delayed_len(&self) -> usize {
        self.lists.lock().await.delayed.len()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn push_ready(&self, payload: String) -> Result<(), QueueError> {
        self.lists.lock().await.ready.push_back(payload);
        self.ready_signal.notify_one();
        Ok(())
    }

    async fn pop_ready(&self) -> Result<Option<String>, QueueError> {
        Ok(self.lists.lock().await.ready.pop_front())
    }

    async fn push_delayed(&self, payload: String) -> Result<(), QueueError> {
        let mut lists = self.lists.lock().await;
        lists.next_id += 1;
        let id = lists.next_id;
        lists.delayed.push(QueueEntry { id, payload });
        Ok(())
    }

    async fn scan_delayed(&self) -> Result<Vec<QueueEntry>, QueueError> {
        Ok(self.lists.lock().await.delayed.clone())
    }

    async fn remove_delayed(&self, id: i64) -> Result<bool, QueueError> {
        let mut lists = self.lists.lock().await;
        let before = lists.delayed.len();
        lists.delayed.retain(|e| e.id != id);
        Ok(lists.delayed.len() < before)
    }

    async fn wait_for_ready(&self, timeout: Duration) {
        if self.ready_len().await > 0 {
            return;
        }
        let _ = tokio::time::timeout(timeout, self.ready_signal.notified()).await;
    }
}
