//! Task / run state-change notifications.
//!
//! Publishing never blocks and never fails from the engine's point of view;
//! a sink with no listeners simply drops the event.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

use db::models::{RunRow, RunStatus, TaskRow, TaskStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    TaskChanged {
        task_id: Uuid,
        run_id: Uuid,
        node_id: String,
        status: TaskStatus,
    },
    RunChanged {
        run_id: Uuid,
        status: RunStatus,
    },
}

impl EngineEvent {
    pub fn task(task: &TaskRow) -> Self {
        Self::TaskChanged {
            task_id: task.id,
            run_id: task.run_id,
            node_id: task.node_id.clone(),
            status: task.status,
        }
    }

    pub fn run(run: &RunRow) -> Self {
        Self::RunChanged {
            run_id: run.id,
            status: run.status,
        }
    }
}

pub trait EventSink: Send + Sync {
    fn publish(&self, event: EngineEvent);
}

/// Writes every event as a `debug` trace.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: EngineEvent) {
        match &event {
            EngineEvent::TaskChanged { task_id, run_id, node_id, status } => {
                debug!(%task_id, %run_id, %node_id, %status, "task changed");
            }
            EngineEvent::RunChanged { run_id, status } => {
                debug!(%run_id, %status, "run changed");
            }
        }
    }
}

/// Fans events out to any number of `tokio::sync::broadcast` subscribers.
#[derive(Debug, Clone)]
pub struct BroadcastEventSink {
    sender: broadcast::Sender<EngineEvent>,
}

impl BroadcastEventSink {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }
}

impl EventSink for BroadcastEventSink {
    fn publish(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}
