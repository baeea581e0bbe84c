//! Shared handles passed to every engine component.

use std::sync::Arc;

use db::Store;
use nodes::NodeRegistry;
use queue::TaskQueue;
use uuid::Uuid;

use crate::{
    EngineError, Workflow,
    clock::{Clock, SystemClock},
    config::EngineConfig,
    notify::{EventSink, TracingEventSink},
};

/// Everything the scheduler, the dispatcher and the run boundaries need.
/// Cheap to clone.
#[derive(Clone)]
pub struct EngineContext {
    pub store: Arc<dyn Store>,
    pub queue: Arc<dyn TaskQueue>,
    pub registry: Arc<NodeRegistry>,
    pub events: Arc<dyn EventSink>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
}

impl EngineContext {
    /// Context with the system clock, tracing notifications and default
    /// configuration.
    pub fn new(store: Arc<dyn Store>, queue: Arc<dyn TaskQueue>, registry: NodeRegistry) -> Self {
        Self {
            store,
            queue,
            registry: Arc::new(registry),
            events: Arc::new(TracingEventSink),
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Fetch and parse a workflow version.
    pub async fn load_workflow(&self, id: Uuid) -> Result<Workflow, EngineError> {
        let row = self.store.get_workflow(id).await?;
        Workflow::try_from(row)
    }
}
