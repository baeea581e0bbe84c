//! `engine` crate: domain models, DAG validation and readiness, and the
//! execution engine built on top of the `db`, `queue` and `nodes` crates.
//!
//! Two long-running components drive a run forward:
//! - [`DependencyScheduler`] finds ready nodes, creates their tasks and
//!   promotes matured retries;
//! - [`TaskDispatcher`] claims one task at a time and executes it.
//!
//! Both can run as many instances as needed; correctness rests on the
//! store's conditional writes, not on locks.

pub mod clock;
pub mod completion;
pub mod config;
pub mod context;
pub mod dag;
pub mod dispatcher;
pub mod error;
pub mod models;
pub mod notify;
pub mod retry;
pub mod runs;
pub mod scheduler;
pub mod spawn;
pub mod workflows;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::EngineConfig;
pub use context::EngineContext;
pub use dag::validate_dag;
pub use dispatcher::{DispatchOutcome, TaskDispatcher};
pub use error::EngineError;
pub use models::{Edge, NodeDefinition, Workflow, WorkflowDefinition};
pub use notify::{BroadcastEventSink, EngineEvent, EventSink, TracingEventSink};
pub use retry::RetryPolicy;
pub use runs::{RunDetails, cancel_run, get_run_details, start_run};
pub use scheduler::{DependencyScheduler, SchedulerReport};
pub use workflows::{parse_workflow, register_workflow};

#[cfg(test)]
mod engine_tests;
