//! `queue` crate: task references waiting to be dispatched.
//!
//! Two lists:
//! - the *ready* list, a FIFO of `{"taskId": …}` messages consumed by
//!   dispatchers;
//! - the *delayed* list of `{"taskId": …, "retryAt": …}` messages holding
//!   tasks in backoff until the scheduler promotes them.
//!
//! The queue only carries references.  The task row in the store stays the
//! source of truth, so a lost, duplicated or stale message is harmless.

pub mod error;
pub mod memory;
pub mod message;
pub mod postgres;
pub mod traits;

pub use error::QueueError;
pub use memory::MemoryQueue;
pub use message::{DelayedMessage, QueueEntry, ReadyMessage};
pub use postgres::PgQueue;
pub use traits::TaskQueue;
