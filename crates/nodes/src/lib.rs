//! `nodes` crate: the `ExecutableNode` trait, the handler registry and the
//! built-in node types.
//!
//! Every node type must implement [`ExecutableNode`].  The engine resolves a
//! node's `type` through [`NodeRegistry`] and dispatches through the trait
//! object, so new types register without touching the dispatcher.

pub mod builtin;
pub mod error;
pub mod mock;
pub mod registry;
pub mod traits;

pub use error::NodeError;
pub use registry::NodeRegistry;
pub use traits::{ExecutableNode, ExecutionContext};
