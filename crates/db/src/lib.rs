//! `db` crate: pure persistence layer.
//!
//! Provides a connection pool, typed row structs, repository functions for
//! every table in the dagflow schema, and the [`Store`] trait that the
//! engine talks to.  [`PgStore`] backs the trait with Postgres;
//! [`MemoryStore`] keeps everything in-process for tests and demos.
//! No business logic lives here: only the atomic primitives (insert-if-absent,
//! compare-and-swap status updates) the engine's correctness relies on.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::{FailPoint, MemoryStore};
pub use pool::DbPool;
pub use store::{PgStore, Store};
