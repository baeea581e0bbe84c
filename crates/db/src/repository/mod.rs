//! Repository functions: one function per database operation.
//!
//! Every function takes a `&DbPool` and returns a `Result<T, DbError>`.
//! No business logic, no domain types: pure SQL.  Status transitions that
//! may race are written as conditional updates and report the loser as
//! `Ok(None)` rather than an error.

pub mod dead_letters;
pub mod logs;
pub mod runs;
pub mod tasks;
pub mod workflows;
