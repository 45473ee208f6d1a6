//! Core data models of the nameserver.
//!
//! These entities describe buckets and the virtual directory tree of their
//! objects. They map cleanly to database tables via `sqlx::FromRow` and
//! serialize naturally as JSON via `serde`.

pub mod bucket;
pub mod object;
