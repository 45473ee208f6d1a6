//! Namespace core: the relational store, the directory materializer, the
//! version ledger, the deletion engine and bucket aggregates, plus the
//! cache, lock and clock collaborators they rely on.

pub mod cache;
pub mod clock;
pub mod counter;
pub mod deletion;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod materializer;
pub mod namespace_service;
pub mod paths;
pub mod store;

#[cfg(test)]
pub(crate) mod test_support;
