//! Tundra: job-lifecycle coordination for an agent marketplace.

pub mod api;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod market;
pub mod registry;
pub mod router;
pub mod store;
