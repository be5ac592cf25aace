//! Database module for Uptrail.
//!
//! Provides SQLite storage with an embedded schema migration.

mod incidents;
mod models;
mod store;

pub use models::*;
pub use store::*;
