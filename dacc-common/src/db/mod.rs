//! Database schema and queries
//!
//! Query functions take a `&mut SqliteConnection` so callers can run several of
//! them inside one transaction (`&mut *tx`) or on a pooled connection.

pub mod aggregations;
pub mod definitions;
pub mod init;
mod keys;
pub mod migrations;
pub mod models;
pub mod raw_measures;
pub mod watermarks;

pub use init::{begin_immediate, init_database};
pub use models::*;
