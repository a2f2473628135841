//! # DACC Common Library
//!
//! Shared code for the DACC measure aggregation service:
//! - Database schema, migrations and queries
//! - Domain models (definitions, raw measures, aggregates)
//! - Statistical summaries and their incremental merge
//! - Configuration loading
//! - Time utilities

pub mod config;
pub mod db;
pub mod error;
pub mod stats;
pub mod time;

pub use error::{Error, Result};
