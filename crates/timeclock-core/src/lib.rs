//! Timeclock core library
//!
//! Shared plumbing for the timeclock daemon:
//! - SQLite pool creation and the `define_database!` macro
//! - Common database error type
//! - Tracing/logging initialization

pub mod db;
pub mod tracing_init;

pub use db::{DatabaseError, unix_timestamp};
