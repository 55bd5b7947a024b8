//! Storage layer: device registry, punch log, golden record, protocol log.

mod db;
mod models;
mod queries;
mod queries_golden;

pub use db::{Database, DatabaseError};
pub use models::{
    Device, Fingerprint, GoldenUser, HealthSnapshot, NewPunch, ProtocolLogEntry, Punch,
    PunchInsertStats, SyncStatus,
};
pub use queries::PunchFilter;
pub use queries_golden::HarvestedUser;
