//! Database connection and initialization.

pub use timeclock_core::db::DatabaseError;

timeclock_core::define_database!(Database, "Database migrations complete");
