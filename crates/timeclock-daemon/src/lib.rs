//! Timeclock daemon library.
//!
//! Ingests punch events from biometric terminals over the ADMS-style push
//! protocol, pulls buffered punches over the vendor TCP control channel,
//! and converges users/fingerprint templates across all registered
//! terminals. Normalized events are forwarded to the external attendance
//! aggregation service; everything HR-side lives outside this daemon.

pub mod context;
pub mod convergence;
pub mod forward;
pub mod ingest;
pub mod ops;
pub mod storage;
pub mod sweep;
pub mod terminal;

pub use context::AppContext;
