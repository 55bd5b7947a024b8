//! Wire protocol codec for ADMS-style biometric terminals.
//!
//! Pure, stateless transformation functions with no I/O:
//! - `push` -- the HTTP-text push protocol (heartbeat queries, the
//!   capability/options block, tab-separated punch uploads)
//! - `kv` -- `KEY=value` payload lines (user info, biometric templates)
//! - `event` -- vendor in/out-mode codes mapped to punch kinds
//! - `frames` -- the binary control-channel codec (packet framing,
//!   checksums, record layouts, command frame builders)
//!
//! The terminal side of both protocols is vendor firmware that cannot be
//! changed, so parsers here are maximally permissive (malformed input is
//! dropped, never an error) while encoders are byte-exact and golden-tested.

pub mod event;
pub mod frames;
pub mod kv;
pub mod push;

pub use event::{PunchKind, punch_kind_from_code};
pub use frames::{AttRecord, FrameError, FreeSizes, Packet, TemplateFrame, UserRecord};
pub use push::{PunchLine, QueryParams, TerminalOptions};
