//! Control-channel error type.

use thiserror::Error;
use timeclock_wire::FrameError;

/// Errors from one terminal session.
#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("terminal did not answer within the timeout")]
    Timeout,

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("terminal refused command {command}: reply {reply}")]
    Refused { command: u16, reply: u16 },

    #[error("protocol violation: {0}")]
    Protocol(String),
}
