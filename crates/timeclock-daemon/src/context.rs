//! Shared daemon state threaded through the HTTP handlers and the
//! background tasks.

use std::time::Duration;

use tokio::sync::mpsc;

use timeclock_wire::TerminalOptions;

use crate::forward::Forwarder;
use crate::storage::Database;
use crate::sweep::SweepCommand;

/// Everything the request handlers and sweeps share. All mutable state
/// lives behind the database; the context itself is cheap to clone
/// through an `Arc`.
pub struct AppContext {
    pub db: Database,
    pub forwarder: Forwarder,
    /// Capability-negotiation values sent to terminals; static per
    /// deployment.
    pub options: TerminalOptions,
    /// Bound on every control-channel operation against one terminal.
    pub terminal_timeout: Duration,
    /// Hands manual sync requests to the scheduler task so device sweeps
    /// stay strictly sequential.
    pub sweep_tx: mpsc::Sender<SweepCommand>,
}

impl AppContext {
    pub fn new(
        db: Database,
        forwarder: Forwarder,
        terminal_timeout: Duration,
        sweep_tx: mpsc::Sender<SweepCommand>,
    ) -> Self {
        Self {
            db,
            forwarder,
            options: TerminalOptions::default(),
            terminal_timeout,
            sweep_tx,
        }
    }
}
