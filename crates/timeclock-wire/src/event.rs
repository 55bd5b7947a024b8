//! Punch event kinds and the vendor in/out-mode mapping.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Kind of a punch event, derived from the terminal's in/out-mode code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PunchKind {
    CheckIn,
    CheckOut,
    BreakOut,
    BreakIn,
    OvertimeIn,
    OvertimeOut,
}

impl PunchKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::CheckIn => "check-in",
            Self::CheckOut => "check-out",
            Self::BreakOut => "break-out",
            Self::BreakIn => "break-in",
            Self::OvertimeIn => "overtime-in",
            Self::OvertimeOut => "overtime-out",
        }
    }
}

impl std::fmt::Display for PunchKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Map a vendor in/out-mode code to a punch kind.
///
/// Total function: every input maps to a kind. Code 255 is the legacy
/// "console punch" value older firmware reports and maps to check-in
/// without complaint; any other unrecognized code also falls back to
/// check-in but is logged as protocol drift.
pub fn punch_kind_from_code(code: u16) -> PunchKind {
    match code {
        0 => PunchKind::CheckIn,
        1 => PunchKind::CheckOut,
        2 => PunchKind::BreakOut,
        3 => PunchKind::BreakIn,
        4 => PunchKind::OvertimeIn,
        5 => PunchKind::OvertimeOut,
        // Legacy firmware reports 255 for punches entered at the console.
        255 => PunchKind::CheckIn,
        other => {
            warn!(code = other, "unrecognized in/out-mode code, defaulting to check-in");
            PunchKind::CheckIn
        }
    }
}
