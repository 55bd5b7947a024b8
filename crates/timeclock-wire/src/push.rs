//! Push-protocol text formats.
//!
//! Terminals call the server on their own schedule with HTTP-style
//! requests: heartbeat/handshake `GET`s carrying query parameters, and
//! bulk-upload `POST`s whose bodies are newline-delimited, tab-separated
//! records. There is no per-line error channel back to the device, so
//! parsing is maximally permissive: malformed lines are dropped, never
//! surfaced as errors.

use chrono::NaiveDateTime;
use tracing::debug;

/// Timestamp format used on every text surface of the push protocol.
pub const PUNCH_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Parsed query parameters from a push-protocol request.
///
/// Keys are matched case-insensitively because firmware revisions disagree
/// on capitalization (`SN` vs `sn`, `Stamp` vs `stamp`).
#[derive(Debug, Clone, Default)]
pub struct QueryParams(Vec<(String, String)>);

impl QueryParams {
    /// Parse a raw query string (`SN=T100&options=all&pushver=2.4.1`).
    pub fn parse(raw: &str) -> Self {
        let pairs = raw
            .split('&')
            .filter(|part| !part.is_empty())
            .map(|part| match part.split_once('=') {
                Some((k, v)) => (percent_decode(k), percent_decode(v)),
                None => (percent_decode(part), String::new()),
            })
            .collect();
        Self(pairs)
    }

    /// Look up a parameter by key, case-insensitively.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }

    /// The terminal serial number, if present and non-empty.
    pub fn serial(&self) -> Option<&str> {
        self.get("SN").filter(|sn| !sn.trim().is_empty()).map(str::trim)
    }

    /// Whether the request asks for capability negotiation. The vendor
    /// sends `options=all`; some firmware sends `option=any`. Either key
    /// with any value counts.
    pub fn wants_options(&self) -> bool {
        self.get("options").is_some() || self.get("option").is_some()
    }
}

/// Minimal percent-decoding; `+` becomes a space. Invalid escapes are
/// passed through untouched rather than rejected.
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' => {
                if let (Some(hi), Some(lo)) = (
                    bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                    bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
                ) {
                    #[allow(clippy::cast_possible_truncation)]
                    out.push((hi * 16 + lo) as u8);
                    i += 3;
                } else {
                    out.push(b'%');
                    i += 1;
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Capability-negotiation response values.
///
/// Terminals parse this block strictly, so the encoder reproduces it
/// byte-for-byte per deployment; the defaults are the values every
/// production deployment has shipped with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalOptions {
    /// Seconds the terminal waits before retrying after an error reply.
    pub error_delay: u32,
    /// Seconds between heartbeat polls.
    pub delay: u32,
    /// Daily wall-clock times at which the terminal starts bulk transfers.
    pub trans_times: String,
    /// Minutes between incremental transfers.
    pub trans_interval: u32,
    /// Which tables the terminal is allowed to push.
    pub trans_flag: String,
    /// Whether punches should be pushed as they happen.
    pub realtime: bool,
}

impl Default for TerminalOptions {
    fn default() -> Self {
        Self {
            error_delay: 30,
            delay: 10,
            trans_times: "00:00;14:05".to_string(),
            trans_interval: 1,
            trans_flag: "TransData AttLog OpLog".to_string(),
            realtime: true,
        }
    }
}

impl TerminalOptions {
    /// Encode the configuration block sent in answer to a capability
    /// request. Line order and spelling are protocol-mandated.
    pub fn encode(&self, serial: &str) -> String {
        format!(
            "GET OPTION FROM: {serial}\n\
             ATTLOGStamp=None\n\
             OPERLOGStamp=9999\n\
             ATTPHOTOStamp=None\n\
             ErrorDelay={}\n\
             Delay={}\n\
             TransTimes={}\n\
             TransInterval={}\n\
             TransFlag={}\n\
             Realtime={}\n\
             Encrypt=None",
            self.error_delay,
            self.delay,
            self.trans_times,
            self.trans_interval,
            self.trans_flag,
            u8::from(self.realtime),
        )
    }
}

/// One successfully parsed punch-upload line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PunchLine {
    /// Employee identifier as reported, uppercased and trimmed.
    pub employee_id: String,
    pub timestamp: NaiveDateTime,
    /// Vendor in/out-mode code (see [`crate::event::punch_kind_from_code`]).
    pub mode_code: u16,
    pub status_code: Option<u16>,
    /// The raw line, preserved for audit.
    pub raw: String,
}

/// Parse a bulk punch-upload body.
///
/// Each data line is tab-separated: `employeeId \t timestamp \t inOutMode
/// [\t status]`. Empty lines and `table=` markers are skipped; lines with
/// too few fields, an unparsable timestamp, or a non-numeric mode are
/// dropped silently.
pub fn parse_punch_lines(body: &str) -> Vec<PunchLine> {
    body.lines().filter_map(parse_punch_line).collect()
}

fn parse_punch_line(line: &str) -> Option<PunchLine> {
    let trimmed = line.trim_end_matches('\r');
    if trimmed.trim().is_empty() || trimmed.trim_start().starts_with("table=") {
        return None;
    }

    let mut fields = trimmed.split('\t');
    let employee_id = fields.next()?.trim();
    let timestamp_raw = fields.next()?.trim();
    let mode_raw = fields.next()?.trim();
    let status_raw = fields.next().map(str::trim);

    if employee_id.is_empty() {
        debug!(line = trimmed, "dropping punch line with empty employee id");
        return None;
    }

    let Ok(timestamp) = NaiveDateTime::parse_from_str(timestamp_raw, PUNCH_TIME_FORMAT) else {
        debug!(line = trimmed, "dropping punch line with unparsable timestamp");
        return None;
    };

    let Ok(mode_code) = mode_raw.parse::<u16>() else {
        debug!(line = trimmed, "dropping punch line with non-numeric mode");
        return None;
    };

    Some(PunchLine {
        employee_id: employee_id.to_uppercase(),
        timestamp,
        mode_code,
        status_code: status_raw.and_then(|s| s.parse().ok()),
        raw: trimmed.to_string(),
    })
}
