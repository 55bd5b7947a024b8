//! Outbound forwarding to the attendance-aggregation service.
//!
//! Every batch of newly-accepted punches is POSTed to the configured
//! endpoint, authenticated by a shared static secret in a custom header.
//! Forwarding is an at-least-once notification, not a transaction: it runs
//! fire-and-forget off the caller's task, and failures are logged without
//! touching local durability.

use chrono::DateTime;
use reqwest::header::{HeaderMap, HeaderValue};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use timeclock_wire::PunchKind;

use crate::storage::NewPunch;

/// Header carrying the shared forwarding secret.
pub const SECRET_HEADER: &str = "X-Attendance-Secret";

/// Forwarder configuration/client errors.
#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid forwarding secret")]
    InvalidSecret,

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

/// One forwarded punch event, as the aggregation service documents it.
#[derive(Debug, Clone, Serialize)]
pub struct ForwardedPunch {
    pub employee_id: String,
    /// `%Y-%m-%d %H:%M:%S`, the same text form the terminals report.
    pub timestamp: String,
    pub kind: PunchKind,
    pub device_serial: String,
    pub device_name: String,
}

impl From<&NewPunch> for ForwardedPunch {
    fn from(punch: &NewPunch) -> Self {
        let timestamp = DateTime::from_timestamp(punch.punched_at, 0)
            .map(|t| {
                t.naive_utc()
                    .format(timeclock_wire::push::PUNCH_TIME_FORMAT)
                    .to_string()
            })
            .unwrap_or_default();
        Self {
            employee_id: punch.employee_id.clone(),
            timestamp,
            kind: punch.kind,
            device_serial: punch.device_serial.clone(),
            device_name: punch.device_name.clone(),
        }
    }
}

/// Fire-and-forget HTTP client for the aggregation service.
#[derive(Debug, Clone)]
pub struct Forwarder {
    http: reqwest::Client,
    endpoint: Option<String>,
}

impl Forwarder {
    /// Create a forwarder. `endpoint = None` disables forwarding entirely
    /// (standalone deployments keep the punch log locally).
    pub fn new(endpoint: Option<String>, secret: &str) -> Result<Self, ForwardError> {
        let mut headers = HeaderMap::new();
        if !secret.is_empty() {
            let value =
                HeaderValue::from_str(secret).map_err(|_| ForwardError::InvalidSecret)?;
            headers.insert(SECRET_HEADER, value);
        }

        let http = reqwest::Client::builder().default_headers(headers).build()?;

        Ok(Self {
            http,
            endpoint: endpoint.filter(|e| !e.is_empty()),
        })
    }

    /// A forwarder that drops everything (tests, standalone mode).
    pub fn disabled() -> Self {
        Self {
            http: reqwest::Client::new(),
            endpoint: None,
        }
    }

    pub const fn is_enabled(&self) -> bool {
        self.endpoint.is_some()
    }

    /// Forward a batch of newly-accepted punches off-task. Never blocks the
    /// caller; non-2xx and transport failures are logged only.
    pub fn spawn_forward(&self, punches: &[NewPunch]) {
        let Some(endpoint) = self.endpoint.clone() else {
            return;
        };
        if punches.is_empty() {
            return;
        }

        let batch: Vec<ForwardedPunch> = punches.iter().map(ForwardedPunch::from).collect();
        let http = self.http.clone();

        tokio::spawn(async move {
            let count = batch.len();
            match http.post(&endpoint).json(&batch).send().await {
                Ok(response) if response.status().is_success() => {
                    debug!(count, "Forwarded punch batch");
                }
                Ok(response) => {
                    warn!(
                        count,
                        status = response.status().as_u16(),
                        "Aggregation service rejected punch batch"
                    );
                }
                Err(e) => {
                    warn!(count, error = %e, "Failed to forward punch batch");
                }
            }
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample(at: i64) -> NewPunch {
        NewPunch {
            employee_id: "E001".to_string(),
            punched_at: at,
            kind: PunchKind::CheckIn,
            device_serial: "T100".to_string(),
            device_name: "Lobby".to_string(),
            payload: String::new(),
        }
    }

    #[test]
    fn timestamp_formats_as_wire_text() {
        // 2024-01-10 09:00:00 naive == 1704877200 seconds since epoch
        let forwarded = ForwardedPunch::from(&sample(1_704_877_200));
        assert_eq!(forwarded.timestamp, "2024-01-10 09:00:00");
    }

    #[test]
    fn disabled_forwarder_is_inert() {
        let forwarder = Forwarder::disabled();
        assert!(!forwarder.is_enabled());
        // Must not panic outside a runtime: the endpoint check precedes spawn.
        forwarder.spawn_forward(&[sample(0)]);
    }

    #[test]
    fn empty_endpoint_disables() {
        let forwarder = Forwarder::new(Some(String::new()), "s").unwrap();
        assert!(!forwarder.is_enabled());
    }

    #[test]
    fn non_ascii_secret_rejected() {
        assert!(matches!(
            Forwarder::new(Some("http://x".to_string()), "sé\ncret"),
            Err(ForwardError::InvalidSecret)
        ));
    }

    #[test]
    fn batch_serializes_per_contract() {
        let json = serde_json::to_value(vec![ForwardedPunch::from(&sample(1_704_877_200))]).unwrap();
        let first = &json[0];
        assert_eq!(first["employee_id"], "E001");
        assert_eq!(first["kind"], "check-in");
        assert_eq!(first["device_serial"], "T100");
    }
}
