//! Classified results of probe and launch attempts.
//!
//! Expected failures (an occupied port, an old engine, a timeout) are values
//! of [`OutcomeStatus`], not errors: every attempt resolves to exactly one
//! [`ProcessOutcome`] and the state machine picks the recovery path from it.

use serde::{Deserialize, Serialize};

/// Terminal classification of one probe or launch attempt (closed set).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    /// Attempt exceeded its deadline; the process was force-terminated.
    Timeout,
    /// The process could not be spawned or failed at the OS level.
    ProcessError,
    /// The process exited before producing a usable result.
    Exit,
    /// A fault during attempt setup, before the process was observable.
    Exception,
    /// The engine answered with a structured `ok: false` payload.
    GrpcError,
    /// Engine binary too old to support the diagnostic probe.
    OldVersion,
    PortOccupied,
    /// Both output streams empty and the process died; external
    /// interference (AV/firewall) suspected.
    AntivirusBlocked,
    /// Deliberate catch-all; raw output is retained for diagnostics.
    Unknown,
}

/// Structured payload embedded in probe output between `<json-ID>` markers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbePayload {
    pub ok: bool,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// The single result of one (non-superseded) process lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessOutcome {
    pub status: OutcomeStatus,
    pub message: String,
    pub payload: Option<ProbePayload>,
    /// Combined stdout+stderr, always retained so the UI can offer a
    /// "view log" path instead of failing opaquely.
    pub raw_output: String,
}

impl ProcessOutcome {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Success,
            message: message.into(),
            payload: None,
            raw_output: String::new(),
        }
    }

    pub fn failure(status: OutcomeStatus, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            payload: None,
            raw_output: String::new(),
        }
    }

    pub fn with_payload(mut self, payload: ProbePayload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_raw_output(mut self, raw: impl Into<String>) -> Self {
        self.raw_output = raw.into();
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_parses_with_missing_optional_fields() {
        let payload: ProbePayload = serde_json::from_str(r#"{"ok": false}"#).unwrap();
        assert!(!payload.ok);
        assert!(payload.reason.is_none());
        assert!(payload.secret.is_none());
    }

    #[test]
    fn payload_parses_full_success_shape() {
        let payload: ProbePayload = serde_json::from_str(
            r#"{"ok": true, "host": "127.0.0.1", "port": 8087, "secret": "pw", "version": "1.3.0"}"#,
        )
        .unwrap();
        assert!(payload.ok);
        assert_eq!(payload.port, Some(8087));
        assert_eq!(payload.version.as_deref(), Some("1.3.0"));
    }

    #[test]
    fn outcome_builders() {
        let outcome = ProcessOutcome::failure(OutcomeStatus::PortOccupied, "port 8087 in use")
            .with_raw_output("bind: address already in use");
        assert!(!outcome.is_success());
        assert_eq!(outcome.status, OutcomeStatus::PortOccupied);
        assert!(outcome.raw_output.contains("in use"));
    }
}
