//! Capability probe: can the installed engine mint a one-shot credential?
//!
//! Runs `yak check-secret-local-grpc --port <port>` under a deadline and
//! classifies the combined output into a [`ProcessOutcome`]. Every attempt
//! carries a generation token; an attempt superseded by a newer one resolves
//! to `None` so stale results never reach the state machine.

use crate::runner::{ProcessEvent, ProcessRunner, SpawnError};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, warn};
use yaklink_config::LinkConfig;
use yaklink_core::{OutcomeStatus, ProbePayload, ProcessOutcome};

const RETRY_DELAY: Duration = Duration::from_secs(1);

/// Port-conflict signatures across platforms: the engine's own message,
/// the Windows socket error, and the POSIX bind error.
static PORT_CONFLICT: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)port.*(occupied|in use)",
        r"(?i)only one usage of each socket address",
        r"(?i)address already in use",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

/// Opening marker of the structured payload block, capturing its random ID.
static JSON_OPEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"<json-([\w-]+)>").unwrap());

/// Fatal-log prefix or missing-file complaint from engines predating the
/// probe subcommand.
static OLD_VERSION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)\[FTAL\]|no such file or directory").unwrap());

pub struct CapabilityProbe {
    runner: ProcessRunner,
    config: LinkConfig,
    generation: AtomicU64,
}

impl CapabilityProbe {
    pub fn new(runner: ProcessRunner, config: LinkConfig) -> Self {
        Self {
            runner,
            config,
            generation: AtomicU64::new(0),
        }
    }

    /// Invalidate any in-flight attempt without starting a new one.
    pub fn supersede(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Probe the local engine on `port`.
    ///
    /// Returns `None` when a newer attempt superseded this one while it ran;
    /// otherwise exactly one [`ProcessOutcome`]. Timed-out attempts retry
    /// only when the config opts in.
    pub async fn probe_local(&self, port: u16) -> Option<ProcessOutcome> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.probe_once(port).await?;
            let timed_out = outcome.status == OutcomeStatus::Timeout;
            if timed_out && self.config.retry_on_timeout && attempt < self.config.max_probe_attempts
            {
                debug!(attempt, port, "probe timed out, retrying");
                tokio::time::sleep(RETRY_DELAY).await;
                continue;
            }
            return Some(outcome);
        }
    }

    async fn probe_once(&self, port: u16) -> Option<ProcessOutcome> {
        let token = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.runner
            .log(format!("----- probing engine capability on port {port} -----"));

        let args = vec![
            "check-secret-local-grpc".to_string(),
            "--port".to_string(),
            port.to_string(),
        ];
        let mut proc = match self.runner.spawn(&args) {
            Ok(proc) => proc,
            Err(SpawnError::Spawn(e)) => {
                return self.fence(
                    token,
                    ProcessOutcome::failure(OutcomeStatus::ProcessError, e.to_string()),
                );
            }
            Err(SpawnError::Setup(e)) => {
                return self.fence(
                    token,
                    ProcessOutcome::failure(OutcomeStatus::Exception, e.to_string()),
                );
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let deadline = tokio::time::sleep(self.config.probe_timeout);
        tokio::pin!(deadline);
        let mut streams_done = false;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    proc.kill_tree().await;
                    let outcome =
                        ProcessOutcome::failure(OutcomeStatus::Timeout, "capability probe timed out")
                            .with_raw_output(format!("{stdout}{stderr}"));
                    return self.fence(token, outcome);
                }
                event = proc.events.recv(), if !streams_done => match event {
                    Some(ProcessEvent::Stdout(line)) => {
                        stdout.push_str(&line);
                        stdout.push('\n');
                    }
                    Some(ProcessEvent::Stderr(line)) => {
                        stderr.push_str(&line);
                        stderr.push('\n');
                    }
                    None => streams_done = true,
                },
                status = proc.child.wait() => {
                    debug!(?status, port, "probe process exited");
                    break;
                }
            }
        }

        // The readers may still hold buffered lines; drain to EOF before
        // classifying. An inherited pipe can outlive the probe process and
        // keep the streams open, so the drain stays under the same deadline
        // and classifies with whatever arrived by then.
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                event = proc.events.recv() => match event {
                    Some(ProcessEvent::Stdout(line)) => {
                        stdout.push_str(&line);
                        stdout.push('\n');
                    }
                    Some(ProcessEvent::Stderr(line)) => {
                        stderr.push_str(&line);
                        stderr.push('\n');
                    }
                    None => break,
                },
            }
        }

        self.fence(token, classify(&stdout, &stderr, port))
    }

    fn fence(&self, token: u64, outcome: ProcessOutcome) -> Option<ProcessOutcome> {
        if self.generation.load(Ordering::SeqCst) == token {
            Some(outcome)
        } else {
            debug!("probe attempt superseded, discarding outcome");
            None
        }
    }
}

/// Classify a finished probe's output. Precedence, most to least specific:
/// port conflict, structured payload, old-version markers, silent death,
/// unknown.
fn classify(stdout: &str, stderr: &str, port: u16) -> ProcessOutcome {
    let combined = format!("{stdout}{stderr}");

    // A port conflict wins regardless of whatever else got printed.
    if PORT_CONFLICT.iter().any(|re| re.is_match(&combined)) {
        return ProcessOutcome::failure(
            OutcomeStatus::PortOccupied,
            format!("port {port} is already in use"),
        )
        .with_raw_output(combined);
    }

    if let Some(payload) = extract_payload(&combined) {
        if payload.ok {
            return ProcessOutcome::success("engine issued a local credential")
                .with_payload(payload)
                .with_raw_output(combined);
        }
        let reason = payload
            .reason
            .clone()
            .unwrap_or_else(|| "engine reported failure without a reason".to_string());
        return ProcessOutcome::failure(OutcomeStatus::GrpcError, reason)
            .with_payload(payload)
            .with_raw_output(combined);
    }

    if OLD_VERSION.is_match(&combined) {
        return ProcessOutcome::failure(
            OutcomeStatus::OldVersion,
            "engine binary predates the capability probe",
        )
        .with_raw_output(combined);
    }

    if stdout.is_empty() && stderr.is_empty() {
        return ProcessOutcome::failure(
            OutcomeStatus::AntivirusBlocked,
            "probe produced no output on either stream",
        );
    }

    ProcessOutcome::failure(OutcomeStatus::Unknown, "unrecognized probe output")
        .with_raw_output(combined)
}

/// Pull the JSON payload out of a `<json-ID>...</json-ID>` block.
///
/// The closing marker must carry the same ID as the opening one; payload
/// text between mismatched markers is ignored. A present-but-unparseable
/// payload is logged and treated as absent.
fn extract_payload(text: &str) -> Option<ProbePayload> {
    let captures = JSON_OPEN.captures(text)?;
    let id = captures.get(1)?.as_str();
    let body_start = captures.get(0)?.end();
    let closing = format!("</json-{id}>");
    let body_end = text[body_start..].find(&closing)? + body_start;

    match serde_json::from_str(text[body_start..body_end].trim()) {
        Ok(payload) => Some(payload),
        Err(e) => {
            warn!(error = %e, "probe payload block is not valid JSON");
            None
        }
    }
}
