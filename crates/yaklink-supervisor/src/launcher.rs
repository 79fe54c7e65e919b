//! Server-mode engine launch.
//!
//! Starts `yak grpc` with the credential the probe minted and watches stdout
//! for the readiness sentinel. Once the sentinel appears the process is
//! detached and keeps running on its own; the watchdog takes over from
//! there. Launches share the probe's generation-fencing scheme.

use crate::runner::{ProcessEvent, ProcessRunner, SpawnError, SpawnedProcess};
use once_cell::sync::Lazy;
use regex::Regex;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};
use yaklink_config::LinkConfig;
use yaklink_core::{LinkEvent, OutcomeStatus, ProcessOutcome};

/// Printed by the engine once its gRPC server is accepting connections.
static SENTINEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)yak grpc ok").unwrap());

pub struct EngineLauncher {
    runner: ProcessRunner,
    config: LinkConfig,
    generation: AtomicU64,
}

impl EngineLauncher {
    pub fn new(runner: ProcessRunner, config: LinkConfig) -> Self {
        Self {
            runner,
            config,
            generation: AtomicU64::new(0),
        }
    }

    /// Invalidate any in-flight launch without starting a new one.
    pub fn supersede(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Launch the engine in server mode on `port`, guarded by `password`.
    ///
    /// Resolves to `Some(Success)` once the readiness sentinel shows up on
    /// stdout, at which point the engine is left running. Every failure
    /// kills the process first. `None` means a newer launch superseded this
    /// one; its engine is killed too, since it would squat on the port.
    pub async fn launch(&self, port: u16, password: &str) -> Option<ProcessOutcome> {
        let token = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.runner
            .log(format!("----- starting local engine on port {port} -----"));

        let args = self.build_args(port, password);
        let mut proc = match self.runner.spawn(&args) {
            Ok(proc) => proc,
            Err(err) => {
                let (status, message) = match err {
                    SpawnError::Spawn(e) => (OutcomeStatus::ProcessError, e.to_string()),
                    SpawnError::Setup(e) => (OutcomeStatus::Exception, e.to_string()),
                };
                self.runner
                    .bus()
                    .publish(LinkEvent::LaunchError(message.clone()));
                return self
                    .fence(token, ProcessOutcome::failure(status, message), None)
                    .await_kill()
                    .await;
            }
        };

        let mut stdout = String::new();
        let mut stderr = String::new();
        let deadline = tokio::time::sleep(self.config.launch_timeout);
        tokio::pin!(deadline);
        let mut streams_done = false;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    proc.kill_tree().await;
                    let outcome = ProcessOutcome::failure(
                        OutcomeStatus::Timeout,
                        "engine did not report readiness in time",
                    )
                    .with_raw_output(format!("{stdout}{stderr}"));
                    return self.fence(token, outcome, None).await_kill().await;
                }
                event = proc.events.recv(), if !streams_done => match event {
                    Some(ProcessEvent::Stdout(line)) => {
                        let ready = SENTINEL.is_match(&line);
                        stdout.push_str(&line);
                        stdout.push('\n');
                        if ready {
                            info!(port, "engine reported grpc readiness");
                            let outcome = ProcessOutcome::success("engine is serving")
                                .with_raw_output(format!("{stdout}{stderr}"));
                            return self.fence(token, outcome, Some(proc)).await_kill().await;
                        }
                    }
                    Some(ProcessEvent::Stderr(line)) => {
                        stderr.push_str(&line);
                        stderr.push('\n');
                    }
                    None => streams_done = true,
                },
                status = proc.child.wait() => {
                    debug!(?status, port, "engine exited before readiness");
                    // A leftover child process can keep the pipes open past
                    // the exit, so the drain stays under the launch deadline.
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
                    let raw = format!("{stdout}{stderr}");
                    let code = status.ok().and_then(|s| s.code());
                    self.runner
                        .bus()
                        .publish(LinkEvent::LaunchError(raw.trim().to_string()));
                    let outcome = ProcessOutcome::failure(
                        OutcomeStatus::Exit,
                        match code {
                            Some(code) => format!("engine exited with code {code} before readiness"),
                            None => "engine was terminated before readiness".to_string(),
                        },
                    )
                    .with_raw_output(raw);
                    return self.fence(token, outcome, None).await_kill().await;
                }
            }
        }
    }

    fn fence(
        &self,
        token: u64,
        outcome: ProcessOutcome,
        proc: Option<SpawnedProcess>,
    ) -> FencedLaunch {
        if self.generation.load(Ordering::SeqCst) == token {
            if let Some(proc) = proc {
                proc.detach();
            }
            FencedLaunch::Current(outcome)
        } else {
            debug!("launch attempt superseded, discarding outcome");
            FencedLaunch::Superseded(proc)
        }
    }

    pub(crate) fn build_args(&self, port: u16, password: &str) -> Vec<String> {
        let mut args = vec![
            "grpc".to_string(),
            "--local-password".to_string(),
            password.to_string(),
            "--frontend".to_string(),
            self.config.frontend.clone(),
            "--port".to_string(),
            port.to_string(),
        ];
        if let Some((profile_db, project_db)) = &self.config.database_pair {
            args.push("--profile-db".to_string());
            args.push(profile_db.to_string_lossy().into_owned());
            args.push("--project-db".to_string());
            args.push(project_db.to_string_lossy().into_owned());
        }
        if self.config.disable_output {
            args.push("--disable-output".to_string());
        }
        args
    }
}

/// A fenced launch result. A superseded attempt still owns its process and
/// must kill it before resolving, which needs an await.
enum FencedLaunch {
    Current(ProcessOutcome),
    Superseded(Option<SpawnedProcess>),
}

impl FencedLaunch {
    async fn await_kill(self) -> Option<ProcessOutcome> {
        match self {
            FencedLaunch::Current(outcome) => Some(outcome),
            FencedLaunch::Superseded(proc) => {
                if let Some(mut proc) = proc {
                    proc.kill_tree().await;
                }
                None
            }
        }
    }
}
