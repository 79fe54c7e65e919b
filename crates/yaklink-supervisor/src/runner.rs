//! Engine process spawning and output streaming.
//!
//! [`ProcessRunner`] is the only place a `yak` binary is ever spawned. Both
//! streams are read line-wise; every line is mirrored to the [`EventBus`]
//! as [`LinkEvent::EngineLog`] *before* it is forwarded for classification,
//! so diagnostics survive even when an attempt is abandoned.

use std::process::Stdio;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};
use yaklink_config::{EnginePaths, HOME_ENV};
use yaklink_core::{EventBus, LinkEvent};

/// One line of output from a spawned engine process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    Stdout(String),
    Stderr(String),
}

#[derive(Debug, Error)]
pub enum SpawnError {
    /// Attempt setup failed before the process existed.
    #[error("failed to prepare engine data directory: {0}")]
    Setup(#[source] std::io::Error),
    /// The OS refused to spawn the binary (missing, not executable, ...).
    #[error("failed to spawn engine process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Spawns engine processes with piped stdio and the resolved data directory
/// exported to the child.
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    paths: EnginePaths,
    bus: EventBus,
}

impl ProcessRunner {
    pub fn new(paths: EnginePaths, bus: EventBus) -> Self {
        Self { paths, bus }
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Write a marker line to the log sink, alongside the engine's own
    /// output.
    pub fn log(&self, line: impl Into<String>) {
        self.bus.publish(LinkEvent::EngineLog(line.into()));
    }

    /// Spawn the engine binary with `args`.
    ///
    /// stdin is closed; stdout and stderr are piped and streamed by
    /// background reader tasks until EOF. The child inherits the parent
    /// environment plus the private data directory.
    pub fn spawn(&self, args: &[String]) -> Result<SpawnedProcess, SpawnError> {
        std::fs::create_dir_all(&self.paths.data_dir).map_err(SpawnError::Setup)?;

        let mut child = Command::new(&self.paths.engine_binary)
            .args(args)
            .env(HOME_ENV, &self.paths.data_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(SpawnError::Spawn)?;

        let pid = child.id();
        debug!(
            pid,
            binary = %self.paths.engine_binary.display(),
            ?args,
            "engine process spawned"
        );

        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(mirror_lines(stdout, self.bus.clone(), tx.clone(), false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(mirror_lines(stderr, self.bus.clone(), tx, true));
        }

        Ok(SpawnedProcess {
            child,
            pid,
            events: rx,
        })
    }
}

/// A spawned engine process plus its line stream.
///
/// Fields are exposed separately so callers can `select!` over process exit
/// and output concurrently.
pub struct SpawnedProcess {
    pub child: Child,
    pub pid: Option<u32>,
    pub events: mpsc::UnboundedReceiver<ProcessEvent>,
}

impl SpawnedProcess {
    /// Kill the process, then (on Windows) sweep the whole process tree.
    ///
    /// The engine forks gRPC workers on Windows that outlive a plain
    /// TerminateProcess, so `taskkill /T` runs as a second pass.
    pub async fn kill_tree(&mut self) {
        if let Err(e) = self.child.start_kill() {
            debug!(error = %e, "engine process already gone before kill");
        }

        #[cfg(windows)]
        if let Some(pid) = self.pid {
            let result = Command::new("taskkill")
                .args(["/PID", &pid.to_string(), "/T", "/F"])
                .output()
                .await;
            if let Err(e) = result {
                warn!(pid, error = %e, "taskkill sweep failed");
            }
        }

        // Reap so the child doesn't linger as a zombie.
        let _ = self.child.wait().await;
    }

    /// Let the process keep running unsupervised; a background task reaps
    /// it on exit. Used once a server-mode launch has printed its sentinel.
    pub fn detach(mut self) {
        let pid = self.pid;
        tokio::spawn(async move {
            match self.child.wait().await {
                Ok(status) => debug!(pid, %status, "detached engine process exited"),
                Err(e) => warn!(pid, error = %e, "failed waiting on detached engine"),
            }
        });
    }
}

async fn mirror_lines<R>(
    reader: R,
    bus: EventBus,
    tx: mpsc::UnboundedSender<ProcessEvent>,
    stderr: bool,
) where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                trace!(stderr, %line, "engine output");
                bus.publish(LinkEvent::EngineLog(line.clone()));
                let event = if stderr {
                    ProcessEvent::Stderr(line)
                } else {
                    ProcessEvent::Stdout(line)
                };
                // The classification side may have detached; the bus mirror
                // above already happened, so a closed receiver is fine.
                let _ = tx.send(event);
            }
            Ok(None) => break,
            Err(e) => {
                warn!(stderr, error = %e, "engine output stream read failed");
                break;
            }
        }
    }
}
