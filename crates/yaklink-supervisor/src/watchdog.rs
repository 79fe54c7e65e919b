//! Connection watchdog: periodic echo round-trips against a linked engine.
//!
//! The watchdog only observes and counts; what a failure *means* (error
//! page, remote disconnect, nothing yet) is the supervisor's call, because
//! it depends on the connection mode.

use crate::SupervisorError;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};
use yaklink_rpc::EngineRpc;

/// Token sent on every liveness round-trip; the reply must echo it exactly.
pub const ECHO_TOKEN: &str = "Hello Yakit!";

/// Deadline for a single echo call. Separate from the tick interval so a
/// hung call cannot stall the failure counter forever.
const ECHO_TIMEOUT: Duration = Duration::from_secs(3);

/// What one watchdog round observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogEvent {
    /// Echo round-trip succeeded; the consecutive-failure counter reset.
    Ready,
    /// Echo failed; `consecutive` counts failures since the last success.
    Failed { consecutive: u32 },
    /// The failure ceiling was reached and the watchdog gave up.
    Stopped { failures: u32 },
}

pub struct ConnectionWatchdog {
    rpc: Arc<dyn EngineRpc>,
    interval: Duration,
    ceiling: u32,
}

impl ConnectionWatchdog {
    pub fn new(rpc: Arc<dyn EngineRpc>, interval: Duration, ceiling: u32) -> Self {
        Self {
            rpc,
            interval,
            ceiling,
        }
    }

    /// Start ticking. The first round-trip fires immediately, so a healthy
    /// link is confirmed without waiting out a full interval.
    pub fn spawn(self, events: mpsc::UnboundedSender<WatchdogEvent>) -> WatchdogHandle {
        WatchdogHandle {
            task: Some(tokio::spawn(self.run(events))),
        }
    }

    async fn run(self, events: mpsc::UnboundedSender<WatchdogEvent>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut failures = 0u32;

        loop {
            ticker.tick().await;

            let healthy = match tokio::time::timeout(ECHO_TIMEOUT, self.rpc.echo(ECHO_TOKEN)).await
            {
                Ok(Ok(reply)) if reply == ECHO_TOKEN => true,
                Ok(Ok(reply)) => {
                    warn!(%reply, "engine echoed unexpected text");
                    false
                }
                Ok(Err(e)) => {
                    debug!(error = %e, "engine echo failed");
                    false
                }
                Err(_) => {
                    debug!("engine echo timed out");
                    false
                }
            };

            if healthy {
                failures = 0;
                if events.send(WatchdogEvent::Ready).is_err() {
                    break;
                }
            } else {
                failures += 1;
                if events
                    .send(WatchdogEvent::Failed {
                        consecutive: failures,
                    })
                    .is_err()
                {
                    break;
                }
                if failures >= self.ceiling {
                    warn!(failures, "watchdog hit its failure ceiling, giving up");
                    let _ = events.send(WatchdogEvent::Stopped { failures });
                    break;
                }
            }
        }
    }
}

/// Aborts the watchdog task on drop, so replacing a watchdog on reconnect
/// cannot leak a ticking task against a stale credential.
pub struct WatchdogHandle {
    task: Option<JoinHandle<()>>,
}

impl WatchdogHandle {
    pub fn stop(&self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }

    /// Wait for the watchdog task to finish after a stop.
    pub async fn join(mut self) -> Result<(), SupervisorError> {
        let Some(task) = self.task.take() else {
            return Ok(());
        };
        match task.await {
            Ok(()) => Ok(()),
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(SupervisorError::WatchdogPanicked(e.to_string())),
        }
    }
}

impl Drop for WatchdogHandle {
    fn drop(&mut self) {
        if let Some(task) = &self.task {
            task.abort();
        }
    }
}
