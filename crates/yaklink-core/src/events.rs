//! The single observable channel published by the supervisor.
//!
//! Every consumer (shell window, secondary window, log panel) subscribes to
//! the same broadcast channel instead of bespoke point-to-point event names
//! per consumer pair.

use crate::credential::EngineCredential;
use crate::status::ConnectionStatus;
use tokio::sync::broadcast;
use tracing::trace;

const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Events published by the supervisor.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    /// The authoritative connection status changed.
    StatusChanged(ConnectionStatus),
    /// One chunk of engine process output, mirrored before classification.
    EngineLog(String),
    /// Raw error text from a failed engine launch, surfaced independently
    /// of the outcome channel so the UI can show it immediately.
    LaunchError(String),
    /// A remote-mode link dropped; remote disconnects are not retried.
    RemoteDisconnected,
    /// Sustained liveness reached; the credential is handed to the rest of
    /// the application.
    LinkEstablished(EngineCredential),
    /// The watchdog hit its consecutive-failure ceiling and stopped; a
    /// manual reconnect is required.
    WatchdogStopped { failures: u32 },
    /// User chose to keep an engine too old for the capability probe; the
    /// legacy password-less connect flow takes over from here.
    LegacyLinkRequested,
}

/// Broadcast wrapper so publishers don't care whether anyone is listening.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<LinkEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LinkEvent> {
        self.tx.subscribe()
    }

    /// Publish an event. A send error only means no subscriber is currently
    /// attached, which is fine for log mirroring.
    pub fn publish(&self, event: LinkEvent) {
        if self.tx.send(event).is_err() {
            trace!("no subscribers for link event");
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
