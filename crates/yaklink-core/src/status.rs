//! The connection-state machine's state set.

use serde::{Deserialize, Serialize};

/// The single authoritative connection status.
///
/// Exactly one value is current at any time; transitions are pure functions
/// of (current status, event) applied by the supervisor. Consumers observe
/// changes via `LinkEvent::StatusChanged` and never poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    /// Nothing in flight; the local path begins here.
    Idle,
    /// Engine binary missing, a bundled copy is available to unpack.
    Install,
    /// Engine binary missing and no bundled copy; download required.
    InstallNetwork,
    /// Capability probe timed out; user may retry.
    CheckTimeout,
    /// Engine too old for the random-password probe; bundled upgrade offered.
    OldVersion,
    /// Probe hit a port conflict; user picks a new port.
    PortOccupied,
    /// Probe process died silently; external interference suspected.
    AntivirusBlocked,
    /// Probe produced an unexpected or gRPC-level failure.
    AllowSecretError,
    /// Credential obtained, engine launching / watchdog warming up.
    Ready,
    /// Sustained liveness confirmed; credential handed to the application.
    Link,
    /// Established link lost past the local failure threshold.
    Error,
    /// User explicitly disconnected; manual reconnect required.
    Break,
    /// Remote-mode form; user supplies an address.
    Remote,
    /// This instance is driven by another controller; local transitions
    /// are suppressed.
    ControlRemote,
}

impl ConnectionStatus {
    /// Whether the supervisor currently holds a live engine link.
    pub fn is_linked(&self) -> bool {
        matches!(self, ConnectionStatus::Link)
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionStatus::Idle => "idle",
            ConnectionStatus::Install => "install",
            ConnectionStatus::InstallNetwork => "install_network",
            ConnectionStatus::CheckTimeout => "check_timeout",
            ConnectionStatus::OldVersion => "old_version",
            ConnectionStatus::PortOccupied => "port_occupied",
            ConnectionStatus::AntivirusBlocked => "antivirus_blocked",
            ConnectionStatus::AllowSecretError => "allow_secret_error",
            ConnectionStatus::Ready => "ready",
            ConnectionStatus::Link => "link",
            ConnectionStatus::Error => "error",
            ConnectionStatus::Break => "break",
            ConnectionStatus::Remote => "remote",
            ConnectionStatus::ControlRemote => "control_remote",
        };
        write!(f, "{name}")
    }
}
