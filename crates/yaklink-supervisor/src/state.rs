//! The startup state machine.
//!
//! [`next_status`] is a pure function of (current status, event, context).
//! It decides only *which* status comes next; all side effects (spawning
//! probes, starting watchdogs, persisting settings) live in the supervisor.
//! `None` means the event does not move this status — stale outcomes from
//! abandoned attempts land here and die quietly.

use yaklink_core::{ConnectionStatus, EngineMode, OutcomeStatus, ProcessOutcome};

/// Everything a user can ask the supervisor to do.
#[derive(Debug, Clone, PartialEq)]
pub enum UserAction {
    /// Restart the local path from the top.
    Retry,
    /// Leave the remote form (or a remote link) for the local path.
    SelectLocal,
    /// Open the remote form.
    SelectRemote,
    /// Submit the remote form. `host` may embed its own port.
    ConnectRemote {
        host: String,
        port: u16,
        secret: String,
        tls: bool,
        ca_pem: Option<Vec<u8>>,
    },
    /// Resolve a port conflict by picking a different local port.
    ChangePort(u16),
    /// Keep an engine too old for the capability probe and hand off to the
    /// legacy connect flow.
    KeepCurrentVersion,
    /// Replace an old engine with the bundled copy.
    ResetToBundled,
    /// Disconnect deliberately; nothing reconnects until the user acts.
    Break,
    /// Yield this instance to an external controller.
    EnterControlRemote,
    /// Take the instance back from the external controller.
    ExitControlRemote,
}

/// Everything that can move the state machine.
#[derive(Debug, Clone)]
pub enum StartupEvent {
    /// The engine binary is not installed.
    EngineMissing { bundled_available: bool },
    /// A capability probe resolved (non-superseded attempts only).
    ProbeOutcome(ProcessOutcome),
    /// A server-mode launch resolved (non-superseded attempts only).
    LaunchOutcome(ProcessOutcome),
    /// A watchdog round-trip succeeded.
    WatchdogReady,
    /// A watchdog round-trip failed.
    WatchdogFailed { consecutive: u32 },
    /// The watchdog hit its ceiling and gave up.
    WatchdogStopped { failures: u32 },
    User(UserAction),
    /// Stop the supervisor's event loop. Not a state transition.
    Shutdown,
}

/// Ambient facts transitions depend on.
#[derive(Debug, Clone, Copy)]
pub struct TransitionContext {
    /// Mode of the current credential, if one exists.
    pub mode: Option<EngineMode>,
    /// Whether a bundled engine copy ships with this build.
    pub bundled_available: bool,
    /// Consecutive local failures before the error state surfaces.
    pub local_failure_threshold: u32,
}

/// Compute the next status, or `None` when the event changes nothing.
pub fn next_status(
    current: ConnectionStatus,
    event: &StartupEvent,
    ctx: &TransitionContext,
) -> Option<ConnectionStatus> {
    use ConnectionStatus as S;

    // Under external control every local stimulus is suppressed; only
    // leaving control (or explicitly going local) gets out.
    if current == S::ControlRemote {
        return match event {
            StartupEvent::User(UserAction::ExitControlRemote)
            | StartupEvent::User(UserAction::SelectLocal) => Some(S::Idle),
            _ => None,
        };
    }

    match event {
        StartupEvent::User(action) => user_transition(current, action, ctx),

        StartupEvent::EngineMissing { bundled_available } => (current == S::Idle).then(|| {
            if *bundled_available {
                S::Install
            } else {
                S::InstallNetwork
            }
        }),

        StartupEvent::ProbeOutcome(outcome) => {
            if current != S::Idle {
                return None;
            }
            Some(match outcome.status {
                OutcomeStatus::Success => S::Ready,
                OutcomeStatus::PortOccupied => S::PortOccupied,
                // Without a bundled copy the old-version page has no upgrade
                // to offer; send the user to the download path instead.
                OutcomeStatus::OldVersion => {
                    if ctx.bundled_available {
                        S::OldVersion
                    } else {
                        S::InstallNetwork
                    }
                }
                OutcomeStatus::AntivirusBlocked => S::AntivirusBlocked,
                OutcomeStatus::Timeout => S::CheckTimeout,
                // GrpcError, Unknown, Exit, ProcessError, Exception: all
                // surface the generic probe-failure page.
                _ => S::AllowSecretError,
            })
        }

        StartupEvent::LaunchOutcome(outcome) => {
            if current != S::Ready {
                return None;
            }
            if outcome.is_success() {
                // Stay in ready; the watchdog confirms the link.
                None
            } else {
                Some(S::Error)
            }
        }

        StartupEvent::WatchdogReady => (current == S::Ready).then_some(S::Link),

        StartupEvent::WatchdogFailed { consecutive } => {
            if !matches!(current, S::Ready | S::Link | S::Error) {
                return None;
            }
            match ctx.mode {
                // Remote links are never retried: the first failure
                // disconnects.
                Some(EngineMode::Remote) => Some(S::Idle),
                Some(EngineMode::Local) => (current != S::Error
                    && *consecutive >= ctx.local_failure_threshold)
                    .then_some(S::Error),
                None => None,
            }
        }

        // The stop itself is informational; the error status (if any)
        // surfaced at the threshold already.
        StartupEvent::WatchdogStopped { .. } => None,

        StartupEvent::Shutdown => None,
    }
}

fn user_transition(
    current: ConnectionStatus,
    action: &UserAction,
    ctx: &TransitionContext,
) -> Option<ConnectionStatus> {
    use ConnectionStatus as S;

    match action {
        UserAction::SelectRemote => Some(S::Remote),
        UserAction::SelectLocal => Some(S::Idle),
        UserAction::EnterControlRemote => Some(S::ControlRemote),
        UserAction::Break => Some(S::Break),
        UserAction::Retry => matches!(
            current,
            S::Idle
                | S::Install
                | S::InstallNetwork
                | S::CheckTimeout
                | S::OldVersion
                | S::AllowSecretError
                | S::Error
                | S::Break
        )
        .then_some(S::Idle),
        UserAction::ChangePort(_) => (current == S::PortOccupied).then_some(S::Idle),
        UserAction::ConnectRemote { .. } => (current == S::Remote).then_some(S::Ready),
        UserAction::ResetToBundled => {
            (current == S::OldVersion && ctx.bundled_available).then_some(S::Install)
        }
        // Handled as a side effect (legacy flow handoff), not a transition.
        UserAction::KeepCurrentVersion => None,
        UserAction::ExitControlRemote => None,
    }
}
