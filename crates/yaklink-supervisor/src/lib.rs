//! Engine-link supervision: probing, launching and watching a local or
//! remote yak engine.
//!
//! The pipeline, in order:
//!
//! 1. [`CapabilityProbe`] asks the installed binary whether it can mint a
//!    one-shot local credential, and classifies whatever comes back.
//! 2. [`EngineLauncher`] starts the engine in server mode with that
//!    credential and waits for the readiness sentinel.
//! 3. [`ConnectionWatchdog`] confirms and then maintains liveness with
//!    periodic echo round-trips.
//! 4. [`Supervisor`] owns the one authoritative [`ConnectionStatus`] and
//!    applies [`next_status`] to every stimulus, publishing changes on the
//!    shared event bus.
//!
//! [`ConnectionStatus`]: yaklink_core::ConnectionStatus

mod error;
pub mod launcher;
pub mod probe;
pub mod runner;
pub mod state;
pub mod supervisor;
pub mod watchdog;

pub use error::SupervisorError;
pub use launcher::EngineLauncher;
pub use probe::CapabilityProbe;
pub use runner::{ProcessEvent, ProcessRunner, SpawnError, SpawnedProcess};
pub use state::{next_status, StartupEvent, TransitionContext, UserAction};
pub use supervisor::{grpc_rpc_factory, RpcFactory, Supervisor, SupervisorHandle};
pub use watchdog::{ConnectionWatchdog, WatchdogEvent, WatchdogHandle, ECHO_TOKEN};
