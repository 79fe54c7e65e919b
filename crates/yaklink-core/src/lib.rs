//! Shared data model for the yaklink engine supervisor.
//!
//! This crate holds the types that cross component boundaries:
//!
//! - [`EngineCredential`]: the address, port and secret material needed to
//!   reach a running engine instance
//! - [`ConnectionStatus`]: the single authoritative connection state
//! - [`ProcessOutcome`] / [`OutcomeStatus`]: the classified result of one
//!   probe or launch attempt
//! - [`LinkEvent`] / [`EventBus`]: the one observable channel every consumer
//!   (shell window, log panel, watchdog) subscribes to
//!
//! Components never write each other's state directly; they publish events
//! and the supervisor applies transitions.

pub mod credential;
pub mod events;
pub mod outcome;
pub mod status;

pub use credential::{EngineCredential, EngineMode};
pub use events::{EventBus, LinkEvent};
pub use outcome::{OutcomeStatus, ProbePayload, ProcessOutcome};
pub use status::ConnectionStatus;
