//! Configuration for the yaklink supervisor.
//!
//! Three concerns live here:
//!
//! - [`paths`]: where the private data directory and the engine binary live
//! - [`settings`]: the small persisted state (last connection mode, custom
//!   port), written on successful link and consulted at startup
//! - [`LinkConfig`]: supervisor tuning knobs (timeouts, watchdog interval,
//!   failure thresholds, the off-by-default timeout retry)

pub mod link;
pub mod paths;
pub mod settings;

pub use link::{LinkConfig, DEFAULT_LOCAL_PORT};
pub use paths::{EnginePaths, ENGINE_ENV, HOME_ENV};
pub use settings::Settings;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed settings file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to serialize settings: {0}")]
    Serialize(#[from] toml::ser::Error),
}
