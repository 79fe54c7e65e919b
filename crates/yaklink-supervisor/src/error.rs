use thiserror::Error;

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("configuration error: {0}")]
    Config(#[from] yaklink_config::ConfigError),

    #[error("watchdog task panicked: {0}")]
    WatchdogPanicked(String),
}
