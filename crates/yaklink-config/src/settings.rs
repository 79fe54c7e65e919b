//! Persisted user state.
//!
//! Deliberately minimal: the last connection mode (so startup can resume the
//! local or remote path) and a custom local port if the user changed it.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;
use yaklink_core::EngineMode;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Connection mode of the last successful link.
    #[serde(default)]
    pub last_mode: Option<EngineMode>,
    /// User-chosen local port, set after resolving a port conflict.
    #[serde(default)]
    pub custom_port: Option<u16>,
}

impl Settings {
    /// Load settings, falling back to defaults when the file is missing.
    /// A malformed file is an error; silently resetting user state would
    /// mask real corruption.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) => Ok(toml::from_str(&contents)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no settings file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    pub async fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = toml::to_string_pretty(self)?;
        tokio::fs::write(path, contents).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let tmp = TempDir::new().unwrap();
        let settings = Settings::load(&tmp.path().join("settings.toml"))
            .await
            .unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[tokio::test]
    async fn roundtrip_preserves_mode_and_port() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("settings.toml");

        let settings = Settings {
            last_mode: Some(EngineMode::Remote),
            custom_port: Some(8443),
        };
        settings.save(&path).await.unwrap();

        let loaded = Settings::load(&path).await.unwrap();
        assert_eq!(loaded, settings);
    }

    #[tokio::test]
    async fn malformed_file_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("settings.toml");
        tokio::fs::write(&path, "last_mode = [not toml").await.unwrap();

        assert!(matches!(
            Settings::load(&path).await,
            Err(ConfigError::Parse(_))
        ));
    }
}
