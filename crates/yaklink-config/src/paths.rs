//! Data directory and engine binary resolution.

use std::path::{Path, PathBuf};

/// Environment variable overriding the private data directory. Child engine
/// processes receive it too, pointed at the resolved directory.
pub const HOME_ENV: &str = "YAKLINK_HOME";

/// Environment variable overriding the engine binary location.
pub const ENGINE_ENV: &str = "YAKLINK_ENGINE";

#[cfg(windows)]
const ENGINE_BINARY: &str = "yak.exe";
#[cfg(not(windows))]
const ENGINE_BINARY: &str = "yak";

/// Resolved filesystem layout for one supervisor instance.
#[derive(Debug, Clone)]
pub struct EnginePaths {
    /// Private application data directory (`YAKLINK_HOME`).
    pub data_dir: PathBuf,
    /// The engine binary to probe and launch.
    pub engine_binary: PathBuf,
}

impl EnginePaths {
    /// Resolve from the environment and platform conventions.
    pub fn resolve() -> Self {
        let data_dir = std::env::var_os(HOME_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("yaklink")
            });

        let engine_binary = std::env::var_os(ENGINE_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("engine").join(ENGINE_BINARY));

        Self {
            data_dir,
            engine_binary,
        }
    }

    /// Explicit layout, used by tests and by CLI overrides.
    pub fn new(data_dir: impl Into<PathBuf>, engine_binary: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            engine_binary: engine_binary.into(),
        }
    }

    /// Whether the engine binary exists on disk.
    pub fn is_engine_installed(&self) -> bool {
        self.engine_binary.is_file()
    }

    /// Version of the bundled engine archive, if one ships with this build.
    ///
    /// The bundled copy lives next to the data directory as
    /// `bundled/yak-version.txt` + archive; only the version marker is
    /// consulted here, unpacking is the installer's job.
    pub fn bundled_engine_version(&self) -> Option<String> {
        let marker = self.data_dir.join("bundled").join("yak-version.txt");
        read_version_marker(&marker)
    }

    /// Settings file location.
    pub fn settings_file(&self) -> PathBuf {
        self.data_dir.join("settings.toml")
    }
}

fn read_version_marker(path: &Path) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    let version = contents.trim();
    if version.is_empty() {
        None
    } else {
        Some(version.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn engine_installed_reflects_file_presence() {
        let tmp = TempDir::new().unwrap();
        let binary = tmp.path().join("yak");
        let paths = EnginePaths::new(tmp.path(), &binary);

        assert!(!paths.is_engine_installed());
        std::fs::write(&binary, b"").unwrap();
        assert!(paths.is_engine_installed());
    }

    #[test]
    fn bundled_version_absent_without_marker() {
        let tmp = TempDir::new().unwrap();
        let paths = EnginePaths::new(tmp.path(), tmp.path().join("yak"));
        assert_eq!(paths.bundled_engine_version(), None);
    }

    #[test]
    fn bundled_version_read_and_trimmed() {
        let tmp = TempDir::new().unwrap();
        let bundled = tmp.path().join("bundled");
        std::fs::create_dir_all(&bundled).unwrap();
        std::fs::write(bundled.join("yak-version.txt"), "1.3.4\n").unwrap();

        let paths = EnginePaths::new(tmp.path(), tmp.path().join("yak"));
        assert_eq!(paths.bundled_engine_version().as_deref(), Some("1.3.4"));
    }

    #[test]
    fn empty_version_marker_counts_as_absent() {
        let tmp = TempDir::new().unwrap();
        let bundled = tmp.path().join("bundled");
        std::fs::create_dir_all(&bundled).unwrap();
        std::fs::write(bundled.join("yak-version.txt"), "  \n").unwrap();

        let paths = EnginePaths::new(tmp.path(), tmp.path().join("yak"));
        assert_eq!(paths.bundled_engine_version(), None);
    }
}
