//! Where EchoMIDI keeps its files
//!
//! Three layouts, picked in this order:
//!
//! - **Dev** (debug builds only): `config.yaml` in the working directory.
//! - **Portable**: a `.portable` marker next to the executable keeps
//!   everything beside it.
//! - **Installed**: the platform data directory, `%APPDATA%\EchoMIDI` on
//!   Windows.

use std::path::{Path, PathBuf};

use anyhow::Context;
use tracing::debug;

const APP_NAME: &str = "EchoMIDI";
const CONFIG_FILE: &str = "config.yaml";
const PORTABLE_MARKER: &str = ".portable";
const ROUTING_FILE: &str = "routing.json";

/// How the file layout was chosen
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    Dev,
    Portable,
    Installed,
}

#[derive(Debug, Clone)]
pub struct AppPaths {
    pub layout: Layout,
    pub config: PathBuf,
    /// Holds the routing document
    pub state_dir: PathBuf,
    pub logs_dir: PathBuf,
}

impl AppPaths {
    /// Pick the layout for this process.
    ///
    /// Runs before logging is up, so the choice is only echoed to stderr in
    /// debug builds.
    pub fn detect() -> Self {
        let exe_dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."));

        #[cfg(debug_assertions)]
        if let Ok(cwd) = std::env::current_dir() {
            if cwd.join(CONFIG_FILE).is_file() {
                eprintln!("[paths] dev layout in {}", cwd.display());
                return Self::local(cwd, Layout::Dev);
            }
        }

        if exe_dir.join(PORTABLE_MARKER).exists() {
            return Self::local(exe_dir, Layout::Portable);
        }

        let root = match dirs::data_dir() {
            Some(data) => data.join(APP_NAME),
            None => {
                eprintln!("[paths] no platform data directory, using {}", exe_dir.display());
                exe_dir.join(APP_NAME)
            },
        };
        Self::installed(root)
    }

    /// Dev and portable layouts keep state in a hidden folder beside the config
    fn local(root: PathBuf, layout: Layout) -> Self {
        Self {
            layout,
            config: root.join(CONFIG_FILE),
            state_dir: root.join(".state"),
            logs_dir: root.join("logs"),
        }
    }

    fn installed(root: PathBuf) -> Self {
        Self {
            layout: Layout::Installed,
            config: root.join(CONFIG_FILE),
            state_dir: root.join("state"),
            logs_dir: root.join("logs"),
        }
    }

    /// Directory relative config paths resolve against
    pub fn base_dir(&self) -> PathBuf {
        self.config
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Default routing document location
    pub fn routing_file(&self) -> PathBuf {
        self.state_dir.join(ROUTING_FILE)
    }

    /// Create the config, state and log directories if missing
    pub fn ensure_directories(&self) -> anyhow::Result<()> {
        let config_dir = self.base_dir();
        for dir in [&config_dir, &self.state_dir, &self.logs_dir] {
            if dir.as_os_str().is_empty() || dir.is_dir() {
                continue;
            }
            debug!("Creating directory: {}", dir.display());
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_local_layout() {
        let paths = AppPaths::local(PathBuf::from("portable"), Layout::Portable);
        assert_eq!(paths.config, PathBuf::from("portable").join("config.yaml"));
        assert_eq!(
            paths.routing_file(),
            PathBuf::from("portable").join(".state").join("routing.json")
        );
        assert_eq!(paths.base_dir(), PathBuf::from("portable"));
    }

    #[test]
    fn test_installed_layout_uses_visible_state_dir() {
        let paths = AppPaths::installed(PathBuf::from("data").join("EchoMIDI"));
        assert_eq!(paths.layout, Layout::Installed);
        assert!(paths.routing_file().ends_with("state/routing.json"));
    }

    #[test]
    fn test_ensure_directories() {
        let dir = TempDir::new().unwrap();
        let paths = AppPaths::installed(dir.path().join("EchoMIDI"));
        paths.ensure_directories().unwrap();
        assert!(paths.state_dir.is_dir());
        assert!(paths.logs_dir.is_dir());
        assert!(paths.base_dir().is_dir());
        // Second call is a no-op
        paths.ensure_directories().unwrap();
    }
}
