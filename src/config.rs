//! Application configuration: data directories, server address, license
//! settings, and the orchestrator policy.
//!
//! Values come from a TOML file with environment overrides. The shared
//! license secret is never serialized; it is taken from the environment
//! or falls back to the built-in distribution secret.

use crate::orchestrator::OrchestratorConfig;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Baked-in shared secret for license blobs, overridable through
/// `ISX_LICENSE_SECRET` for self-hosted issuers.
const DEFAULT_LICENSE_SECRET: &str = "isx-pulse-d1str1but10n-k3y-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory for downloads, reports, logs, and the license file.
    pub data_dir: PathBuf,
    pub downloads_dir: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub log_dir: Option<PathBuf>,
    pub license_file: Option<PathBuf>,
    pub server_addr: String,
    pub issuer_url: String,
    /// Offline grace window after license expiry, in hours.
    pub grace_hours: u64,
    pub orchestrator: OrchestratorConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            downloads_dir: None,
            reports_dir: None,
            log_dir: None,
            license_file: None,
            server_addr: "127.0.0.1:8080".to_string(),
            issuer_url: "https://license.isx-pulse.com".to_string(),
            grace_hours: 72,
            orchestrator: OrchestratorConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration: explicit path, else `isx-pulse.toml` in the
    /// working directory, else defaults. Environment variables override
    /// file values.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None => match Self::discover_config_file() {
                Some(p) => Self::from_file(&p)?,
                None => Self::default(),
            },
        };

        if let Ok(dir) = std::env::var("ISX_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        if let Ok(addr) = std::env::var("ISX_SERVER_ADDR") {
            config.server_addr = addr;
        }
        if let Ok(url) = std::env::var("ISX_ISSUER_URL") {
            config.issuer_url = url;
        }
        Ok(config)
    }

    /// `./isx-pulse.toml` first, then the per-user config directory.
    fn discover_config_file() -> Option<PathBuf> {
        let local = PathBuf::from("isx-pulse.toml");
        if local.exists() {
            return Some(local);
        }
        dirs::config_dir()
            .map(|d| d.join("isx-pulse").join("config.toml"))
            .filter(|p| p.exists())
    }

    fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        toml::from_str(&raw)
            .with_context(|| format!("failed to parse config file {}", path.display()))
    }

    pub fn downloads_dir(&self) -> PathBuf {
        self.downloads_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("downloads"))
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.reports_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("reports"))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("logs"))
    }

    pub fn license_file(&self) -> PathBuf {
        self.license_file
            .clone()
            .unwrap_or_else(|| self.data_dir.join("license.dat"))
    }

    /// The shared secret for license blobs.
    pub fn license_secret(&self) -> Vec<u8> {
        std::env::var("ISX_LICENSE_SECRET")
            .unwrap_or_else(|_| DEFAULT_LICENSE_SECRET.to_string())
            .into_bytes()
    }

    pub fn grace(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.grace_hours * 60 * 60)
    }

    pub fn ensure_directories(&self) -> Result<()> {
        std::fs::create_dir_all(self.downloads_dir())
            .context("failed to create downloads directory")?;
        std::fs::create_dir_all(self.reports_dir())
            .context("failed to create reports directory")?;
        std::fs::create_dir_all(self.log_dir()).context("failed to create log directory")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn defaults_derive_from_data_dir() {
        let config = AppConfig::default();
        assert_eq!(config.downloads_dir(), PathBuf::from("data/downloads"));
        assert_eq!(config.reports_dir(), PathBuf::from("data/reports"));
        assert_eq!(config.license_file(), PathBuf::from("data/license.dat"));
    }

    #[test]
    fn explicit_directories_win() {
        let config = AppConfig {
            downloads_dir: Some(PathBuf::from("/srv/isx/incoming")),
            ..Default::default()
        };
        assert_eq!(config.downloads_dir(), PathBuf::from("/srv/isx/incoming"));
        assert_eq!(config.reports_dir(), PathBuf::from("data/reports"));
    }

    #[test]
    fn config_file_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("isx-pulse.toml");
        std::fs::write(
            &path,
            r#"
data_dir = "/var/lib/isx-pulse"
server_addr = "0.0.0.0:9000"
grace_hours = 24

[orchestrator]
continue_on_error = true
"#,
        )
        .unwrap();

        let config = AppConfig::load(Some(&path)).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("/var/lib/isx-pulse"));
        assert_eq!(config.server_addr, "0.0.0.0:9000");
        assert_eq!(config.grace_hours, 24);
        assert!(config.orchestrator.continue_on_error);
    }

    #[test]
    fn ensure_directories_creates_the_tree() {
        let dir = tempdir().unwrap();
        let config = AppConfig {
            data_dir: dir.path().join("pulse"),
            ..Default::default()
        };
        config.ensure_directories().unwrap();
        assert!(config.downloads_dir().exists());
        assert!(config.reports_dir().exists());
        assert!(config.log_dir().exists());
    }
}
