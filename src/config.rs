//! Service configuration.
//!
//! Loaded from a TOML file. Every section and field has a default, so an
//! empty or missing file yields a working local setup.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application name, used for default data directories.
const APP_NAME: &str = "kvmgr";

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// HTTP server.
    pub server: ServerConfig,
    /// Libvirt connection and placement defaults.
    pub libvirt: LibvirtConfig,
    /// Export pipeline.
    pub export: ExportConfig,
    /// VM provisioning.
    pub vm: VmConfig,
    /// Logging.
    pub logging: LoggingConfig,
}

/// HTTP server settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address and port to listen on.
    pub listen: String,
    /// Per-request timeout. Export jobs run in the background and are not
    /// bound by it.
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:8080".to_string(),
            request_timeout: Duration::from_secs(300),
        }
    }
}

/// Libvirt settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LibvirtConfig {
    /// Connection URI passed to `virsh -c`. Unset uses virsh's default.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
    /// Pool new disks are allocated in.
    pub storage_pool: String,
    /// Network new NICs attach to.
    pub network: String,
    /// Timeout for individual virsh calls.
    #[serde(with = "duration_str")]
    pub command_timeout: Duration,
}

impl Default for LibvirtConfig {
    fn default() -> Self {
        Self {
            uri: None,
            storage_pool: "default".to_string(),
            network: "default".to_string(),
            command_timeout: Duration::from_secs(60),
        }
    }
}

/// Export pipeline settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    /// Directory final artifacts are written to.
    pub base_dir: PathBuf,
    /// Time a canceled tool gets between SIGTERM and SIGKILL.
    #[serde(with = "duration_str")]
    pub stop_grace_period: Duration,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            base_dir: data_dir().join("exports"),
            stop_grace_period: Duration::from_secs(10),
        }
    }
}

/// VM provisioning settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Directory cloud-init seed ISOs are written to.
    pub cloud_init_dir: PathBuf,
    /// Directory of `<name>.json` VM templates.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_dir: Option<PathBuf>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            cloud_init_dir: data_dir().join("cloud-init"),
            template_dir: None,
        }
    }
}

/// Logging settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` takes precedence.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(APP_NAME)
}

impl ServiceConfig {
    /// Load configuration from `path`, falling back to defaults when no
    /// path is given or the file does not exist.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::warn!(path = %path.display(), "config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        Self::from_toml(&content).map_err(|e| match e {
            Error::Config(msg) => Error::Config(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> Result<()> {
        self.listen_addr()?;
        if self.libvirt.storage_pool.trim().is_empty() {
            return Err(Error::Config("libvirt.storage_pool must not be empty".into()));
        }
        if self.libvirt.network.trim().is_empty() {
            return Err(Error::Config("libvirt.network must not be empty".into()));
        }
        if self.export.stop_grace_period.is_zero() {
            return Err(Error::Config("export.stop_grace_period must be positive".into()));
        }
        if self.export.base_dir.as_os_str().is_empty() {
            return Err(Error::Config("export.base_dir must not be empty".into()));
        }
        Ok(())
    }

    /// Parsed `server.listen`.
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.server.listen.parse().map_err(|e| {
            Error::Config(format!("invalid listen address '{}': {}", self.server.listen, e))
        })
    }
}

/// Durations as humantime strings (`"300s"`, `"1m 30s"`).
mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}
