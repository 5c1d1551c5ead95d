//! YAML configuration, read once at start-up.

use anyhow::{Context, Result};
use log::LevelFilter;
use serde::Deserialize;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::analyze::AnalyzeOptions;
use crate::puller::{PullerSettings, DEFAULT_TIMEOUT};
use crate::sources::{RegistryAuth, RegistryOptions, TrustPolicy};
use crate::tar_extractor::UnpackOptions;
use crate::workspace::WorkspaceManager;

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_REQUEST_SIZE: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub server: ServerConfig,
    pub analyze: AnalyzeConfig,
    pub registry: RegistryConfig,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    /// Append log records here instead of stderr.
    pub file: Option<PathBuf>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LogConfig {
    pub fn level_filter(&self) -> LevelFilter {
        LevelFilter::from_str(&self.level).unwrap_or(LevelFilter::Info)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted request body, in bytes.
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            max_request_size: DEFAULT_MAX_REQUEST_SIZE,
        }
    }
}

impl ServerConfig {
    /// Listen address; an unusable host or port falls back to `0.0.0.0:8080`.
    pub fn address(&self) -> SocketAddr {
        let fallback = SocketAddr::from(([0, 0, 0, 0], DEFAULT_PORT));
        if self.host.is_empty() || self.port == 0 {
            return fallback;
        }
        match (self.host.as_str(), self.port).to_socket_addrs() {
            Ok(mut addrs) => addrs.next().unwrap_or(fallback),
            Err(e) => {
                log::warn!(
                    "Invalid listen address {}:{} ({}), using {}",
                    self.host,
                    self.port,
                    e,
                    fallback
                );
                fallback
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AnalyzeConfig {
    /// Parent of all workspaces; the system temp dir when unset.
    pub unpack_dir: Option<PathBuf>,
    pub check_os_info: bool,
    pub check_python_packages: bool,
    pub check_common_tools: bool,
    pub specific_commands: Vec<String>,
    /// Deadline for one pull; 0 disables it.
    pub timeout_secs: u64,
    pub materialize_links: bool,
    pub whiteouts: bool,
}

impl Default for AnalyzeConfig {
    fn default() -> Self {
        let options = AnalyzeOptions::default();
        let unpack = UnpackOptions::default();
        Self {
            unpack_dir: None,
            check_os_info: options.check_os_info,
            check_python_packages: options.check_python_packages,
            check_common_tools: options.check_common_tools,
            specific_commands: options.specific_commands,
            timeout_secs: DEFAULT_TIMEOUT.as_secs(),
            materialize_links: unpack.materialize_links,
            whiteouts: unpack.whiteouts,
        }
    }
}

impl AnalyzeConfig {
    pub fn options(&self) -> AnalyzeOptions {
        AnalyzeOptions {
            check_os_info: self.check_os_info,
            check_python_packages: self.check_python_packages,
            check_common_tools: self.check_common_tools,
            specific_commands: self.specific_commands.clone(),
        }
    }

    pub fn workspace_manager(&self) -> WorkspaceManager {
        match &self.unpack_dir {
            Some(dir) => WorkspaceManager::new(dir),
            None => WorkspaceManager::system(),
        }
    }

    pub fn puller_settings(&self) -> PullerSettings {
        PullerSettings {
            timeout: (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs)),
            unpack: UnpackOptions {
                whiteouts: self.whiteouts,
                materialize_links: self.materialize_links,
            },
            ..PullerSettings::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    pub trust: TrustPolicy,
    /// Hosts contacted over plain HTTP.
    pub insecure_registries: Vec<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl RegistryConfig {
    /// Explicit credentials win; otherwise `REGISTRY_USERNAME`/`REGISTRY_PASSWORD`.
    pub fn options(&self) -> RegistryOptions {
        let auth = match (&self.username, &self.password) {
            (Some(username), Some(password)) => RegistryAuth::basic(username, password),
            _ => RegistryAuth::from_env(),
        };
        RegistryOptions {
            trust: self.trust,
            insecure_registries: self.insecure_registries.clone(),
            auth,
        }
    }
}

impl Config {
    /// Reads `path`. A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read config file: {}", path.display()))
            }
        };
        Self::from_yaml(&data)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn from_yaml(data: &str) -> Result<Self> {
        if data.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(data)?)
    }
}
