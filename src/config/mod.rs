//! Daemon configuration.
//!
//! Runtime settings for the updater daemon are loaded from YAML files and
//! `EOS_UPDATER__*` environment variables. The INI key files shared with the
//! rest of the OS (download order, server repositories) live in the
//! [`download`] and [`update_server`] submodules.

pub mod download;
pub mod ini;
pub mod update_server;

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::UpdaterError;
use crate::transport::TransportConfig;

pub use download::DownloadConfig;
pub use update_server::{RepositoryConfig, UpdateServerConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "eos-updater.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "EOS_UPDATER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "EOS_UPDATER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "EOS_UPDATER_LOG";
/// Daemon endpoint used by eos-updater-ctl.
pub const ENDPOINT_ENV_VAR: &str = "EOS_UPDATER_ENDPOINT";

/// Forces live-boot mode when non-empty.
pub const FORCE_LIVE_BOOT_ENV_VAR: &str = "EU_FORCE_LIVE_BOOT";
/// Suppresses metric emission when set to `1`.
pub const DISABLE_METRICS_ENV_VAR: &str = "EOS_DISABLE_METRICS";
/// `1` forces checkpoints to be followed, `0` forces them to be blocked.
pub const FORCE_FOLLOW_CHECKPOINT_ENV_VAR: &str = "EOS_UPDATER_FORCE_FOLLOW_CHECKPOINT";

/// Test-only: treat the first deployment as booted.
pub const DEPLOYMENT_FALLBACK_ENV_VAR: &str = "EOS_UPDATER_TEST_UPDATER_DEPLOYMENT_FALLBACK";
/// Test-only: replaces the first path of the download configuration chain.
pub const DOWNLOAD_CONFIG_OVERRIDE_ENV_VAR: &str = "EOS_UPDATER_TEST_UPDATER_CONFIG_FILE_PATH";
/// Test-only: overrides the OS name used when deploying.
pub const OSTREE_OSNAME_ENV_VAR: &str = "EOS_UPDATER_TEST_UPDATER_OSTREE_OSNAME";
/// Test-only: overrides the Avahi services directory.
pub const AVAHI_SERVICES_DIR_ENV_VAR: &str = "EOS_UPDATER_TEST_UPDATER_AVAHI_SERVICES_DIR";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("{0}")]
    Invalid(String),

    #[error("{0}")]
    WrongConfiguration(String),
}

impl From<ConfigError> for UpdaterError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::WrongConfiguration(msg) => UpdaterError::WrongConfiguration(msg),
            other => UpdaterError::InvalidConfig(other.to_string()),
        }
    }
}

/// Where the sysroot lives and how the booted deployment is identified.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SysrootSettings {
    /// Root of the sysroot (contains `ostree/`).
    pub path: PathBuf,
    /// Kernel command line, read for `ostree=` and the live-boot marker.
    pub cmdline_path: PathBuf,
    /// Treat the first deployment as booted when none matches the cmdline.
    pub deployment_fallback: bool,
    /// Overrides the OS name used for new deployments.
    pub osname: Option<String>,
}

impl Default for SysrootSettings {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/"),
            cmdline_path: PathBuf::from("/proc/cmdline"),
            deployment_fallback: false,
            osname: None,
        }
    }
}

/// Finder pool behaviour.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FinderSettings {
    /// Per-finder timeout; a finder that times out contributes no results.
    pub timeout_secs: u64,
    /// Attempts for transient network errors, including the first.
    pub retry_attempts: usize,
    /// Base back-off delay in milliseconds.
    pub retry_base_ms: u64,
}

impl Default for FinderSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            retry_attempts: 3,
            retry_base_ms: 500,
        }
    }
}

impl FinderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// LAN peer discovery.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LanSettings {
    /// How long to collect mDNS responses.
    pub browse_ms: u64,
    /// Statically configured peer repositories (`http://host:port/path`).
    pub peers: Vec<String>,
}

impl Default for LanSettings {
    fn default() -> Self {
        Self {
            browse_ms: 2000,
            peers: Vec::new(),
        }
    }
}

/// Metrics reporting.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MetricsSettings {
    pub enabled: bool,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self { enabled: true }
    }
}

/// Main daemon configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub sysroot: SysrootSettings,
    /// Façade transport.
    pub transport: TransportConfig,
    pub finders: FinderSettings,
    pub lan: LanSettings,
    pub metrics: MetricsSettings,
    /// Explicit download configuration file; bypasses the search chain.
    pub download_config: Option<PathBuf>,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `eos-updater.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `EOS_UPDATER_CONFIG` (if set)
    /// 4. Environment variables with the `EOS_UPDATER__` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let mut config: Config = config.try_deserialize()?;
        config.apply_legacy_env();
        Ok(config)
    }

    /// Fold in the flat environment switches shared with the rest of the OS.
    fn apply_legacy_env(&mut self) {
        if env_flag(DEPLOYMENT_FALLBACK_ENV_VAR) {
            self.sysroot.deployment_fallback = true;
        }
        if let Ok(osname) = std::env::var(OSTREE_OSNAME_ENV_VAR) {
            if !osname.is_empty() {
                self.sysroot.osname = Some(osname);
            }
        }
        if std::env::var(DISABLE_METRICS_ENV_VAR).as_deref() == Ok("1") {
            self.metrics.enabled = false;
        }
    }

    /// Load the download-source configuration this daemon should use.
    pub fn download(&self) -> Result<DownloadConfig, ConfigError> {
        match &self.download_config {
            Some(path) => DownloadConfig::load_file(path),
            None => DownloadConfig::load(),
        }
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            metrics: MetricsSettings { enabled: false },
            ..Self::default()
        }
    }
}

/// Whether an environment variable is set to a non-empty value.
pub fn env_flag(name: &str) -> bool {
    std::env::var_os(name).is_some_and(|v| !v.is_empty())
}
