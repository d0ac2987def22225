//! Download-source configuration (`eos-updater.conf`).
//!
//! ```ini
//! [Download]
//! Order=main;lan;volume
//! OverrideUris=http://mirror.example/ostree
//! ```
//!
//! The first file that exists along the search chain wins; when none
//! exists the built-in default (`Order=main`) applies.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::ini::{load_ini, parse_list, IniGroups};
use super::{ConfigError, DOWNLOAD_CONFIG_OVERRIDE_ENV_VAR};
use crate::finder::SourceKind;

/// Highest-priority location of the download configuration.
pub const DOWNLOAD_CONFIG_PATH: &str = "/etc/eos-updater/eos-updater.conf";
/// Administrator-local location.
pub const LOCAL_DOWNLOAD_CONFIG_PATH: &str = "/usr/local/share/eos-updater/eos-updater.conf";
/// Distribution default location.
pub const STATIC_DOWNLOAD_CONFIG_PATH: &str = "/usr/share/eos-updater/eos-updater.conf";

const DOWNLOAD_GROUP: &str = "Download";
const ORDER_KEY: &str = "order";
const OVERRIDE_URIS_KEY: &str = "overrideuris";

/// Which finders run, in tie-break precedence order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadConfig {
    /// Enabled sources; earlier entries win timestamp ties.
    pub order: Vec<SourceKind>,
    /// Replaces the Main finder's remote URL when set. Never empty.
    pub override_uris: Option<Vec<String>>,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            order: vec![SourceKind::Main],
            override_uris: None,
        }
    }
}

impl DownloadConfig {
    /// Load from the standard search chain.
    ///
    /// `EOS_UPDATER_TEST_UPDATER_CONFIG_FILE_PATH` replaces the first path.
    pub fn load() -> Result<Self, ConfigError> {
        let first = std::env::var(DOWNLOAD_CONFIG_OVERRIDE_ENV_VAR)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DOWNLOAD_CONFIG_PATH));
        let paths = [
            first,
            PathBuf::from(LOCAL_DOWNLOAD_CONFIG_PATH),
            PathBuf::from(STATIC_DOWNLOAD_CONFIG_PATH),
        ];
        Self::load_from_paths(&paths)
    }

    /// Load the first existing file among `paths`, or the defaults.
    pub fn load_from_paths(paths: &[PathBuf]) -> Result<Self, ConfigError> {
        match paths.iter().find(|p| p.exists()) {
            Some(path) => {
                debug!(path = %path.display(), "Loading download configuration");
                Self::load_file(path)
            }
            None => {
                debug!("No download configuration file found; using defaults");
                Ok(Self::default())
            }
        }
    }

    pub fn load_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_groups(&load_ini(path)?)
    }

    pub fn from_groups(groups: &IniGroups) -> Result<Self, ConfigError> {
        let group = match groups.get(DOWNLOAD_GROUP) {
            Some(group) => group,
            None => return Ok(Self::default()),
        };

        let order = match group.get(ORDER_KEY) {
            Some(raw) => parse_download_order(raw)?,
            None => Self::default().order,
        };

        let override_uris = group
            .get(OVERRIDE_URIS_KEY)
            .map(|raw| parse_list(raw))
            .filter(|uris| !uris.is_empty());

        Ok(Self {
            order,
            override_uris,
        })
    }
}

/// Parse `main;lan;volume`, rejecting unknown and duplicated sources.
pub fn parse_download_order(raw: &str) -> Result<Vec<SourceKind>, ConfigError> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    for name in parse_list(raw) {
        let kind = SourceKind::from_config_name(&name).ok_or_else(|| {
            ConfigError::WrongConfiguration(format!("Unknown download source {}", name))
        })?;
        if !seen.insert(kind) {
            return Err(ConfigError::WrongConfiguration(format!(
                "Duplicated download source {}",
                name
            )));
        }
        order.push(kind);
    }
    if order.is_empty() {
        return Err(ConfigError::WrongConfiguration(
            "No download sources".to_string(),
        ));
    }
    Ok(order)
}
