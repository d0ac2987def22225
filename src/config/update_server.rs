//! Repository server configuration (`eos-update-server.conf`).
//!
//! ```ini
//! [Local Network Updates]
//! AdvertiseUpdates=true
//!
//! [Repository 0]
//! Path=/ostree/repo
//! RemoteName=eos
//! ```

use std::path::{Path, PathBuf};

use tracing::debug;

use super::ini::{load_ini, parse_bool, IniGroups};
use super::ConfigError;

/// Highest-priority location of the server configuration.
pub const SERVER_CONFIG_PATH: &str = "/etc/eos-updater/eos-update-server.conf";
/// Administrator-local location.
pub const LOCAL_SERVER_CONFIG_PATH: &str = "/usr/local/share/eos-updater/eos-update-server.conf";
/// Distribution default location.
pub const STATIC_SERVER_CONFIG_PATH: &str = "/usr/share/eos-updater/eos-update-server.conf";

const LOCAL_NETWORK_UPDATES_GROUP: &str = "Local Network Updates";
const ADVERTISE_UPDATES_KEY: &str = "advertiseupdates";
const REPOSITORY_GROUP_PREFIX: &str = "Repository ";
const PATH_KEY: &str = "path";
const REMOTE_NAME_KEY: &str = "remotename";

/// One `[Repository N]` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub index: u16,
    pub path: PathBuf,
    pub remote_name: String,
}

impl RepositoryConfig {
    /// HTTP prefix: empty for repository 0, `/N` otherwise.
    pub fn root_path(&self) -> String {
        if self.index == 0 {
            String::new()
        } else {
            format!("/{}", self.index)
        }
    }
}

/// Parsed server configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UpdateServerConfig {
    /// Whether the advertisement server runs at all.
    pub advertise_updates: bool,
    /// Configured repositories, in file order.
    pub repositories: Vec<RepositoryConfig>,
}

impl UpdateServerConfig {
    /// Load from `override_path` alone, or else the standard search chain.
    pub fn load(override_path: Option<&Path>) -> Result<Self, ConfigError> {
        let paths: Vec<PathBuf> = match override_path {
            Some(path) => vec![path.to_path_buf()],
            None => vec![
                PathBuf::from(SERVER_CONFIG_PATH),
                PathBuf::from(LOCAL_SERVER_CONFIG_PATH),
                PathBuf::from(STATIC_SERVER_CONFIG_PATH),
            ],
        };

        match paths.iter().find(|p| p.exists()) {
            Some(path) => {
                debug!(path = %path.display(), "Loading server configuration");
                Self::from_groups(&load_ini(path)?)
            }
            None if override_path.is_some() => Err(ConfigError::Invalid(format!(
                "Configuration file {} does not exist",
                paths[0].display()
            ))),
            None => Ok(Self::default()),
        }
    }

    pub fn from_groups(groups: &IniGroups) -> Result<Self, ConfigError> {
        let advertise_updates = groups
            .get(LOCAL_NETWORK_UPDATES_GROUP)
            .and_then(|g| g.get(ADVERTISE_UPDATES_KEY))
            .ok_or_else(|| {
                ConfigError::Invalid(
                    "Key file does not have key AdvertiseUpdates in group Local Network Updates"
                        .to_string(),
                )
            })
            .and_then(|raw| parse_bool("Local Network Updates", "AdvertiseUpdates", raw))?;

        let mut repositories: Vec<RepositoryConfig> = Vec::new();
        for (group, keys) in groups {
            let Some(suffix) = group.strip_prefix(REPOSITORY_GROUP_PREFIX) else {
                continue;
            };
            let index: u16 = suffix
                .parse()
                .map_err(|_| ConfigError::Invalid(format!("Invalid group name: {}", group)))?;

            let path = required_key(group, keys, PATH_KEY, "Path")?;
            let remote_name = required_key(group, keys, REMOTE_NAME_KEY, "RemoteName")?;

            if repositories.iter().any(|r| r.index == index) {
                return Err(ConfigError::Invalid(format!(
                    "Duplicate group name: {}",
                    group
                )));
            }

            repositories.push(RepositoryConfig {
                index,
                path: PathBuf::from(path),
                remote_name: remote_name.to_string(),
            });
        }

        Ok(Self {
            advertise_updates,
            repositories,
        })
    }
}

fn required_key<'a>(
    group: &str,
    keys: &'a std::collections::BTreeMap<String, String>,
    key: &str,
    display_key: &str,
) -> Result<&'a str, ConfigError> {
    keys.get(key).map(String::as_str).ok_or_else(|| {
        ConfigError::Invalid(format!(
            "Key file does not have key {} in group {}",
            display_key, group
        ))
    })
}
