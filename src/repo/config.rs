//! Repository `config` key file.
//!
//! ```ini
//! [core]
//! repo_version=1
//! mode=archive-z2
//!
//! [remote "eos"]
//! url=https://ostree.example.com/ostree
//! collection-id=com.example.Os
//! branches=os/eos/amd64/eos3;
//! ```

use std::collections::BTreeMap;
use std::fmt::Write as _;

use crate::config::ini::{parse_ini, IniGroups};
use crate::config::ConfigError;

const CORE_GROUP: &str = "core";
const REMOTE_GROUP_PREFIX: &str = "remote \"";

/// Remote option holding the base URL.
pub const URL_OPTION: &str = "url";
/// Remote option holding the collection id.
pub const COLLECTION_ID_OPTION: &str = "collection-id";
/// Remote option holding the `;`-terminated branch list.
pub const BRANCHES_OPTION: &str = "branches";

/// Repository storage mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoMode {
    /// Compressed objects suitable for serving over HTTP.
    ArchiveZ2,
    /// Objects stored for direct checkout by an unprivileged user.
    BareUserOnly,
}

impl RepoMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RepoMode::ArchiveZ2 => "archive-z2",
            RepoMode::BareUserOnly => "bare-user-only",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "archive-z2" | "archive" => Some(RepoMode::ArchiveZ2),
            "bare-user-only" => Some(RepoMode::BareUserOnly),
            _ => None,
        }
    }
}

/// Parsed repository configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoConfig {
    pub mode: RepoMode,
    /// Collection id of refs committed locally.
    pub collection_id: Option<String>,
    /// Remote name → option → value.
    pub remotes: BTreeMap<String, BTreeMap<String, String>>,
}

impl RepoConfig {
    pub fn new(mode: RepoMode) -> Self {
        Self {
            mode,
            collection_id: None,
            remotes: BTreeMap::new(),
        }
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        Self::from_groups(&parse_ini(contents)?)
    }

    pub fn from_groups(groups: &IniGroups) -> Result<Self, ConfigError> {
        let core = groups
            .get(CORE_GROUP)
            .ok_or_else(|| ConfigError::Invalid("Repository config has no [core] group".into()))?;

        let mode = match core.get("mode") {
            Some(raw) => RepoMode::parse(raw).ok_or_else(|| {
                ConfigError::Invalid(format!("Unsupported repository mode ‘{}’", raw))
            })?,
            None => RepoMode::ArchiveZ2,
        };

        let mut remotes = BTreeMap::new();
        for (group, options) in groups {
            if let Some(name) = group
                .strip_prefix(REMOTE_GROUP_PREFIX)
                .and_then(|rest| rest.strip_suffix('"'))
            {
                remotes.insert(name.to_string(), options.clone());
            }
        }

        Ok(Self {
            mode,
            collection_id: core.get(COLLECTION_ID_OPTION).cloned(),
            remotes,
        })
    }

    pub fn remote(&self, name: &str) -> Option<&BTreeMap<String, String>> {
        self.remotes.get(name)
    }

    pub fn remote_option(&self, name: &str, key: &str) -> Option<&str> {
        self.remote(name)
            .and_then(|options| options.get(key))
            .map(String::as_str)
    }

    /// Add or replace a remote.
    pub fn add_remote(&mut self, name: &str, url: &str, collection_id: Option<&str>) {
        let mut options = BTreeMap::new();
        options.insert(URL_OPTION.to_string(), url.to_string());
        if let Some(id) = collection_id {
            options.insert(COLLECTION_ID_OPTION.to_string(), id.to_string());
        }
        self.remotes.insert(name.to_string(), options);
    }

    /// Returns false when the remote does not exist.
    pub fn set_remote_option(&mut self, name: &str, key: &str, value: &str) -> bool {
        match self.remotes.get_mut(name) {
            Some(options) => {
                options.insert(key.to_string(), value.to_string());
                true
            }
            None => false,
        }
    }

    /// Serialize back to key-file text.
    pub fn to_ini_string(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "[core]");
        let _ = writeln!(out, "repo_version=1");
        let _ = writeln!(out, "mode={}", self.mode.as_str());
        if let Some(id) = &self.collection_id {
            let _ = writeln!(out, "{}={}", COLLECTION_ID_OPTION, id);
        }
        for (name, options) in &self.remotes {
            let _ = writeln!(out);
            let _ = writeln!(out, "[remote \"{}\"]", name);
            for (key, value) in options {
                let _ = writeln!(out, "{}={}", key, value);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_with_remote() {
        let mut config = RepoConfig::new(RepoMode::ArchiveZ2);
        config.add_remote("eos", "http://127.0.0.1:8080", Some("com.example.Os"));
        assert!(config.set_remote_option("eos", BRANCHES_OPTION, "os/eos/amd64/eos3;"));

        let parsed = RepoConfig::parse(&config.to_ini_string()).unwrap();
        assert_eq!(parsed.remote_option("eos", URL_OPTION), Some("http://127.0.0.1:8080"));
        assert_eq!(
            parsed.remote_option("eos", COLLECTION_ID_OPTION),
            Some("com.example.Os")
        );
        assert_eq!(
            parsed.remote_option("eos", BRANCHES_OPTION),
            Some("os/eos/amd64/eos3;")
        );
    }

    #[test]
    fn test_set_option_on_missing_remote() {
        let mut config = RepoConfig::new(RepoMode::ArchiveZ2);
        assert!(!config.set_remote_option("nope", URL_OPTION, "x"));
    }

    #[test]
    fn test_missing_core_group() {
        assert!(RepoConfig::parse("[remote \"eos\"]\nurl=http://x\n").is_err());
    }

    #[test]
    fn test_bare_user_only_mode() {
        let parsed = RepoConfig::parse("[core]\nrepo_version=1\nmode=bare-user-only\n").unwrap();
        assert_eq!(parsed.mode, RepoMode::BareUserOnly);
    }
}
