//! INI key-file loading on top of the `config` crate.
//!
//! Group names are case-sensitive and kept as written. Key names are
//! normalised to lowercase.

use std::collections::BTreeMap;
use std::path::Path;

use ::config::{ConfigError as ConfigLibError, FileFormat, Format};

use super::ConfigError;

/// Parsed key file: group name → key → value.
pub type IniGroups = BTreeMap<String, BTreeMap<String, String>>;

/// Load an INI file from disk.
pub fn load_ini(path: &Path) -> Result<IniGroups, ConfigError> {
    let contents = std::fs::read_to_string(path)
        .map_err(|e| ConfigLibError::Foreign(Box::new(e)))?;
    let uri = path.display().to_string();
    parse(Some(&uri), &contents)
}

/// Parse INI text.
pub fn parse_ini(contents: &str) -> Result<IniGroups, ConfigError> {
    parse(None, contents)
}

// The config builder lowercases every key path, so the format is used
// directly to keep group names intact.
fn parse(uri: Option<&String>, contents: &str) -> Result<IniGroups, ConfigError> {
    let raw = Format::parse(&FileFormat::Ini, uri, contents).map_err(ConfigLibError::Foreign)?;

    let mut groups = IniGroups::new();
    for (group, value) in raw {
        let Ok(table) = value.into_table() else {
            continue;
        };
        let entry = groups.entry(group).or_default();
        for (key, value) in table {
            entry.insert(key.to_lowercase(), value.into_string()?);
        }
    }
    Ok(groups)
}

/// Parse an INI boolean (`true`/`false`, `1`/`0`, `yes`/`no`).
pub fn parse_bool(group: &str, key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(ConfigError::Invalid(format!(
            "Invalid boolean ‘{}’ for key {} in group {}",
            value, key, group
        ))),
    }
}

/// Split a `;`-separated list, dropping empty entries.
pub fn parse_list(value: &str) -> Vec<String> {
    value
        .split(';')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
