//! Object model of the content-addressed store.
//!
//! Objects are immutable byte strings named by the SHA-256 of their stored
//! bytes. Commits and dirtrees are JSON documents; file objects hold raw
//! content.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Metadata key naming the successor ref of a checkpoint commit.
pub const CHECKPOINT_TARGET_KEY: &str = "eos.checkpoint-target";
/// Human-visible version string.
pub const VERSION_KEY: &str = "version";
/// Legacy spelling of the version key.
pub const EOS_VERSION_KEY: &str = "eos.version";
/// Authoritative collection id of the commit.
pub const COLLECTION_BINDING_KEY: &str = "ostree.collection-binding";
/// Authoritative ref names of the commit.
pub const REF_BINDING_KEY: &str = "ostree.ref-binding";
/// Ref to follow once this ref reaches end of life.
pub const ENDOFLIFE_REBASE_KEY: &str = "ostree.endoflife-rebase";
/// Release notes URI template.
pub const RELEASE_NOTES_URI_KEY: &str = "eos-updater.release-notes-uri";
/// Per-object archived/unpacked sizes.
pub const SIZES_KEY: &str = "ostree.sizes";

/// Kind of stored object; doubles as the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Commit,
    DirTree,
    File,
}

impl ObjectType {
    pub fn extension(self) -> &'static str {
        match self {
            ObjectType::Commit => "commit",
            ObjectType::DirTree => "dirtree",
            ObjectType::File => "file",
        }
    }

    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext {
            "commit" => Some(ObjectType::Commit),
            "dirtree" => Some(ObjectType::DirTree),
            "file" => Some(ObjectType::File),
            _ => None,
        }
    }

    /// Metadata objects describe structure; file objects carry content.
    pub fn is_meta(self) -> bool {
        !matches!(self, ObjectType::File)
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Object identity: type plus checksum.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectName {
    pub object_type: ObjectType,
    pub checksum: String,
}

impl ObjectName {
    pub fn new(object_type: ObjectType, checksum: impl Into<String>) -> Self {
        Self {
            object_type,
            checksum: checksum.into(),
        }
    }

    /// Path relative to the repository root, e.g. `objects/ab/cdef….commit`.
    pub fn relative_path(&self) -> String {
        let (prefix, rest) = if self.checksum.len() > 2 && self.checksum.is_char_boundary(2) {
            self.checksum.split_at(2)
        } else {
            ("", self.checksum.as_str())
        };
        format!("objects/{}/{}.{}", prefix, rest, self.object_type.extension())
    }
}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.checksum, self.object_type)
    }
}

/// SHA-256 of `bytes` as lowercase hex.
pub fn checksum_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Whether `s` is a well-formed 64-character lowercase hex checksum.
pub fn is_valid_checksum(s: &str) -> bool {
    s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// A commit object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Commit {
    pub parent: Option<String>,
    /// Seconds since the Unix epoch.
    pub timestamp: u64,
    pub subject: String,
    pub body: String,
    /// Checksum of the root dirtree.
    pub root_tree: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
}

impl Commit {
    /// String metadata value, if present and a string.
    pub fn metadata_str(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).and_then(Value::as_str)
    }

    /// Human-visible version (`version`, falling back to `eos.version`).
    pub fn version(&self) -> Option<&str> {
        self.metadata_str(VERSION_KEY)
            .or_else(|| self.metadata_str(EOS_VERSION_KEY))
    }

    pub fn collection_binding(&self) -> Option<&str> {
        self.metadata_str(COLLECTION_BINDING_KEY)
    }

    pub fn endoflife_rebase(&self) -> Option<&str> {
        self.metadata_str(ENDOFLIFE_REBASE_KEY)
    }

    pub fn release_notes_uri(&self) -> Option<&str> {
        self.metadata_str(RELEASE_NOTES_URI_KEY)
    }

    /// Size entries; `None` when the commit carries no size metadata or it
    /// does not parse.
    pub fn sizes(&self) -> Option<Vec<SizeEntry>> {
        let value = self.metadata.get(SIZES_KEY)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Canonical serialized form; its checksum names the commit.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Archived and unpacked size of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeEntry {
    pub object: ObjectName,
    pub archived: u64,
    pub unpacked: u64,
}

/// A directory listing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirTree {
    #[serde(default)]
    pub files: Vec<FileEntry>,
    #[serde(default)]
    pub dirs: Vec<DirEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub checksum: String,
    /// Unix permission bits of the checked-out file.
    #[serde(default = "default_file_mode")]
    pub mode: u32,
}

/// Mode bits a bare-user-only repository refuses to store.
pub const PRIVILEGED_MODE_BITS: u32 = 0o6000;

fn default_file_mode() -> u32 {
    0o644
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub tree: String,
}

impl DirTree {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// Leading integer of a version string (`"3.9.2"` → 3).
pub fn major_version(version: &str) -> Option<u64> {
    let digits: String = version.chars().take_while(|c| c.is_ascii_digit()).collect();
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_is_sha256_hex() {
        assert_eq!(
            checksum_bytes(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert!(is_valid_checksum(&checksum_bytes(b"abc")));
        assert!(!is_valid_checksum("E3B0"));
        assert!(!is_valid_checksum(&"g".repeat(64)));
    }

    #[test]
    fn test_relative_path_splits_checksum() {
        let name = ObjectName::new(ObjectType::Commit, checksum_bytes(b"x"));
        let path = name.relative_path();
        assert!(path.starts_with(&format!("objects/{}/", &name.checksum[..2])));
        assert!(path.ends_with(".commit"));
    }

    #[test]
    fn test_version_falls_back_to_eos_version() {
        let mut commit = Commit {
            parent: None,
            timestamp: 1,
            subject: String::new(),
            body: String::new(),
            root_tree: String::new(),
            metadata: BTreeMap::new(),
        };
        assert!(commit.version().is_none());
        commit
            .metadata
            .insert(EOS_VERSION_KEY.to_string(), Value::from("3.1"));
        assert_eq!(commit.version(), Some("3.1"));
        commit
            .metadata
            .insert(VERSION_KEY.to_string(), Value::from("4.0"));
        assert_eq!(commit.version(), Some("4.0"));
    }

    #[test]
    fn test_major_version() {
        assert_eq!(major_version("3.9.2"), Some(3));
        assert_eq!(major_version("10"), Some(10));
        assert_eq!(major_version("beta"), None);
    }
}
