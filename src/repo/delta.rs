//! Static deltas.
//!
//! A delta from commit `A` to commit `B` lives under `deltas/A-B/` (or
//! `deltas/B/` when generated from scratch). The `superblock` lists the
//! objects `B` shares with `A`, which must already be present locally, and
//! the part files carrying every other object of `B`.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::info;

use super::{ObjectName, Repo, RepoError, Result};

/// Upper bound on raw payload bytes per part.
const MAX_PART_BYTES: usize = 1024 * 1024;

/// Superblock file name inside a delta directory.
pub const SUPERBLOCK_FILE: &str = "superblock";

/// Delta index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Superblock {
    pub from: Option<String>,
    pub to: String,
    /// Objects the delta does not carry; they must exist before applying.
    pub required_objects: Vec<ObjectName>,
    /// Part file names relative to the delta directory.
    pub parts: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaPart {
    pub objects: Vec<DeltaObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeltaObject {
    pub object: ObjectName,
    /// Base64-encoded object bytes.
    pub data: String,
}

/// Directory of the delta relative to the repository root.
pub fn delta_dir(from: Option<&str>, to: &str) -> String {
    match from {
        Some(from) => format!("deltas/{}-{}", from, to),
        None => format!("deltas/{}", to),
    }
}

fn corrupt(name: &str, e: impl std::fmt::Display) -> RepoError {
    RepoError::Corrupt {
        name: name.to_string(),
        reason: e.to_string(),
    }
}

impl Superblock {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| corrupt(SUPERBLOCK_FILE, e))
    }
}

impl Repo {
    /// Write a static delta between two local commits.
    pub fn generate_static_delta(&self, from: Option<&str>, to: &str) -> Result<Superblock> {
        let target = self.traverse_commit(to)?;
        let base = match from {
            Some(from) => self.traverse_commit(from)?,
            None => Default::default(),
        };

        let dir = self.path().join(delta_dir(from, to));
        let mut superblock = Superblock {
            from: from.map(str::to_string),
            to: to.to_string(),
            required_objects: Vec::new(),
            parts: Vec::new(),
        };

        let mut part = DeltaPart {
            objects: Vec::new(),
        };
        let mut part_bytes = 0usize;
        for object in target {
            if base.contains(&object) {
                superblock.required_objects.push(object);
                continue;
            }
            let bytes = self.read_object(&object)?;
            part_bytes += bytes.len();
            part.objects.push(DeltaObject {
                object,
                data: BASE64.encode(&bytes),
            });
            if part_bytes >= MAX_PART_BYTES {
                self.write_delta_part(&dir, &mut superblock, &part)?;
                part.objects.clear();
                part_bytes = 0;
            }
        }
        if !part.objects.is_empty() {
            self.write_delta_part(&dir, &mut superblock, &part)?;
        }

        let bytes = serde_json::to_vec(&superblock).map_err(|e| corrupt(SUPERBLOCK_FILE, e))?;
        self.write_atomic(&dir.join(SUPERBLOCK_FILE), &bytes)?;
        info!(
            from = from.unwrap_or("(scratch)"),
            to = %to,
            parts = superblock.parts.len(),
            required = superblock.required_objects.len(),
            "Generated static delta"
        );
        Ok(superblock)
    }

    fn write_delta_part(
        &self,
        dir: &std::path::Path,
        superblock: &mut Superblock,
        part: &DeltaPart,
    ) -> Result<()> {
        let name = superblock.parts.len().to_string();
        let bytes = serde_json::to_vec(part).map_err(|e| corrupt(&name, e))?;
        self.write_atomic(&dir.join(&name), &bytes)?;
        superblock.parts.push(name);
        Ok(())
    }

    /// First required base object that is not stored locally.
    pub fn missing_delta_base<'a>(&self, superblock: &'a Superblock) -> Option<&'a ObjectName> {
        superblock
            .required_objects
            .iter()
            .find(|object| !self.has_object(object))
    }

    /// Decode a part and store its objects; returns the number of payload
    /// bytes written.
    pub fn apply_delta_part(&self, part_name: &str, bytes: &[u8]) -> Result<u64> {
        let part: DeltaPart = serde_json::from_slice(bytes).map_err(|e| corrupt(part_name, e))?;
        let mut written = 0u64;
        for entry in part.objects {
            let data = BASE64
                .decode(entry.data.as_bytes())
                .map_err(|e| corrupt(&entry.object.to_string(), e))?;
            self.write_object_verified(&entry.object, &data)?;
            written += data.len() as u64;
        }
        Ok(written)
    }
}
