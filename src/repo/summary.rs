//! Repository summary: the ref → commit index peers read before pulling.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{checksum_bytes, Repo, RepoError, Result};

/// File name of the summary at the repository root.
pub const SUMMARY_FILE: &str = "summary";
/// File name of the summary signature.
pub const SUMMARY_SIG_FILE: &str = "summary.sig";

/// One ref entry of a summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRef {
    pub checksum: String,
    /// Commit timestamp, seconds since the epoch.
    pub timestamp: u64,
}

/// The summary document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Generation time, seconds since the epoch.
    pub timestamp: u64,
    #[serde(default)]
    pub collection_id: Option<String>,
    #[serde(default)]
    pub refs: BTreeMap<String, SummaryRef>,
}

impl Summary {
    pub fn from_bytes(bytes: &[u8]) -> std::result::Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    pub fn to_bytes(&self) -> std::result::Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec_pretty(self)
    }

    pub fn lookup(&self, ref_name: &str) -> Option<&SummaryRef> {
        self.refs.get(ref_name)
    }

    /// Newest commit timestamp offered, or 0 for an empty summary.
    pub fn latest_timestamp(&self) -> u64 {
        self.refs.values().map(|r| r.timestamp).max().unwrap_or(0)
    }
}

/// Signature over summary bytes.
pub fn sign_summary(bytes: &[u8]) -> String {
    checksum_bytes(bytes)
}

impl Repo {
    /// Rebuild `summary` and `summary.sig` from the local heads, plus the refs
    /// of `remote` when given (local heads win on conflict).
    pub fn regenerate_summary(&self, remote: Option<&str>) -> Result<Summary> {
        let config = self.read_config()?;
        let mut refs = BTreeMap::new();
        if let Some(remote) = remote {
            refs.extend(self.list_refs(Some(remote))?);
        }
        refs.extend(self.list_refs(None)?);

        let mut summary = Summary {
            timestamp: chrono::Utc::now().timestamp().max(0) as u64,
            collection_id: config.collection_id.clone().or_else(|| {
                remote.and_then(|r| {
                    config
                        .remote_option(r, super::config::COLLECTION_ID_OPTION)
                        .map(str::to_string)
                })
            }),
            refs: BTreeMap::new(),
        };

        for (ref_name, checksum) in refs {
            match self.load_commit(&checksum) {
                Ok(commit) => {
                    summary.refs.insert(
                        ref_name,
                        SummaryRef {
                            checksum,
                            timestamp: commit.timestamp,
                        },
                    );
                }
                Err(e) => {
                    warn!(ref_name = %ref_name, checksum = %checksum, error = %e, "Omitting ref with unloadable commit from summary");
                }
            }
        }

        let bytes = summary.to_bytes().map_err(|e| RepoError::Corrupt {
            name: SUMMARY_FILE.to_string(),
            reason: e.to_string(),
        })?;
        self.write_atomic(&self.path().join(SUMMARY_FILE), &bytes)?;
        self.write_atomic(
            &self.path().join(SUMMARY_SIG_FILE),
            sign_summary(&bytes).as_bytes(),
        )?;
        debug!(refs = summary.refs.len(), "Regenerated summary");
        Ok(summary)
    }

    /// Read the stored summary, if any.
    pub fn read_summary(&self) -> Result<Option<Summary>> {
        let path = self.path().join(SUMMARY_FILE);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(RepoError::Io { path, source: e }),
        };
        Summary::from_bytes(&bytes)
            .map(Some)
            .map_err(|e| RepoError::Corrupt {
                name: SUMMARY_FILE.to_string(),
                reason: e.to_string(),
            })
    }
}
