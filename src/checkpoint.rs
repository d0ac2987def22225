//! Checkpoint policy.
//!
//! A commit can name a successor ref in `eos.checkpoint-target`. Systems
//! booted from such a commit only move to that successor; any other target
//! is blocked with a reason operators can read.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use tracing::info;

use crate::config::FORCE_FOLLOW_CHECKPOINT_ENV_VAR;
use crate::error::{Result, UpdaterError};
use crate::refspec::Refspec;
use crate::repo::object::CHECKPOINT_TARGET_KEY;
use crate::repo::Repo;

/// Why a checkpoint crossing is blocked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlockReason {
    NotSpecified,
    TargetEqualsSource,
    PolicyForbids,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::NotSpecified => "not-specified",
            BlockReason::TargetEqualsSource => "target-equals-source",
            BlockReason::PolicyForbids => "policy-forbids",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A blocked crossing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointBlock {
    pub reason: BlockReason,
    pub detail: String,
}

impl CheckpointBlock {
    pub fn new(reason: BlockReason, detail: impl Into<String>) -> Self {
        Self {
            reason,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for CheckpointBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reason, self.detail)
    }
}

impl From<CheckpointBlock> for UpdaterError {
    fn from(block: CheckpointBlock) -> Self {
        UpdaterError::CheckpointBlock(block)
    }
}

/// Forced decision from `EOS_UPDATER_FORCE_FOLLOW_CHECKPOINT` (`1` or `0`).
pub fn forced_decision() -> Option<bool> {
    match std::env::var(FORCE_FOLLOW_CHECKPOINT_ENV_VAR).as_deref() {
        Ok("1") => Some(true),
        Ok("0") => Some(false),
        _ => None,
    }
}

/// Decide whether a system booted from a commit with `metadata` on
/// `booted_ref` may move to `target_ref`.
///
/// Depends only on its arguments.
pub fn should_follow(
    booted_ref: &str,
    target_ref: &str,
    metadata: &BTreeMap<String, Value>,
) -> std::result::Result<(), CheckpointBlock> {
    if target_ref == booted_ref {
        return Err(CheckpointBlock::new(
            BlockReason::TargetEqualsSource,
            format!("target ref {} is the booted ref", target_ref),
        ));
    }

    let Some(value) = metadata.get(CHECKPOINT_TARGET_KEY) else {
        return Ok(());
    };
    let successor = match value.as_str().map(Refspec::parse) {
        Some(Ok(refspec)) => refspec,
        Some(Err(e)) => {
            return Err(CheckpointBlock::new(
                BlockReason::NotSpecified,
                format!("invalid {} metadata: {}", CHECKPOINT_TARGET_KEY, e),
            ))
        }
        None => {
            return Err(CheckpointBlock::new(
                BlockReason::NotSpecified,
                format!("{} metadata is not a string", CHECKPOINT_TARGET_KEY),
            ))
        }
    };

    if successor.ref_name == target_ref {
        Ok(())
    } else {
        Err(CheckpointBlock::new(
            BlockReason::PolicyForbids,
            format!(
                "configured successor is {}, target is {}",
                successor.ref_name, target_ref
            ),
        ))
    }
}

/// Evaluate the policy for the commit `booted_checksum` stored in `repo`,
/// honouring the environment override.
///
/// A blocked crossing is `Err(UpdaterError::CheckpointBlock)`; any other
/// error means the decision could not be made.
pub fn should_follow_commit(
    repo: &Repo,
    booted_checksum: &str,
    booted_ref: &str,
    target_ref: &str,
) -> Result<()> {
    match forced_decision() {
        Some(true) => {
            info!(
                target_ref = %target_ref,
                "Forcing checkpoint target to be used as {}=1 is set",
                FORCE_FOLLOW_CHECKPOINT_ENV_VAR
            );
            return Ok(());
        }
        Some(false) => {
            info!(
                target_ref = %target_ref,
                "Forcing checkpoint target not to be used as {}=0 is set",
                FORCE_FOLLOW_CHECKPOINT_ENV_VAR
            );
            return Err(CheckpointBlock::new(
                BlockReason::PolicyForbids,
                format!("{}=0 is set", FORCE_FOLLOW_CHECKPOINT_ENV_VAR),
            )
            .into());
        }
        None => {}
    }

    let commit = repo.load_commit(booted_checksum)?;
    should_follow(booted_ref, target_ref, &commit.metadata).map_err(UpdaterError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;

    const EOS3: &str = "os/eos/amd64/eos3";
    const EOS4: &str = "os/eos/amd64/eos4";

    fn metadata(target: Value) -> BTreeMap<String, Value> {
        BTreeMap::from([(CHECKPOINT_TARGET_KEY.to_string(), target)])
    }

    #[test]
    fn test_same_ref_is_blocked() {
        let block = should_follow(EOS3, EOS3, &BTreeMap::new()).unwrap_err();
        assert_eq!(block.reason, BlockReason::TargetEqualsSource);
    }

    #[test]
    fn test_no_checkpoint_permits() {
        assert!(should_follow(EOS3, EOS4, &BTreeMap::new()).is_ok());
    }

    #[test]
    fn test_matching_successor_permits() {
        assert!(should_follow(EOS3, EOS4, &metadata(json!(EOS4))).is_ok());
        // A remote in the metadata is ignored.
        assert!(should_follow(EOS3, EOS4, &metadata(json!(format!("eos:{}", EOS4)))).is_ok());
    }

    #[test]
    fn test_other_successor_is_forbidden() {
        let block = should_follow(EOS3, "os/eos/amd64/eos5", &metadata(json!(EOS4))).unwrap_err();
        assert_eq!(block.reason, BlockReason::PolicyForbids);
        assert_eq!(
            block.detail,
            "configured successor is os/eos/amd64/eos4, target is os/eos/amd64/eos5"
        );
    }

    #[test]
    fn test_malformed_metadata_is_not_specified() {
        let block = should_follow(EOS3, EOS4, &metadata(json!(42))).unwrap_err();
        assert_eq!(block.reason, BlockReason::NotSpecified);
        let block = should_follow(EOS3, EOS4, &metadata(json!("bad ref"))).unwrap_err();
        assert_eq!(block.reason, BlockReason::NotSpecified);
    }

    #[test]
    fn test_decision_is_stable() {
        let meta = metadata(json!(EOS4));
        let first = should_follow(EOS3, "other", &meta);
        for _ in 0..3 {
            assert_eq!(should_follow(EOS3, "other", &meta), first);
        }
    }

    #[test]
    #[serial]
    fn test_forced_decision_from_env() {
        std::env::set_var(FORCE_FOLLOW_CHECKPOINT_ENV_VAR, "1");
        assert_eq!(forced_decision(), Some(true));
        std::env::set_var(FORCE_FOLLOW_CHECKPOINT_ENV_VAR, "0");
        assert_eq!(forced_decision(), Some(false));
        std::env::set_var(FORCE_FOLLOW_CHECKPOINT_ENV_VAR, "maybe");
        assert_eq!(forced_decision(), None);
        std::env::remove_var(FORCE_FOLLOW_CHECKPOINT_ENV_VAR);
    }

    #[test]
    #[serial]
    fn test_should_follow_commit_loads_metadata() {
        use crate::repo::{CommitSpec, RepoMode};

        let dir = tempfile::TempDir::new().unwrap();
        let repo = Repo::create(&dir.path().join("repo"), RepoMode::ArchiveZ2).unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        let checksum = repo
            .commit_directory(
                &tree,
                CommitSpec {
                    timestamp: 1,
                    metadata: metadata(json!(EOS4)),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(should_follow_commit(&repo, &checksum, EOS3, EOS4).is_ok());
        let err = should_follow_commit(&repo, &checksum, EOS3, "os/other").unwrap_err();
        assert_eq!(err.name(), "CHECKPOINT_BLOCK");
        let err = should_follow_commit(&repo, &"0".repeat(64), EOS3, EOS4).unwrap_err();
        assert_eq!(err.name(), "NOT_FOUND");
    }
}
