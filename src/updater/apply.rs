//! Apply: deploy the fetched update.
//!
//! Runs on the blocking pool. The sysroot lock is held for the whole
//! operation and released on every exit path when the guard drops.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SysrootSettings;
use crate::error::{Result, UpdaterError};
use crate::refspec::Refspec;
use crate::repo::config::{BRANCHES_OPTION, COLLECTION_ID_OPTION};
use crate::repo::Repo;
use crate::sysroot::{Deployment, PendingUpdate, Sysroot};

/// What a successful Apply did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub deployment: Deployment,
    /// False when the update was already the next boot.
    pub bootversion_changed: bool,
}

/// Deploy the pending update.
///
/// `expected` is used when no pending marker is on disk.
pub async fn apply(
    settings: &SysrootSettings,
    expected: Option<PendingUpdate>,
    cancel: &CancellationToken,
) -> Result<ApplyOutcome> {
    let settings = settings.clone();
    let cancel = cancel.clone();
    tokio::task::spawn_blocking(move || apply_blocking(&settings, expected, &cancel))
        .await
        .map_err(|e| UpdaterError::Deploy(format!("Apply task failed: {}", e)))?
}

fn apply_blocking(
    settings: &SysrootSettings,
    expected: Option<PendingUpdate>,
    cancel: &CancellationToken,
) -> Result<ApplyOutcome> {
    let mut sysroot = Sysroot::new(settings);
    let _lock = sysroot.lock()?;
    sysroot.load()?;

    let booted = sysroot
        .booted_deployment()
        .cloned()
        .ok_or_else(UpdaterError::not_ostree_system)?;
    info!(
        osname = %booted.osname,
        serial = booted.serial,
        checksum = %booted.checksum,
        "Booted (old) deployment"
    );

    let pending = match sysroot.read_pending_update()? {
        Some(pending) => pending,
        None => {
            debug!("No pending update marker; using the fetched update");
            expected.ok_or_else(|| UpdaterError::NotFound("No fetched update to apply".to_string()))?
        }
    };
    let update_refspec = Refspec::parse(&pending.refspec)?;
    let osname = settings.osname.clone().unwrap_or_else(|| booted.osname.clone());
    let bootversion = sysroot.bootversion();

    info!(revision = %pending.checksum, "Creating finalized deployment");
    let deployment = sysroot.deploy(&osname, &pending.checksum, &update_refspec, Some(&booted), cancel)?;
    sysroot.simple_write_deployment(&deployment, Some(&booted))?;
    let bootversion_changed = sysroot.bootversion() != bootversion;
    if !bootversion_changed {
        warn!(
            revision = %pending.checksum,
            "Deployment list unchanged; the update was already deployed"
        );
    }
    info!(
        osname = %deployment.osname,
        serial = deployment.serial,
        checksum = %deployment.checksum,
        "New deployment"
    );
    sysroot.clear_pending_update()?;

    let repo = sysroot.repo()?;
    if pending.refspec != pending.original_refspec {
        match Refspec::parse(&pending.original_refspec) {
            Ok(original) => {
                if let Err(e) = repo.delete_ref(&original) {
                    warn!(refspec = %original, error = %e, "Failed to delete the original ref");
                }
            }
            Err(e) => warn!(refspec = %pending.original_refspec, error = %e, "Invalid original refspec"),
        }
    }

    match sysroot.cleanup() {
        Ok(stats) => debug!(
            pruned = stats.objects_pruned,
            bytes_freed = stats.bytes_freed,
            "Cleaned up the sysroot"
        ),
        Err(e) => warn!("Failed to clean up the sysroot after successful deployment: {}", e),
    }

    if let Err(e) = update_remote_branches(&repo, &update_refspec) {
        warn!(refspec = %update_refspec, error = %e, "Failed to update the remote branches option");
    }
    if let Err(e) = update_remote_collection_id(&repo, &update_refspec, &pending.checksum) {
        warn!(refspec = %update_refspec, error = %e, "Failed to update the remote collection id");
    }

    Ok(ApplyOutcome {
        deployment,
        bootversion_changed,
    })
}

fn remote_of(refspec: &Refspec) -> Result<&str> {
    refspec.remote.as_deref().ok_or_else(|| {
        UpdaterError::InvalidConfig(format!(
            "Invalid refspec ‘{}’ in origin: did not contain a remote name",
            refspec
        ))
    })
}

/// Point the remote's `branches` option at the deployed ref only.
fn update_remote_branches(repo: &Repo, refspec: &Refspec) -> Result<()> {
    let remote = remote_of(refspec)?;
    let branches = format!("{};", refspec.ref_name);
    if repo.remote_option(remote, BRANCHES_OPTION)?.as_deref() != Some(branches.as_str()) {
        repo.set_remote_option(remote, BRANCHES_OPTION, &branches)?;
    }
    Ok(())
}

/// Give the remote the deployed commit's collection id if it has none.
fn update_remote_collection_id(repo: &Repo, refspec: &Refspec, checksum: &str) -> Result<()> {
    let remote = remote_of(refspec)?;
    if repo
        .remote_option(remote, COLLECTION_ID_OPTION)?
        .is_some_and(|id| !id.is_empty())
    {
        return Ok(());
    }
    let commit = repo.load_commit(checksum)?;
    match commit.collection_binding() {
        Some(collection_id) => repo.set_remote_option(remote, COLLECTION_ID_OPTION, collection_id)?,
        None => debug!("No ostree.collection-binding metadata key on commit; not setting a collection ID locally"),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::CommitSpec;
    use serde_json::json;
    use std::collections::BTreeMap;
    use std::fs;
    use tempfile::TempDir;

    const ORIGIN: &str = "eos:os/eos/amd64/eos3";

    fn settings(dir: &TempDir) -> SysrootSettings {
        SysrootSettings {
            path: dir.path().join("sysroot"),
            cmdline_path: dir.path().join("cmdline"),
            deployment_fallback: false,
            osname: None,
        }
    }

    fn commit(dir: &TempDir, repo: &Repo, name: &str, timestamp: u64, metadata: BTreeMap<String, serde_json::Value>) -> String {
        let tree = dir.path().join(name);
        fs::create_dir_all(tree.join("etc")).unwrap();
        fs::write(tree.join("usr-file"), name).unwrap();
        repo.commit_directory(
            &tree,
            CommitSpec {
                timestamp,
                metadata,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn booted_sysroot(dir: &TempDir) -> (Sysroot, Repo) {
        let mut sysroot = Sysroot::create(&settings(dir)).unwrap();
        let repo = sysroot.repo().unwrap();
        repo.add_remote("eos", "http://example.com/ostree", None).unwrap();
        let checksum = commit(dir, &repo, "v1", 1, BTreeMap::new());
        let deployment = sysroot
            .deploy("eos", &checksum, &Refspec::parse(ORIGIN).unwrap(), None, &CancellationToken::new())
            .unwrap();
        sysroot.simple_write_deployment(&deployment, None).unwrap();
        fs::write(
            dir.path().join("cmdline"),
            format!("ostree=/ostree/deploy/eos/deploy/{}\n", deployment.dir_name()),
        )
        .unwrap();
        sysroot.load().unwrap();
        (sysroot, repo)
    }

    #[tokio::test]
    async fn test_apply_deploys_pending_update() {
        let dir = TempDir::new().unwrap();
        let (sysroot, repo) = booted_sysroot(&dir);
        let metadata = BTreeMap::from([("ostree.collection-binding".to_string(), json!("com.example.Os"))]);
        let update = commit(&dir, &repo, "v2", 2, metadata);
        sysroot
            .write_pending_update(&PendingUpdate {
                checksum: update.clone(),
                refspec: ORIGIN.to_string(),
                original_refspec: ORIGIN.to_string(),
            })
            .unwrap();

        let outcome = apply(&settings(&dir), None, &CancellationToken::new()).await.unwrap();
        assert!(outcome.bootversion_changed);
        assert_eq!(outcome.deployment.checksum, update);

        let mut reloaded = Sysroot::new(&settings(&dir));
        reloaded.load().unwrap();
        assert_eq!(reloaded.deployments()[0].checksum, update);
        assert!(reloaded.read_pending_update().unwrap().is_none());
        assert_eq!(
            repo.remote_option("eos", BRANCHES_OPTION).unwrap().as_deref(),
            Some("os/eos/amd64/eos3;")
        );
        assert_eq!(
            repo.remote_option("eos", COLLECTION_ID_OPTION).unwrap().as_deref(),
            Some("com.example.Os")
        );
    }

    #[tokio::test]
    async fn test_apply_twice_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (_, repo) = booted_sysroot(&dir);
        let update = commit(&dir, &repo, "v2", 2, BTreeMap::new());
        let pending = PendingUpdate {
            checksum: update,
            refspec: ORIGIN.to_string(),
            original_refspec: ORIGIN.to_string(),
        };

        let first = apply(&settings(&dir), Some(pending.clone()), &CancellationToken::new())
            .await
            .unwrap();
        assert!(first.bootversion_changed);
        let second = apply(&settings(&dir), Some(pending), &CancellationToken::new())
            .await
            .unwrap();
        assert!(!second.bootversion_changed);
        assert_eq!(first.deployment, second.deployment);
    }

    #[tokio::test]
    async fn test_apply_deletes_original_ref_after_rebase() {
        let dir = TempDir::new().unwrap();
        let (_, repo) = booted_sysroot(&dir);
        let update = commit(&dir, &repo, "v2", 2, BTreeMap::new());
        let original = Refspec::parse(ORIGIN).unwrap();
        let target = Refspec::parse("eos:os/eos/amd64/eos4").unwrap();
        repo.set_ref(&original, Some(&update)).unwrap();
        repo.set_ref(&target, Some(&update)).unwrap();

        let pending = PendingUpdate {
            checksum: update,
            refspec: target.to_string(),
            original_refspec: original.to_string(),
        };
        apply(&settings(&dir), Some(pending), &CancellationToken::new())
            .await
            .unwrap();
        assert!(repo.read_ref(&original).unwrap().is_none());
        assert!(repo.read_ref(&target).unwrap().is_some());
        assert_eq!(
            repo.remote_option("eos", BRANCHES_OPTION).unwrap().as_deref(),
            Some("os/eos/amd64/eos4;")
        );
    }

    #[tokio::test]
    async fn test_apply_without_pending_update_fails() {
        let dir = TempDir::new().unwrap();
        booted_sysroot(&dir);
        let err = apply(&settings(&dir), None, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.name(), "NOT_FOUND");
    }
}
