//! Choice of the locally deployed commit to advertise to peers.

use tracing::{debug, warn};

use crate::error::{Result, UpdaterError};
use crate::sysroot::Sysroot;

/// The commit this machine can serve to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisableCommit {
    pub checksum: String,
    /// Path component of the OS remote's URL, without leading slashes.
    pub ostree_path: String,
    pub timestamp: u64,
}

/// Pick the newest deployed commit of the booted OS.
///
/// `sysroot` must be loaded. Deployments whose commit cannot be loaded are
/// skipped; their first error is returned only if every deployment failed.
/// The sysroot lock is not taken.
pub fn advertisable_commit(sysroot: &Sysroot) -> Result<AdvertisableCommit> {
    let booted = sysroot
        .booted_deployment()
        .ok_or_else(|| UpdaterError::NotFound("No booted deployment".to_string()))?;
    let osname = booted.osname.as_str();
    let repo = sysroot.repo()?;

    let remote = booted
        .origin
        .as_ref()
        .and_then(|o| o.remote.clone())
        .unwrap_or_else(|| osname.to_string());
    let ostree_path = ostree_path_from_url(&repo.remote_url(&remote)?)?;

    let mut latest: Option<(String, u64)> = None;
    let mut load_error: Option<UpdaterError> = None;
    for deployment in sysroot.deployments_for_os(osname) {
        debug!(deployment = %deployment.dir_name(), "Considering deployment");
        let commit = match repo.load_commit(&deployment.checksum) {
            Ok(commit) => commit,
            Err(e) => {
                warn!(
                    "Deployment ‘{}’ uses checksum ‘{}’ which does not correspond to a commit in repository ‘{}’. Ignoring.",
                    deployment.dir_name(),
                    deployment.checksum,
                    repo.path().display()
                );
                load_error.get_or_insert_with(|| e.into());
                continue;
            }
        };
        let newer = latest
            .as_ref()
            .map_or(true, |(_, timestamp)| commit.timestamp > *timestamp);
        if newer {
            latest = Some((deployment.checksum.clone(), commit.timestamp));
        }
    }

    match (latest, load_error) {
        (Some((checksum, timestamp)), _) => Ok(AdvertisableCommit {
            checksum,
            ostree_path,
            timestamp,
        }),
        (None, Some(e)) => Err(e),
        (None, None) => Err(UpdaterError::NotFound(format!(
            "No deployments found for OS ‘{}’",
            osname
        ))),
    }
}

/// Path of a repository URL as peers request it (`http://h/a/b` → `a/b`).
pub fn ostree_path_from_url(url: &str) -> Result<String> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| UpdaterError::WrongConfiguration(format!("Invalid remote URL ‘{}’: {}", url, e)))?;
    Ok(parsed.path().trim_start_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SysrootSettings;
    use crate::refspec::Refspec;
    use crate::repo::{CommitSpec, ObjectName, ObjectType};
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn sysroot(dir: &TempDir) -> Sysroot {
        let settings = SysrootSettings {
            path: dir.path().join("sysroot"),
            cmdline_path: dir.path().join("cmdline"),
            deployment_fallback: true,
            osname: None,
        };
        let sysroot = Sysroot::create(&settings).unwrap();
        sysroot
            .repo()
            .unwrap()
            .add_remote("eos", "https://updates.example.com/ostree/eos", None)
            .unwrap();
        sysroot
    }

    fn deploy(dir: &TempDir, sysroot: &mut Sysroot, timestamp: u64) -> String {
        let tree = dir.path().join(format!("tree-{}", timestamp));
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("file"), timestamp.to_string()).unwrap();
        let repo = sysroot.repo().unwrap();
        let checksum = repo
            .commit_directory(&tree, CommitSpec { timestamp, ..Default::default() })
            .unwrap();
        let origin = Refspec::parse("eos:os/eos/amd64/master").unwrap();
        let merge = sysroot.booted_deployment().cloned();
        let deployment = sysroot
            .deploy("eos", &checksum, &origin, merge.as_ref(), &CancellationToken::new())
            .unwrap();
        sysroot.simple_write_deployment(&deployment, merge.as_ref()).unwrap();
        sysroot.load().unwrap();
        checksum
    }

    #[test]
    fn test_ostree_path_from_url() {
        assert_eq!(ostree_path_from_url("https://h.example/ostree/eos").unwrap(), "ostree/eos");
        assert_eq!(ostree_path_from_url("http://h.example//x").unwrap(), "x");
        assert!(ostree_path_from_url("not a url").is_err());
    }

    #[test]
    fn test_no_booted_deployment_is_not_found() {
        let dir = TempDir::new().unwrap();
        let sysroot = sysroot(&dir);
        let err = advertisable_commit(&sysroot).unwrap_err();
        assert_eq!(err.name(), "NOT_FOUND");
    }

    #[test]
    fn test_newest_deployment_wins() {
        let dir = TempDir::new().unwrap();
        let mut sysroot = sysroot(&dir);
        deploy(&dir, &mut sysroot, 100);
        let newer = deploy(&dir, &mut sysroot, 200);

        let ad = advertisable_commit(&sysroot).unwrap();
        assert_eq!(ad.checksum, newer);
        assert_eq!(ad.timestamp, 200);
        assert_eq!(ad.ostree_path, "ostree/eos");
    }

    #[test]
    fn test_unloadable_commits_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut sysroot = sysroot(&dir);
        let old = deploy(&dir, &mut sysroot, 100);
        let newer = deploy(&dir, &mut sysroot, 200);
        let repo = sysroot.repo().unwrap();
        repo.delete_object(&ObjectName::new(ObjectType::Commit, newer.as_str()))
            .unwrap();

        let ad = advertisable_commit(&sysroot).unwrap();
        assert_eq!(ad.checksum, old);

        repo.delete_object(&ObjectName::new(ObjectType::Commit, old.as_str()))
            .unwrap();
        let err = advertisable_commit(&sysroot).unwrap_err();
        assert_eq!(err.name(), "NOT_FOUND");
    }
}
