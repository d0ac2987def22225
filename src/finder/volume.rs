//! Removable-volume finder.
//!
//! A volume offers updates when it contains a repository at
//! `<mount>/.ostree/repo`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Finder, OfferedRef, SourceKind, SourceResult};
use crate::error::{Result, UpdaterError};
use crate::refspec::CollectionRef;
use crate::repo::Repo;

/// Location of the repository relative to the volume root.
pub const VOLUME_REPO_PATH: &str = ".ostree/repo";

/// Mount-point prefixes under which removable media appear.
const REMOVABLE_MOUNT_PREFIXES: &[&str] = &["/media/", "/run/media/", "/mnt/"];

/// Mount points of removable volumes listed in a `mounts` table such as
/// `/proc/self/mounts`. An unreadable table lists nothing.
pub fn removable_mounts(mounts_table: &Path) -> Vec<PathBuf> {
    let contents = match std::fs::read_to_string(mounts_table) {
        Ok(contents) => contents,
        Err(e) => {
            debug!(path = %mounts_table.display(), error = %e, "Cannot read mount table");
            return Vec::new();
        }
    };
    contents
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .map(unescape_mount_path)
        .filter(|mount| {
            REMOVABLE_MOUNT_PREFIXES
                .iter()
                .any(|prefix| mount.starts_with(prefix) || format!("{}/", mount) == *prefix)
        })
        .map(PathBuf::from)
        .collect()
}

// The kernel octal-escapes space, tab, newline and backslash.
fn unescape_mount_path(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\\' {
            let digits: String = chars.clone().take(3).collect();
            if digits.len() == 3 && digits.chars().all(|d| ('0'..='7').contains(&d)) {
                if let Ok(code) = u8::from_str_radix(&digits, 8) {
                    out.push(char::from(code));
                    for _ in 0..3 {
                        chars.next();
                    }
                    continue;
                }
            }
        }
        out.push(c);
    }
    out
}

/// Finder for one mounted volume.
pub struct VolumeFinder {
    mount: PathBuf,
}

impl VolumeFinder {
    pub fn new(mount: impl Into<PathBuf>) -> Self {
        Self {
            mount: mount.into(),
        }
    }

    pub fn repo_path(&self) -> PathBuf {
        self.mount.join(VOLUME_REPO_PATH)
    }
}

#[async_trait]
impl Finder for VolumeFinder {
    fn kind(&self) -> SourceKind {
        SourceKind::Volume
    }

    fn describe(&self) -> String {
        format!("volume ({})", self.mount.display())
    }

    async fn find(
        &self,
        refs: &[CollectionRef],
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceResult>> {
        if cancel.is_cancelled() {
            return Err(UpdaterError::cancelled());
        }

        let repo_path = self.repo_path();
        if !repo_path.is_dir() {
            debug!(path = %repo_path.display(), "No repository on volume");
            return Ok(Vec::new());
        }

        let refs = refs.to_vec();
        let result = tokio::task::spawn_blocking(move || scan_volume_repo(&repo_path, &refs))
            .await
            .map_err(|e| UpdaterError::Io(format!("Volume scan task failed: {}", e)))??;

        info!(
            volume = %self.mount.display(),
            offered = result.offered_refs.len(),
            "Scanned volume"
        );
        Ok(if result.offered_refs.is_empty() {
            Vec::new()
        } else {
            vec![result]
        })
    }
}

fn scan_volume_repo(repo_path: &Path, wanted: &[CollectionRef]) -> Result<SourceResult> {
    let repo = Repo::open(repo_path)?;
    let base_url = format!("file://{}", repo_path.display());

    if let Some(summary) = repo.read_summary()? {
        return Ok(SourceResult::from_summary(
            SourceKind::Volume,
            &base_url,
            0,
            &summary,
            wanted,
            None,
        ));
    }

    let config = repo.read_config()?;
    let mut result = SourceResult::new(SourceKind::Volume, &base_url, 0);
    let local = repo.list_refs(None)?;
    for target in wanted {
        let Some(checksum) = local.get(&target.ref_name) else {
            continue;
        };
        if !target.matches(config.collection_id.as_deref(), &target.ref_name) {
            continue;
        }
        match repo.load_commit(checksum) {
            Ok(commit) => result.offered_refs.push(OfferedRef {
                collection_ref: CollectionRef::new(config.collection_id.as_deref(), &target.ref_name),
                checksum: checksum.clone(),
                timestamp: commit.timestamp,
            }),
            Err(e) => warn!(ref_name = %target.ref_name, error = %e, "Skipping unloadable commit on volume"),
        }
    }
    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refspec::Refspec;
    use crate::repo::{CommitSpec, RepoMode};
    use tempfile::TempDir;

    const REF: &str = "os/eos/amd64/eos3";

    fn volume_with_commit(dir: &TempDir, summary: bool) -> String {
        let repo = Repo::create(&dir.path().join(VOLUME_REPO_PATH), RepoMode::ArchiveZ2).unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("f"), "v").unwrap();
        let checksum = repo
            .commit_directory(&tree, CommitSpec { timestamp: 9, ..Default::default() })
            .unwrap();
        repo.set_ref(&Refspec::parse(REF).unwrap(), Some(&checksum)).unwrap();
        if summary {
            repo.regenerate_summary(None).unwrap();
        }
        checksum
    }

    #[test]
    fn test_removable_mounts() {
        let dir = TempDir::new().unwrap();
        let table = dir.path().join("mounts");
        std::fs::write(
            &table,
            "/dev/sda1 / ext4 rw 0 0\n\
             /dev/sdb1 /media/user/USB\\040Stick vfat rw 0 0\n\
             /dev/sdc1 /run/media/user/disk ext4 rw 0 0\n\
             proc /proc proc rw 0 0\n",
        )
        .unwrap();
        let mounts = removable_mounts(&table);
        assert_eq!(
            mounts,
            vec![
                PathBuf::from("/media/user/USB Stick"),
                PathBuf::from("/run/media/user/disk"),
            ]
        );
        assert!(removable_mounts(&dir.path().join("absent")).is_empty());
    }

    #[tokio::test]
    async fn test_missing_repository_finds_nothing() {
        let dir = TempDir::new().unwrap();
        let results = VolumeFinder::new(dir.path())
            .find(&[CollectionRef::new(None, REF)], &CancellationToken::new())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_finds_refs_without_summary() {
        let dir = TempDir::new().unwrap();
        let checksum = volume_with_commit(&dir, false);
        let results = VolumeFinder::new(dir.path())
            .find(&[CollectionRef::new(None, REF)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].kind, SourceKind::Volume);
        assert_eq!(results[0].offered_refs[0].checksum, checksum);
        assert!(results[0].base_url.starts_with("file://"));
    }

    #[tokio::test]
    async fn test_finds_refs_from_summary() {
        let dir = TempDir::new().unwrap();
        let checksum = volume_with_commit(&dir, true);
        let results = VolumeFinder::new(dir.path())
            .find(&[CollectionRef::new(None, REF)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results[0].offered_refs[0].checksum, checksum);
        assert_eq!(results[0].offered_refs[0].timestamp, 9);
    }

    #[tokio::test]
    async fn test_unrelated_ref_finds_nothing() {
        let dir = TempDir::new().unwrap();
        volume_with_commit(&dir, true);
        let results = VolumeFinder::new(dir.path())
            .find(&[CollectionRef::new(None, "os/other")], &CancellationToken::new())
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
