//! Internet origin finder.
//!
//! Queries the booted remote's URL (or the configured override URIs) for its
//! summary. Remotes that publish no summary are probed ref by ref.

use async_trait::async_trait;
use backon::Retryable;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Finder, OfferedRef, SourceKind, SourceResult};
use crate::error::{Result, UpdaterError};
use crate::refspec::CollectionRef;
use crate::repo::pull::open_source;
use crate::repo::summary::SUMMARY_FILE;
use crate::repo::{checksum_bytes, is_valid_checksum, Commit, ObjectName, ObjectSource, ObjectType, Summary};
use crate::utils::retry::RetryConfig;

/// Finder for the Internet origin.
pub struct MainFinder {
    urls: Vec<String>,
    collection_id: Option<String>,
    retry: RetryConfig,
}

impl MainFinder {
    /// `collection_id` is the remote's configured collection id, used when
    /// the origin's summary does not state one.
    pub fn new(urls: Vec<String>, collection_id: Option<String>, retry: RetryConfig) -> Self {
        Self {
            urls,
            collection_id,
            retry,
        }
    }

    async fn query(
        &self,
        url: &str,
        refs: &[CollectionRef],
        cancel: &CancellationToken,
    ) -> Result<SourceResult> {
        let source = open_source(url).map_err(UpdaterError::from)?;

        let summary = (|| async { fetch_summary(source.as_ref(), cancel).await })
            .retry(self.retry.backoff())
            .when(|e: &UpdaterError| e.is_transient())
            .notify(|e: &UpdaterError, dur| {
                warn!(url = %url, error = %e, delay = ?dur, "Fetching summary failed, retrying");
            })
            .await?;

        match summary {
            Some(summary) => Ok(SourceResult::from_summary(
                SourceKind::Main,
                url,
                0,
                &summary,
                refs,
                self.collection_id.as_deref(),
            )),
            None => {
                debug!(url = %url, "Origin has no summary; resolving refs directly");
                let mut result = SourceResult::new(SourceKind::Main, url, 0);
                for target in refs {
                    if let Some(offer) = probe_ref(source.as_ref(), target, cancel).await? {
                        result.offered_refs.push(offer);
                    }
                }
                Ok(result)
            }
        }
    }
}

#[async_trait]
impl Finder for MainFinder {
    fn kind(&self) -> SourceKind {
        SourceKind::Main
    }

    fn describe(&self) -> String {
        format!("main ({})", self.urls.join(", "))
    }

    async fn find(
        &self,
        refs: &[CollectionRef],
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceResult>> {
        let mut results = Vec::new();
        let mut first_error: Option<UpdaterError> = None;

        for url in &self.urls {
            match self.query(url, refs, cancel).await {
                Ok(result) => results.push(result),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    warn!(url = %url, error = %e, "Failed to query origin");
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) if results.is_empty() => Err(e),
            _ => Ok(results),
        }
    }
}

/// Fetch and parse a source's summary; `Ok(None)` when it has none.
pub(crate) async fn fetch_summary(
    source: &dyn ObjectSource,
    cancel: &CancellationToken,
) -> Result<Option<Summary>> {
    if cancel.is_cancelled() {
        return Err(UpdaterError::cancelled());
    }
    let bytes = tokio::select! {
        result = source.fetch(SUMMARY_FILE) => result.map_err(UpdaterError::from)?,
        _ = cancel.cancelled() => return Err(UpdaterError::cancelled()),
    };
    match bytes {
        Some(bytes) => Summary::from_bytes(&bytes).map(Some).map_err(|e| {
            UpdaterError::Corrupt(format!(
                "Invalid summary from {}: {}",
                source.base_url(),
                e
            ))
        }),
        None => Ok(None),
    }
}

async fn probe_ref(
    source: &dyn ObjectSource,
    target: &CollectionRef,
    cancel: &CancellationToken,
) -> Result<Option<OfferedRef>> {
    let ref_path = format!("refs/heads/{}", target.ref_name);
    let fetch = |path: String| async move {
        tokio::select! {
            result = source.fetch(&path) => result.map_err(UpdaterError::from),
            _ = cancel.cancelled() => Err(UpdaterError::cancelled()),
        }
    };

    let Some(bytes) = fetch(ref_path).await? else {
        return Ok(None);
    };
    let checksum = String::from_utf8_lossy(&bytes).trim().to_string();
    if !is_valid_checksum(&checksum) {
        return Err(UpdaterError::Corrupt(format!(
            "Invalid checksum for ref {} at {}",
            target.ref_name,
            source.base_url()
        )));
    }

    let commit_name = ObjectName::new(ObjectType::Commit, checksum.clone());
    let Some(commit_bytes) = fetch(commit_name.relative_path()).await? else {
        return Ok(None);
    };
    if checksum_bytes(&commit_bytes) != checksum {
        return Err(UpdaterError::Corrupt(format!(
            "Commit {} from {} does not match its checksum",
            checksum,
            source.base_url()
        )));
    }
    let commit: Commit = serde_json::from_slice(&commit_bytes)
        .map_err(|e| UpdaterError::Corrupt(format!("Invalid commit {}: {}", checksum, e)))?;

    Ok(Some(OfferedRef {
        collection_ref: target.clone(),
        checksum,
        timestamp: commit.timestamp,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::refspec::Refspec;
    use crate::repo::{CommitSpec, Repo, RepoMode};
    use tempfile::TempDir;

    const REF: &str = "os/eos/amd64/eos3";

    fn origin(dir: &TempDir, summary: bool) -> (Repo, String) {
        let repo = Repo::create(&dir.path().join("origin"), RepoMode::ArchiveZ2).unwrap();
        let tree = dir.path().join("tree");
        std::fs::create_dir_all(&tree).unwrap();
        std::fs::write(tree.join("f"), "x").unwrap();
        let checksum = repo
            .commit_directory(&tree, CommitSpec { timestamp: 77, ..Default::default() })
            .unwrap();
        repo.set_ref(&Refspec::parse(REF).unwrap(), Some(&checksum)).unwrap();
        if summary {
            repo.regenerate_summary(None).unwrap();
        }
        (repo, checksum)
    }

    fn finder(repo: &Repo) -> MainFinder {
        MainFinder::new(
            vec![format!("file://{}", repo.path().display())],
            None,
            RetryConfig::for_finders().without_jitter(),
        )
    }

    #[tokio::test]
    async fn test_finds_ref_from_summary() {
        let dir = TempDir::new().unwrap();
        let (repo, checksum) = origin(&dir, true);
        let results = finder(&repo)
            .find(&[CollectionRef::new(None, REF)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].kind, SourceKind::Main);
        assert_eq!(results[0].offered_refs[0].checksum, checksum);
        assert_eq!(results[0].offered_refs[0].timestamp, 77);
    }

    #[tokio::test]
    async fn test_probes_refs_without_summary() {
        let dir = TempDir::new().unwrap();
        let (repo, checksum) = origin(&dir, false);
        let results = finder(&repo)
            .find(&[CollectionRef::new(None, REF)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(results[0].offered_refs[0].checksum, checksum);
    }

    #[tokio::test]
    async fn test_invalid_url_is_error() {
        let finder = MainFinder::new(
            vec!["not a url".to_string()],
            None,
            RetryConfig::for_finders(),
        );
        let err = finder
            .find(&[CollectionRef::new(None, REF)], &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.name(), "WRONG_CONFIGURATION");
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let (repo, _) = origin(&dir, true);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = finder(&repo)
            .find(&[CollectionRef::new(None, REF)], &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
