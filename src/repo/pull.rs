//! Pulling commits from remote repositories.
//!
//! Sources are addressed by base URL: `http(s)://` is fetched with
//! `reqwest`, `file://` is read from a mounted volume. A pull first fetches
//! the commit object, then tries a static delta from the locally known
//! revision, and finally walks the commit's trees fetching any object still
//! missing. The walk doubles as the fallback when a delta cannot be applied.

use std::ops::BitOr;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::delta::{delta_dir, Superblock, SUPERBLOCK_FILE};
use super::object::PRIVILEGED_MODE_BITS;
use super::summary::{Summary, SUMMARY_FILE};
use super::{ObjectName, ObjectType, Repo, RepoError};
use crate::error::UpdaterError;
use crate::finder::SourceResult;
use crate::refspec::{CollectionRef, Refspec};

/// Pull behaviour flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct PullFlags(u8);

impl PullFlags {
    pub const NONE: PullFlags = PullFlags(0);
    /// Fetch only the commit object and leave refs untouched.
    pub const COMMIT_ONLY: PullFlags = PullFlags(1);
    /// Write the ref under `refs/heads` instead of the remote namespace.
    pub const MIRROR: PullFlags = PullFlags(1 << 1);
    /// Reject file objects with setuid or setgid bits.
    pub const BARE_USER_ONLY: PullFlags = PullFlags(1 << 2);
    /// Never try static deltas.
    pub const DISABLE_STATIC_DELTAS: PullFlags = PullFlags(1 << 3);

    pub fn contains(self, other: PullFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for PullFlags {
    type Output = PullFlags;

    fn bitor(self, rhs: PullFlags) -> PullFlags {
        PullFlags(self.0 | rhs.0)
    }
}

/// Cumulative progress of one pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullProgress {
    pub objects_fetched: u64,
    pub bytes_transferred: u64,
}

/// Progress callback; invoked after every stored object.
pub type ProgressCallback<'a> = &'a (dyn Fn(PullProgress) + Send + Sync);

/// Errors raised while pulling.
#[derive(Debug, thiserror::Error)]
pub enum PullError {
    #[error("Network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    #[error("{what} not found at {source_url}")]
    NotFound { what: String, source_url: String },

    #[error("Invalid source URL ‘{0}’")]
    InvalidUrl(String),

    #[error("No source offers {0}")]
    NoSources(String),

    #[error("Operation was cancelled")]
    Cancelled,

    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl PullError {
    /// Whether another source might succeed where this one failed.
    pub fn try_next_source(&self) -> bool {
        matches!(self, PullError::Network { .. } | PullError::NotFound { .. })
    }
}

impl From<PullError> for UpdaterError {
    fn from(e: PullError) -> Self {
        match e {
            PullError::Network { .. } => UpdaterError::Network(e.to_string()),
            PullError::NotFound { .. } | PullError::NoSources(_) => {
                UpdaterError::NotFound(e.to_string())
            }
            PullError::InvalidUrl(_) => UpdaterError::WrongConfiguration(e.to_string()),
            PullError::Cancelled => UpdaterError::cancelled(),
            PullError::Repo(e) => e.into(),
        }
    }
}

// ============================================================================
// Sources
// ============================================================================

/// A place objects can be fetched from.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    /// Base URL, for logging.
    fn base_url(&self) -> &str;

    /// Fetch a repository-relative path; `Ok(None)` when it does not exist.
    async fn fetch(&self, path: &str) -> Result<Option<Bytes>, PullError>;
}

/// Repository served over HTTP(S).
pub struct HttpSource {
    client: reqwest::Client,
    base: String,
}

impl HttpSource {
    pub fn new(base: &str) -> Result<Self, PullError> {
        Url::parse(base).map_err(|_| PullError::InvalidUrl(base.to_string()))?;
        Ok(Self {
            client: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl ObjectSource for HttpSource {
    fn base_url(&self) -> &str {
        &self.base
    }

    async fn fetch(&self, path: &str) -> Result<Option<Bytes>, PullError> {
        let url = format!("{}/{}", self.base, path.trim_start_matches('/'));
        let network = |reason: String| PullError::Network {
            url: url.clone(),
            reason,
        };

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| network(e.to_string()))?;

        match response.status() {
            StatusCode::NOT_FOUND | StatusCode::FORBIDDEN => Ok(None),
            status if status.is_success() => response
                .bytes()
                .await
                .map(Some)
                .map_err(|e| network(e.to_string())),
            status => Err(network(format!("HTTP status {}", status))),
        }
    }
}

/// Repository on a local filesystem (`file://`).
pub struct FileSource {
    root: PathBuf,
    url: String,
}

impl FileSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let url = format!("file://{}", root.display());
        Self { root, url }
    }
}

#[async_trait]
impl ObjectSource for FileSource {
    fn base_url(&self) -> &str {
        &self.url
    }

    async fn fetch(&self, path: &str) -> Result<Option<Bytes>, PullError> {
        let full = self.root.join(path.trim_start_matches('/'));
        match tokio::fs::read(&full).await {
            Ok(bytes) => Ok(Some(Bytes::from(bytes))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(PullError::Network {
                url: format!("file://{}", full.display()),
                reason: e.to_string(),
            }),
        }
    }
}

/// Open the source for a base URL.
pub fn open_source(url: &str) -> Result<Box<dyn ObjectSource>, PullError> {
    let parsed = Url::parse(url).map_err(|_| PullError::InvalidUrl(url.to_string()))?;
    match parsed.scheme() {
        "file" => {
            let path = parsed
                .to_file_path()
                .map_err(|_| PullError::InvalidUrl(url.to_string()))?;
            Ok(Box::new(FileSource::new(path)))
        }
        "http" | "https" => Ok(Box::new(HttpSource::new(url)?)),
        _ => Err(PullError::InvalidUrl(url.to_string())),
    }
}

// ============================================================================
// Pull
// ============================================================================

struct Tracker<'a> {
    progress: PullProgress,
    callback: Option<ProgressCallback<'a>>,
}

impl Tracker<'_> {
    fn record(&mut self, bytes: u64) {
        self.progress.objects_fetched += 1;
        self.progress.bytes_transferred += bytes;
        if let Some(callback) = self.callback {
            callback(self.progress);
        }
    }
}

async fn fetch_cancellable(
    source: &dyn ObjectSource,
    path: &str,
    cancel: &CancellationToken,
) -> Result<Option<Bytes>, PullError> {
    if cancel.is_cancelled() {
        return Err(PullError::Cancelled);
    }
    tokio::select! {
        result = source.fetch(path) => result,
        _ = cancel.cancelled() => Err(PullError::Cancelled),
    }
}

impl Repo {
    /// Pull `refs` from the configured URL of `remote`.
    pub async fn pull(
        &self,
        remote: &str,
        refs: &[String],
        flags: PullFlags,
        progress: Option<ProgressCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<(), PullError> {
        let url = self.remote_url(remote)?;
        let source = open_source(&url)?;
        for ref_name in refs {
            self.pull_from_source(
                source.as_ref(),
                Some(remote),
                ref_name,
                None,
                flags,
                progress,
                cancel,
            )
            .await?;
        }
        Ok(())
    }

    /// Pull `ref_name` at `checksum` (or at whatever the source's summary
    /// says when `None`) from one source. Returns the pulled checksum.
    #[allow(clippy::too_many_arguments)]
    pub async fn pull_from_source(
        &self,
        source: &dyn ObjectSource,
        remote: Option<&str>,
        ref_name: &str,
        checksum: Option<&str>,
        flags: PullFlags,
        progress: Option<ProgressCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String, PullError> {
        let checksum = match checksum {
            Some(checksum) => checksum.to_string(),
            None => self.resolve_remote_ref(source, ref_name, cancel).await?,
        };
        let mut tracker = Tracker {
            progress: PullProgress::default(),
            callback: progress,
        };

        info!(
            source = %source.base_url(),
            ref_name = %ref_name,
            checksum = %checksum,
            "Pulling"
        );

        let commit_name = ObjectName::new(ObjectType::Commit, checksum.clone());
        self.fetch_object(source, &commit_name, &mut tracker, cancel)
            .await?;
        if flags.contains(PullFlags::COMMIT_ONLY) {
            return Ok(checksum);
        }

        let refspec = match remote {
            Some(remote) if !flags.contains(PullFlags::MIRROR) => {
                Refspec::new(Some(remote), ref_name).map_err(RepoError::from)?
            }
            _ => Refspec::new(None, ref_name).map_err(RepoError::from)?,
        };

        if !flags.contains(PullFlags::DISABLE_STATIC_DELTAS) {
            let from = self.read_ref(&refspec)?.filter(|from| {
                *from != checksum && self.has_object(&ObjectName::new(ObjectType::Commit, from.clone()))
            });
            self.try_static_delta(source, from.as_deref(), &checksum, &mut tracker, cancel)
                .await?;
        }

        self.fetch_commit_contents(source, &checksum, flags, &mut tracker, cancel)
            .await?;

        self.set_ref(&refspec, Some(&checksum))?;
        info!(
            refspec = %refspec,
            checksum = %checksum,
            objects = tracker.progress.objects_fetched,
            bytes = tracker.progress.bytes_transferred,
            "Pull complete"
        );
        Ok(checksum)
    }

    /// Pull from a ranked list of discovered sources, moving on to the next
    /// source on network or not-found errors.
    #[allow(clippy::too_many_arguments)]
    pub async fn pull_with_results(
        &self,
        results: &[SourceResult],
        remote: Option<&str>,
        target: &CollectionRef,
        checksum: Option<&str>,
        flags: PullFlags,
        progress: Option<ProgressCallback<'_>>,
        cancel: &CancellationToken,
    ) -> Result<String, PullError> {
        let mut last_error = None;

        for result in results {
            let Some(offer) = result.offer(target) else {
                continue;
            };
            if checksum.is_some_and(|c| c != offer.checksum) {
                debug!(source = %result.base_url, offered = %offer.checksum, "Source offers a different commit; skipping");
                continue;
            }

            let source = match open_source(&result.base_url) {
                Ok(source) => source,
                Err(e) => {
                    warn!(source = %result.base_url, error = %e, "Skipping unusable source");
                    last_error = Some(e);
                    continue;
                }
            };

            match self
                .pull_from_source(
                    source.as_ref(),
                    remote,
                    &target.ref_name,
                    Some(&offer.checksum),
                    flags,
                    progress,
                    cancel,
                )
                .await
            {
                Ok(checksum) => return Ok(checksum),
                Err(e) if e.try_next_source() => {
                    warn!(
                        source = %result.base_url,
                        kind = %result.kind,
                        error = %e,
                        "Failed to pull from source; trying the next one"
                    );
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| PullError::NoSources(target.to_string())))
    }

    async fn resolve_remote_ref(
        &self,
        source: &dyn ObjectSource,
        ref_name: &str,
        cancel: &CancellationToken,
    ) -> Result<String, PullError> {
        if let Some(bytes) = fetch_cancellable(source, SUMMARY_FILE, cancel).await? {
            let summary = Summary::from_bytes(&bytes).map_err(|e| {
                PullError::Repo(RepoError::Corrupt {
                    name: SUMMARY_FILE.to_string(),
                    reason: e.to_string(),
                })
            })?;
            return summary
                .lookup(ref_name)
                .map(|r| r.checksum.clone())
                .ok_or_else(|| PullError::NotFound {
                    what: format!("Ref {}", ref_name),
                    source_url: source.base_url().to_string(),
                });
        }

        let path = format!("refs/heads/{}", ref_name);
        match fetch_cancellable(source, &path, cancel).await? {
            Some(bytes) => {
                let checksum = String::from_utf8_lossy(&bytes).trim().to_string();
                if !super::is_valid_checksum(&checksum) {
                    return Err(RepoError::InvalidChecksum(checksum).into());
                }
                Ok(checksum)
            }
            None => Err(PullError::NotFound {
                what: format!("Ref {}", ref_name),
                source_url: source.base_url().to_string(),
            }),
        }
    }

    async fn fetch_object(
        &self,
        source: &dyn ObjectSource,
        name: &ObjectName,
        tracker: &mut Tracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), PullError> {
        if self.has_object(name) {
            return Ok(());
        }
        let bytes = fetch_cancellable(source, &name.relative_path(), cancel)
            .await?
            .ok_or_else(|| PullError::NotFound {
                what: format!("Object {}", name),
                source_url: source.base_url().to_string(),
            })?;
        self.write_object_verified(name, &bytes)?;
        tracker.record(bytes.len() as u64);
        Ok(())
    }

    /// Apply a static delta if the source has one. Never fails because the
    /// delta is unusable; the object walk that follows fills any gap.
    async fn try_static_delta(
        &self,
        source: &dyn ObjectSource,
        from: Option<&str>,
        to: &str,
        tracker: &mut Tracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), PullError> {
        let dir = delta_dir(from, to);
        let superblock_path = format!("{}/{}", dir, SUPERBLOCK_FILE);
        let bytes = match fetch_cancellable(source, &superblock_path, cancel).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                debug!(from = from.unwrap_or("(scratch)"), to = %to, "No static delta available");
                return Ok(());
            }
            Err(PullError::Cancelled) => return Err(PullError::Cancelled),
            Err(e) => {
                warn!(error = %e, "Failed to fetch static delta superblock; fetching objects");
                return Ok(());
            }
        };

        let superblock = Superblock::from_bytes(&bytes)?;
        if let Some(missing) = self.missing_delta_base(&superblock) {
            warn!(
                from = from.unwrap_or("(scratch)"),
                to = %to,
                missing = %missing,
                "Static delta requires an object missing from the local repository; falling back to fetching objects"
            );
            return Ok(());
        }

        for part in &superblock.parts {
            let part_path = format!("{}/{}", dir, part);
            let bytes = match fetch_cancellable(source, &part_path, cancel).await? {
                Some(bytes) => bytes,
                None => {
                    warn!(part = %part_path, "Static delta part missing; falling back to fetching objects");
                    return Ok(());
                }
            };
            let written = self.apply_delta_part(part, &bytes)?;
            tracker.record(written);
        }
        info!(to = %to, parts = superblock.parts.len(), "Applied static delta");
        Ok(())
    }

    async fn fetch_commit_contents(
        &self,
        source: &dyn ObjectSource,
        checksum: &str,
        flags: PullFlags,
        tracker: &mut Tracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<(), PullError> {
        let commit = self.load_commit(checksum)?;
        let mut pending = vec![commit.root_tree];

        while let Some(tree_checksum) = pending.pop() {
            let tree_name = ObjectName::new(ObjectType::DirTree, tree_checksum.clone());
            self.fetch_object(source, &tree_name, tracker, cancel).await?;
            let tree = self.load_dirtree(&tree_checksum)?;

            for file in &tree.files {
                if flags.contains(PullFlags::BARE_USER_ONLY) && file.mode & PRIVILEGED_MODE_BITS != 0
                {
                    return Err(RepoError::Corrupt {
                        name: file.name.clone(),
                        reason: format!(
                            "mode {:o} is not allowed in a bare-user-only repository",
                            file.mode
                        ),
                    }
                    .into());
                }
                let name = ObjectName::new(ObjectType::File, file.checksum.clone());
                self.fetch_object(source, &name, tracker, cancel).await?;
            }
            pending.extend(tree.dirs.iter().map(|d| d.tree.clone()));
        }
        Ok(())
    }
}
