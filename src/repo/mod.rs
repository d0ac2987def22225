//! Content-addressed repository gateway.
//!
//! A [`Repo`] is a directory holding immutable objects, mutable refs, a
//! remote configuration and an optional summary. All writes of objects go
//! through a temporary file and a rename, so a crash or a cancelled pull
//! never leaves a partially written object in place.

pub mod config;
pub mod delta;
pub mod object;
pub mod pull;
pub mod summary;

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::config::ConfigError;
use crate::error::UpdaterError;
use crate::refspec::{Refspec, RefspecError};

pub use config::{RepoConfig, RepoMode};
pub use object::{
    checksum_bytes, is_valid_checksum, Commit, DirEntry, DirTree, FileEntry, ObjectName,
    ObjectType, SizeEntry,
};
pub use pull::{ObjectSource, PullError, PullFlags, PullProgress};
pub use summary::{Summary, SummaryRef};

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, RepoError>;

/// Errors raised by the repository gateway.
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("No such object {0}")]
    ObjectNotFound(ObjectName),

    #[error("Refspec ‘{0}’ not found")]
    RefNotFound(String),

    #[error("Remote ‘{0}’ not found")]
    RemoteNotFound(String),

    #[error("Corrupted object {name}: {reason}")]
    Corrupt { name: String, reason: String },

    #[error("Invalid checksum ‘{0}’")]
    InvalidChecksum(String),

    #[error("Not a repository: {0}")]
    NotARepository(PathBuf),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Refspec(#[from] RefspecError),
}

impl RepoError {
    fn io(path: &Path, source: io::Error) -> Self {
        RepoError::Io {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Whether the error means "the thing does not exist".
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            RepoError::ObjectNotFound(_) | RepoError::RefNotFound(_) | RepoError::RemoteNotFound(_)
        ) || matches!(self, RepoError::Io { source, .. } if source.kind() == io::ErrorKind::NotFound)
    }
}

impl From<RepoError> for UpdaterError {
    fn from(e: RepoError) -> Self {
        let msg = e.to_string();
        match e {
            RepoError::ObjectNotFound(_) | RepoError::RefNotFound(_) | RepoError::RemoteNotFound(_) => {
                UpdaterError::NotFound(msg)
            }
            RepoError::Corrupt { .. } | RepoError::InvalidChecksum(_) => UpdaterError::Corrupt(msg),
            RepoError::Config(_) | RepoError::Refspec(_) => UpdaterError::InvalidConfig(msg),
            RepoError::Io { .. } | RepoError::NotARepository(_) => UpdaterError::Io(msg),
        }
    }
}

/// Full and still-to-download sizes of a commit, in bytes. `-1` if unknown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitSizes {
    pub archived: i64,
    pub unpacked: i64,
    pub new_archived: i64,
    pub new_unpacked: i64,
}

impl CommitSizes {
    pub const UNKNOWN: CommitSizes = CommitSizes {
        archived: -1,
        unpacked: -1,
        new_archived: -1,
        new_unpacked: -1,
    };
}

/// Parameters for [`Repo::commit_directory`].
#[derive(Debug, Clone, Default)]
pub struct CommitSpec {
    pub parent: Option<String>,
    pub timestamp: u64,
    pub subject: String,
    pub body: String,
    pub metadata: BTreeMap<String, Value>,
}

/// Outcome of [`Repo::prune`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub objects_total: usize,
    pub objects_pruned: usize,
    pub bytes_freed: u64,
}

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Handle on an on-disk repository.
#[derive(Debug, Clone)]
pub struct Repo {
    path: PathBuf,
}

impl Repo {
    /// Initialise a new repository at `path` (idempotent).
    pub fn create(path: &Path, mode: RepoMode) -> Result<Self> {
        for dir in ["objects", "refs/heads", "refs/remotes", "tmp", "deltas"] {
            let dir = path.join(dir);
            fs::create_dir_all(&dir).map_err(|e| RepoError::io(&dir, e))?;
        }
        let repo = Self {
            path: path.to_path_buf(),
        };
        if !repo.config_path().exists() {
            repo.write_config(&RepoConfig::new(mode))?;
        }
        Ok(repo)
    }

    /// Open an existing repository.
    pub fn open(path: &Path) -> Result<Self> {
        let repo = Self {
            path: path.to_path_buf(),
        };
        if !repo.config_path().is_file() || !path.join("objects").is_dir() {
            return Err(RepoError::NotARepository(path.to_path_buf()));
        }
        Ok(repo)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    fn config_path(&self) -> PathBuf {
        self.path.join("config")
    }

    pub fn read_config(&self) -> Result<RepoConfig> {
        let path = self.config_path();
        let contents = fs::read_to_string(&path).map_err(|e| RepoError::io(&path, e))?;
        Ok(RepoConfig::parse(&contents)?)
    }

    pub fn write_config(&self, config: &RepoConfig) -> Result<()> {
        self.write_atomic(&self.config_path(), config.to_ini_string().as_bytes())
    }

    pub fn mode(&self) -> Result<RepoMode> {
        Ok(self.read_config()?.mode)
    }

    pub fn add_remote(&self, name: &str, url: &str, collection_id: Option<&str>) -> Result<()> {
        let mut config = self.read_config()?;
        config.add_remote(name, url, collection_id);
        self.write_config(&config)
    }

    pub fn remote_url(&self, name: &str) -> Result<String> {
        self.read_config()?
            .remote_option(name, config::URL_OPTION)
            .map(str::to_string)
            .ok_or_else(|| RepoError::RemoteNotFound(name.to_string()))
    }

    pub fn remote_option(&self, name: &str, key: &str) -> Result<Option<String>> {
        let config = self.read_config()?;
        if config.remote(name).is_none() {
            return Err(RepoError::RemoteNotFound(name.to_string()));
        }
        Ok(config.remote_option(name, key).map(str::to_string))
    }

    pub fn set_remote_option(&self, name: &str, key: &str, value: &str) -> Result<()> {
        let mut config = self.read_config()?;
        if !config.set_remote_option(name, key, value) {
            return Err(RepoError::RemoteNotFound(name.to_string()));
        }
        self.write_config(&config)
    }

    /// Set the collection id used for locally committed refs.
    pub fn set_collection_id(&self, collection_id: Option<&str>) -> Result<()> {
        let mut config = self.read_config()?;
        config.collection_id = collection_id.map(str::to_string);
        self.write_config(&config)
    }

    // ========================================================================
    // Objects
    // ========================================================================

    pub fn object_path(&self, name: &ObjectName) -> PathBuf {
        self.path.join(name.relative_path())
    }

    pub fn has_object(&self, name: &ObjectName) -> bool {
        self.object_path(name).is_file()
    }

    /// Read an object, verifying its checksum.
    pub fn read_object(&self, name: &ObjectName) -> Result<Vec<u8>> {
        let path = self.object_path(name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(RepoError::ObjectNotFound(name.clone()))
            }
            Err(e) => return Err(RepoError::io(&path, e)),
        };
        let actual = checksum_bytes(&bytes);
        if actual != name.checksum {
            return Err(RepoError::Corrupt {
                name: name.to_string(),
                reason: format!("checksum mismatch, actual {}", actual),
            });
        }
        Ok(bytes)
    }

    /// Store `bytes` as an object of `object_type`; returns its checksum.
    pub fn write_object(&self, object_type: ObjectType, bytes: &[u8]) -> Result<String> {
        let checksum = checksum_bytes(bytes);
        let name = ObjectName::new(object_type, checksum.clone());
        self.store_object(&name, bytes)?;
        Ok(checksum)
    }

    /// Store bytes received for `name`, rejecting content that does not
    /// match the expected checksum.
    pub fn write_object_verified(&self, name: &ObjectName, bytes: &[u8]) -> Result<()> {
        if !is_valid_checksum(&name.checksum) {
            return Err(RepoError::InvalidChecksum(name.checksum.clone()));
        }
        let actual = checksum_bytes(bytes);
        if actual != name.checksum {
            return Err(RepoError::Corrupt {
                name: name.to_string(),
                reason: format!("received content has checksum {}", actual),
            });
        }
        self.store_object(name, bytes)
    }

    fn store_object(&self, name: &ObjectName, bytes: &[u8]) -> Result<()> {
        let dest = self.object_path(name);
        if dest.is_file() {
            return Ok(());
        }
        self.write_atomic(&dest, bytes)
    }

    pub fn delete_object(&self, name: &ObjectName) -> Result<()> {
        let path = self.object_path(name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(RepoError::io(&path, e)),
        }
    }

    /// Every object currently stored.
    pub fn list_objects(&self) -> Result<Vec<ObjectName>> {
        let objects_dir = self.path.join("objects");
        let mut out = Vec::new();
        for prefix in read_dir_sorted(&objects_dir)? {
            if !prefix.is_dir() {
                continue;
            }
            let prefix_name = file_name(&prefix);
            for entry in read_dir_sorted(&prefix)? {
                let name = file_name(&entry);
                let Some((rest, ext)) = name.rsplit_once('.') else {
                    continue;
                };
                let Some(object_type) = ObjectType::from_extension(ext) else {
                    continue;
                };
                out.push(ObjectName::new(object_type, format!("{}{}", prefix_name, rest)));
            }
        }
        Ok(out)
    }

    pub fn load_commit(&self, checksum: &str) -> Result<Commit> {
        let name = ObjectName::new(ObjectType::Commit, checksum);
        let bytes = self.read_object(&name)?;
        serde_json::from_slice(&bytes).map_err(|e| RepoError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn write_commit(&self, commit: &Commit) -> Result<String> {
        let bytes = commit.to_bytes().map_err(|e| RepoError::Corrupt {
            name: "commit".to_string(),
            reason: e.to_string(),
        })?;
        self.write_object(ObjectType::Commit, &bytes)
    }

    pub fn load_dirtree(&self, checksum: &str) -> Result<DirTree> {
        let name = ObjectName::new(ObjectType::DirTree, checksum);
        let bytes = self.read_object(&name)?;
        serde_json::from_slice(&bytes).map_err(|e| RepoError::Corrupt {
            name: name.to_string(),
            reason: e.to_string(),
        })
    }

    pub fn write_dirtree(&self, tree: &DirTree) -> Result<String> {
        let bytes = tree.to_bytes().map_err(|e| RepoError::Corrupt {
            name: "dirtree".to_string(),
            reason: e.to_string(),
        })?;
        self.write_object(ObjectType::DirTree, &bytes)
    }

    // ========================================================================
    // Refs
    // ========================================================================

    fn ref_path(&self, refspec: &Refspec) -> PathBuf {
        match &refspec.remote {
            Some(remote) => self
                .path
                .join("refs/remotes")
                .join(remote)
                .join(&refspec.ref_name),
            None => self.path.join("refs/heads").join(&refspec.ref_name),
        }
    }

    /// Resolve a checksum, `remote:ref` or local ref to a commit checksum.
    pub fn resolve_rev(&self, rev: &str) -> Result<String> {
        self.try_resolve_rev(rev)?
            .ok_or_else(|| RepoError::RefNotFound(rev.to_string()))
    }

    /// Like [`Repo::resolve_rev`], but a missing ref is `Ok(None)`.
    pub fn try_resolve_rev(&self, rev: &str) -> Result<Option<String>> {
        if is_valid_checksum(rev) {
            return Ok(Some(rev.to_string()));
        }
        let refspec = Refspec::parse(rev)?;
        self.read_ref(&refspec)
    }

    pub fn read_ref(&self, refspec: &Refspec) -> Result<Option<String>> {
        let path = self.ref_path(refspec);
        match fs::read_to_string(&path) {
            Ok(contents) => {
                let checksum = contents.trim();
                if !is_valid_checksum(checksum) {
                    return Err(RepoError::InvalidChecksum(checksum.to_string()));
                }
                Ok(Some(checksum.to_string()))
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(RepoError::io(&path, e)),
        }
    }

    /// Point `refspec` at `checksum`, or delete it when `checksum` is `None`.
    pub fn set_ref(&self, refspec: &Refspec, checksum: Option<&str>) -> Result<()> {
        let path = self.ref_path(refspec);
        match checksum {
            Some(checksum) => {
                if !is_valid_checksum(checksum) {
                    return Err(RepoError::InvalidChecksum(checksum.to_string()));
                }
                debug!(refspec = %refspec, checksum = %checksum, "Updating ref");
                self.write_atomic(&path, format!("{}\n", checksum).as_bytes())
            }
            None => match fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(RepoError::io(&path, e)),
            },
        }
    }

    pub fn delete_ref(&self, refspec: &Refspec) -> Result<()> {
        self.set_ref(refspec, None)
    }

    /// All refs under `refs/heads` (`remote = None`) or `refs/remotes/<remote>`.
    pub fn list_refs(&self, remote: Option<&str>) -> Result<BTreeMap<String, String>> {
        let base = match remote {
            Some(remote) => self.path.join("refs/remotes").join(remote),
            None => self.path.join("refs/heads"),
        };
        let mut refs = BTreeMap::new();
        if base.is_dir() {
            collect_refs(&base, &base, &mut refs)?;
        }
        Ok(refs)
    }

    /// Remote names that have at least one ref.
    pub fn list_ref_remotes(&self) -> Result<Vec<String>> {
        let base = self.path.join("refs/remotes");
        if !base.is_dir() {
            return Ok(Vec::new());
        }
        Ok(read_dir_sorted(&base)?
            .into_iter()
            .filter(|p| p.is_dir())
            .map(|p| file_name(&p))
            .collect())
    }

    // ========================================================================
    // Commit traversal, sizes and checkout
    // ========================================================================

    /// All objects reachable from a commit, commit included.
    pub fn traverse_commit(&self, checksum: &str) -> Result<BTreeSet<ObjectName>> {
        let mut reachable = BTreeSet::new();
        let commit = self.load_commit(checksum)?;
        reachable.insert(ObjectName::new(ObjectType::Commit, checksum));

        let mut pending = vec![commit.root_tree];
        while let Some(tree_checksum) = pending.pop() {
            let name = ObjectName::new(ObjectType::DirTree, tree_checksum.clone());
            if !reachable.insert(name) {
                continue;
            }
            let tree = self.load_dirtree(&tree_checksum)?;
            for file in tree.files {
                reachable.insert(ObjectName::new(ObjectType::File, file.checksum));
            }
            pending.extend(tree.dirs.into_iter().map(|d| d.tree));
        }
        Ok(reachable)
    }

    /// Sum the commit's `ostree.sizes` entries.
    ///
    /// The "new" sizes only count objects not already stored locally.
    pub fn commit_sizes(&self, commit: &Commit) -> CommitSizes {
        let Some(entries) = commit.sizes() else {
            info!("No size summary data found in commit metadata");
            return CommitSizes::UNKNOWN;
        };

        let mut sizes = CommitSizes {
            archived: 0,
            unpacked: 0,
            new_archived: 0,
            new_unpacked: 0,
        };
        for entry in entries {
            let archived = i64::try_from(entry.archived).unwrap_or(i64::MAX);
            let unpacked = i64::try_from(entry.unpacked).unwrap_or(i64::MAX);
            sizes.archived = sizes.archived.saturating_add(archived);
            sizes.unpacked = sizes.unpacked.saturating_add(unpacked);
            if !self.has_object(&entry.object) {
                sizes.new_archived = sizes.new_archived.saturating_add(archived);
                sizes.new_unpacked = sizes.new_unpacked.saturating_add(unpacked);
            }
        }
        sizes
    }

    /// Materialise the tree of `checksum` under `dest`.
    pub fn checkout(&self, checksum: &str, dest: &Path) -> Result<()> {
        let commit = self.load_commit(checksum)?;
        self.checkout_tree(&commit.root_tree, dest)
    }

    fn checkout_tree(&self, tree_checksum: &str, dest: &Path) -> Result<()> {
        fs::create_dir_all(dest).map_err(|e| RepoError::io(dest, e))?;
        let tree = self.load_dirtree(tree_checksum)?;
        for file in &tree.files {
            let bytes = self.read_object(&ObjectName::new(ObjectType::File, file.checksum.clone()))?;
            let target = dest.join(&file.name);
            fs::write(&target, &bytes).map_err(|e| RepoError::io(&target, e))?;
            fs::set_permissions(&target, fs::Permissions::from_mode(file.mode & 0o7777))
                .map_err(|e| RepoError::io(&target, e))?;
        }
        for dir in &tree.dirs {
            self.checkout_tree(&dir.tree, &dest.join(&dir.name))?;
        }
        Ok(())
    }

    /// Import the directory `root` as a new commit; returns its checksum.
    ///
    /// The commit's `ostree.sizes` metadata lists every file object.
    pub fn commit_directory(&self, root: &Path, spec: CommitSpec) -> Result<String> {
        let mut sizes = Vec::new();
        let root_tree = self.import_tree(root, &mut sizes)?;

        let mut metadata = spec.metadata;
        let sizes_value = serde_json::to_value(&sizes).map_err(|e| RepoError::Corrupt {
            name: "commit".to_string(),
            reason: e.to_string(),
        })?;
        metadata.insert(object::SIZES_KEY.to_string(), sizes_value);

        let commit = Commit {
            parent: spec.parent,
            timestamp: spec.timestamp,
            subject: spec.subject,
            body: spec.body,
            root_tree,
            metadata,
        };
        let checksum = self.write_commit(&commit)?;
        info!(checksum = %checksum, subject = %commit.subject, "Wrote commit");
        Ok(checksum)
    }

    fn import_tree(&self, dir: &Path, sizes: &mut Vec<SizeEntry>) -> Result<String> {
        let mut tree = DirTree::default();
        for entry in read_dir_sorted(dir)? {
            let name = file_name(&entry);
            let meta = fs::symlink_metadata(&entry).map_err(|e| RepoError::io(&entry, e))?;
            if meta.is_dir() {
                let subtree = self.import_tree(&entry, sizes)?;
                tree.dirs.push(DirEntry {
                    name,
                    tree: subtree,
                });
            } else if meta.is_file() {
                let bytes = fs::read(&entry).map_err(|e| RepoError::io(&entry, e))?;
                let checksum = self.write_object(ObjectType::File, &bytes)?;
                sizes.push(SizeEntry {
                    object: ObjectName::new(ObjectType::File, checksum.clone()),
                    archived: bytes.len() as u64,
                    unpacked: bytes.len() as u64,
                });
                tree.files.push(FileEntry {
                    name,
                    checksum,
                    mode: meta.permissions().mode() & 0o7777,
                });
            } else {
                debug!(path = %entry.display(), "Skipping non-regular file");
            }
        }
        self.write_dirtree(&tree)
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Delete every object unreachable from refs and `extra_roots`.
    ///
    /// Fails without deleting anything if a root cannot be fully traversed.
    pub fn prune(&self, extra_roots: &[String]) -> Result<PruneStats> {
        let mut roots: BTreeSet<String> = extra_roots.iter().cloned().collect();
        roots.extend(self.list_refs(None)?.into_values());
        for remote in self.list_ref_remotes()? {
            roots.extend(self.list_refs(Some(&remote))?.into_values());
        }

        let mut reachable = BTreeSet::new();
        for root in &roots {
            reachable.extend(self.traverse_commit(root)?);
        }

        let mut stats = PruneStats::default();
        for object in self.list_objects()? {
            stats.objects_total += 1;
            if reachable.contains(&object) {
                continue;
            }
            let path = self.object_path(&object);
            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if let Err(e) = self.delete_object(&object) {
                warn!(object = %object, error = %e, "Failed to prune object");
                continue;
            }
            stats.objects_pruned += 1;
            stats.bytes_freed += size;
        }

        info!(
            total = stats.objects_total,
            pruned = stats.objects_pruned,
            freed = stats.bytes_freed,
            "Pruned repository"
        );
        Ok(stats)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// Write `bytes` to `dest` via a temporary file and rename.
    pub(crate) fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        let tmp_dir = self.path.join("tmp");
        fs::create_dir_all(&tmp_dir).map_err(|e| RepoError::io(&tmp_dir, e))?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| RepoError::io(parent, e))?;
        }
        let tmp = tmp_dir.join(format!(
            "tmp-{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, bytes).map_err(|e| RepoError::io(&tmp, e))?;
        fs::rename(&tmp, dest).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            RepoError::io(dest, e)
        })
    }
}

fn read_dir_sorted(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| RepoError::io(dir, e))? {
        entries.push(entry.map_err(|e| RepoError::io(dir, e))?.path());
    }
    entries.sort();
    Ok(entries)
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn collect_refs(base: &Path, dir: &Path, refs: &mut BTreeMap<String, String>) -> Result<()> {
    for entry in read_dir_sorted(dir)? {
        if entry.is_dir() {
            collect_refs(base, &entry, refs)?;
            continue;
        }
        let Ok(relative) = entry.strip_prefix(base) else {
            continue;
        };
        let contents = fs::read_to_string(&entry).map_err(|e| RepoError::io(&entry, e))?;
        let checksum = contents.trim();
        if is_valid_checksum(checksum) {
            refs.insert(relative.to_string_lossy().into_owned(), checksum.to_string());
        }
    }
    Ok(())
}
