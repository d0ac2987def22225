//! Sysroot: the repository plus the list of deployments built from it.
//!
//! Layout under the sysroot root:
//!
//! ```text
//! ostree/repo/                                  object store
//! ostree/deployments.json                       bootversion + ordered deployments
//! ostree/deploy/<os>/deploy/<csum>.<serial>/    checked-out tree
//! ostree/deploy/<os>/deploy/<csum>.<serial>.origin
//! ostree/lock                                   advisory lock
//! ostree/eos-updater/pending-update.json        written by Fetch, consumed by Apply
//! ```
//!
//! Element 0 of the deployment list boots next. The booted deployment is the
//! one named by `ostree=` on the kernel command line.

mod deploy;
mod pending;

use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::ini::parse_ini;
use crate::config::SysrootSettings;
use crate::error::UpdaterError;
use crate::refspec::{Refspec, RefspecError};
use crate::repo::{Repo, RepoError, RepoMode};

pub use pending::{PendingUpdate, PENDING_UPDATE_FILE};

/// Result type for sysroot operations.
pub type Result<T> = std::result::Result<T, SysrootError>;

const DEPLOYMENTS_FILE: &str = "ostree/deployments.json";
const LOCK_FILE: &str = "ostree/lock";
const REPO_DIR: &str = "ostree/repo";
const ORIGIN_GROUP: &str = "origin";
const ORIGIN_REFSPEC_KEY: &str = "refspec";

/// Errors raised by sysroot operations.
#[derive(Debug, thiserror::Error)]
pub enum SysrootError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error("Corrupted deployment list: {0}")]
    Corrupt(String),

    #[error("Invalid origin for deployment {deployment}: {reason}")]
    InvalidOrigin { deployment: String, reason: String },

    #[error("Failed to lock the sysroot: {0}")]
    Lock(String),

    #[error("Deployment failed: {0}")]
    Deploy(String),

    #[error("Operation was cancelled")]
    Cancelled,
}

impl SysrootError {
    pub(crate) fn io(path: &Path, source: io::Error) -> Self {
        SysrootError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

impl From<SysrootError> for UpdaterError {
    fn from(e: SysrootError) -> Self {
        match e {
            SysrootError::Repo(e) => e.into(),
            SysrootError::Cancelled => UpdaterError::cancelled(),
            SysrootError::InvalidOrigin { .. } => UpdaterError::InvalidConfig(e.to_string()),
            other => UpdaterError::Deploy(other.to_string()),
        }
    }
}

/// One deployment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deployment {
    pub osname: String,
    pub checksum: String,
    /// Distinguishes deployments of the same commit.
    pub serial: u32,
    #[serde(skip)]
    pub origin: Option<Refspec>,
}

impl Deployment {
    /// `<csum>.<serial>`, the deployment's directory name.
    pub fn dir_name(&self) -> String {
        format!("{}.{}", self.checksum, self.serial)
    }

    fn same_as(&self, other: &Deployment) -> bool {
        self.osname == other.osname && self.checksum == other.checksum && self.serial == other.serial
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct DeploymentsFile {
    bootversion: u32,
    deployments: Vec<Deployment>,
}

/// A loaded sysroot.
#[derive(Debug, Clone)]
pub struct Sysroot {
    root: PathBuf,
    cmdline_path: PathBuf,
    deployment_fallback: bool,
    bootversion: u32,
    deployments: Vec<Deployment>,
    booted: Option<usize>,
}

/// Held sysroot lock; released on drop.
pub struct SysrootLock {
    _lock: Flock<File>,
}

impl Sysroot {
    /// Handle on the sysroot described by `settings`; call [`Sysroot::load`]
    /// before use.
    pub fn new(settings: &SysrootSettings) -> Self {
        Self {
            root: settings.path.clone(),
            cmdline_path: settings.cmdline_path.clone(),
            deployment_fallback: settings.deployment_fallback,
            bootversion: 0,
            deployments: Vec::new(),
            booted: None,
        }
    }

    /// Create an empty sysroot with a repository at `root` (idempotent).
    pub fn create(settings: &SysrootSettings) -> Result<Self> {
        Repo::create(&settings.path.join(REPO_DIR), RepoMode::ArchiveZ2)?;
        let mut sysroot = Self::new(settings);
        if !sysroot.deployments_path().exists() {
            sysroot.write_deployments_file()?;
        }
        sysroot.load()?;
        Ok(sysroot)
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn repo(&self) -> Result<Repo> {
        Ok(Repo::open(&self.root.join(REPO_DIR))?)
    }

    fn deployments_path(&self) -> PathBuf {
        self.root.join(DEPLOYMENTS_FILE)
    }

    /// Re-read the deployment list, origins and the booted deployment.
    pub fn load(&mut self) -> Result<()> {
        let path = self.deployments_path();
        let file: DeploymentsFile = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| SysrootError::Corrupt(e.to_string()))?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => DeploymentsFile::default(),
            Err(e) => return Err(SysrootError::io(&path, e)),
        };

        self.bootversion = file.bootversion;
        self.deployments = file.deployments;
        for index in 0..self.deployments.len() {
            let origin = self.read_origin(&self.deployments[index])?;
            self.deployments[index].origin = origin;
        }
        self.booted = self.find_booted();
        debug!(
            deployments = self.deployments.len(),
            booted = ?self.booted,
            bootversion = self.bootversion,
            "Loaded sysroot"
        );
        Ok(())
    }

    pub fn deployments(&self) -> &[Deployment] {
        &self.deployments
    }

    pub fn bootversion(&self) -> u32 {
        self.bootversion
    }

    pub fn booted_deployment(&self) -> Option<&Deployment> {
        self.booted.and_then(|i| self.deployments.get(i))
    }

    /// Deployments of `osname`, in boot order.
    pub fn deployments_for_os<'a>(&'a self, osname: &'a str) -> impl Iterator<Item = &'a Deployment> + 'a {
        self.deployments.iter().filter(move |d| d.osname == osname)
    }

    pub fn deployment_dir(&self, deployment: &Deployment) -> PathBuf {
        self.os_deploy_dir(&deployment.osname).join(deployment.dir_name())
    }

    fn os_deploy_dir(&self, osname: &str) -> PathBuf {
        self.root.join("ostree/deploy").join(osname).join("deploy")
    }

    pub fn origin_path(&self, deployment: &Deployment) -> PathBuf {
        self.os_deploy_dir(&deployment.osname)
            .join(format!("{}.origin", deployment.dir_name()))
    }

    fn read_origin(&self, deployment: &Deployment) -> Result<Option<Refspec>> {
        let path = self.origin_path(deployment);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!(deployment = %deployment.dir_name(), "Deployment has no origin file");
                return Ok(None);
            }
            Err(e) => return Err(SysrootError::io(&path, e)),
        };
        let invalid = |reason: String| SysrootError::InvalidOrigin {
            deployment: deployment.dir_name(),
            reason,
        };
        let groups = parse_ini(&contents).map_err(|e| invalid(e.to_string()))?;
        let Some(raw) = groups.get(ORIGIN_GROUP).and_then(|g| g.get(ORIGIN_REFSPEC_KEY)) else {
            return Ok(None);
        };
        Refspec::parse(raw)
            .map(Some)
            .map_err(|e: RefspecError| invalid(e.to_string()))
    }

    pub(crate) fn write_origin(&self, deployment: &Deployment, refspec: &Refspec) -> Result<()> {
        let contents = format!("[{}]\n{}={}\n", ORIGIN_GROUP, ORIGIN_REFSPEC_KEY, refspec);
        self.write_atomic(&self.origin_path(deployment), contents.as_bytes())
    }

    fn find_booted(&self) -> Option<usize> {
        let cmdline = fs::read_to_string(&self.cmdline_path).unwrap_or_default();
        let booted_path = cmdline
            .split_whitespace()
            .find_map(|arg| arg.strip_prefix("ostree="));

        if let Some(booted_path) = booted_path {
            let found = self.deployments.iter().position(|d| {
                booted_path.trim_end_matches('/')
                    == format!("/ostree/deploy/{}/deploy/{}", d.osname, d.dir_name())
            });
            if found.is_some() {
                return found;
            }
            debug!(ostree = %booted_path, "Kernel command line names no known deployment");
        }

        if self.deployment_fallback && !self.deployments.is_empty() {
            debug!("Using the first deployment as booted");
            return Some(0);
        }
        None
    }

    /// Take the advisory sysroot lock, blocking until it is free.
    pub fn lock(&self) -> Result<SysrootLock> {
        let path = self.root.join(LOCK_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SysrootError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| SysrootError::io(&path, e))?;
        let lock = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| SysrootError::Lock(errno.to_string()))?;
        Ok(SysrootLock { _lock: lock })
    }

    /// Try to take the lock without blocking; `Ok(None)` if it is held.
    pub fn try_lock(&self) -> Result<Option<SysrootLock>> {
        let path = self.root.join(LOCK_FILE);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| SysrootError::io(parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| SysrootError::io(&path, e))?;
        match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
            Ok(lock) => Ok(Some(SysrootLock { _lock: lock })),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Ok(None),
            Err((_, errno)) => Err(SysrootError::Lock(errno.to_string())),
        }
    }

    fn write_deployments_file(&self) -> Result<()> {
        let file = DeploymentsFile {
            bootversion: self.bootversion,
            deployments: self.deployments.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|e| SysrootError::Corrupt(e.to_string()))?;
        self.write_atomic(&self.deployments_path(), &bytes)
    }

    pub(crate) fn write_atomic(&self, dest: &Path, bytes: &[u8]) -> Result<()> {
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).map_err(|e| SysrootError::io(parent, e))?;
        }
        let tmp = dest.with_extension(format!("tmp-{}", std::process::id()));
        fs::write(&tmp, bytes).map_err(|e| SysrootError::io(&tmp, e))?;
        fs::rename(&tmp, dest).map_err(|e| {
            let _ = fs::remove_file(&tmp);
            SysrootError::io(dest, e)
        })
    }
}
