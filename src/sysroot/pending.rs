//! Marker describing a fetched update waiting to be applied.

use std::fs;
use std::io;

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Result, Sysroot, SysrootError};

/// Location of the marker relative to the sysroot root.
pub const PENDING_UPDATE_FILE: &str = "ostree/eos-updater/pending-update.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingUpdate {
    pub checksum: String,
    /// Refspec the update was fetched from (`remote:ref`).
    pub refspec: String,
    /// Refspec of the booted deployment at fetch time.
    pub original_refspec: String,
}

impl Sysroot {
    pub fn write_pending_update(&self, pending: &PendingUpdate) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(pending).map_err(|e| SysrootError::Corrupt(e.to_string()))?;
        self.write_atomic(&self.root.join(PENDING_UPDATE_FILE), &bytes)?;
        debug!(checksum = %pending.checksum, "Recorded pending update");
        Ok(())
    }

    pub fn read_pending_update(&self) -> Result<Option<PendingUpdate>> {
        let path = self.root.join(PENDING_UPDATE_FILE);
        match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| SysrootError::Corrupt(format!("{}: {}", PENDING_UPDATE_FILE, e))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SysrootError::io(&path, e)),
        }
    }

    pub fn clear_pending_update(&self) -> Result<()> {
        let path = self.root.join(PENDING_UPDATE_FILE);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(SysrootError::io(&path, e)),
        }
    }
}
