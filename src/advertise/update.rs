//! Keeping the Avahi service files in line with the advertisement policy.

use std::path::Path;

use tracing::{info, warn};

use super::selector::{advertisable_commit, AdvertisableCommit};
use super::service_file::{delete_legacy, delete_ostree, generate_legacy, generate_ostree};
use super::txt::{Advertisement, TxtOptions};
use crate::config::SysrootSettings;
use crate::error::{Result, UpdaterError};
use crate::refspec::CollectionRef;
use crate::sysroot::Sysroot;

/// Result of [`update_service_files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdvertiseOutcome {
    Advertised(AdvertisableCommit),
    Withdrawn,
}

/// Write or delete the service files for repository 0 of the sysroot.
///
/// Failing to find an advertisable commit is not an error; the files are
/// deleted instead.
pub fn update_service_files(
    settings: &SysrootSettings,
    advertise_updates: bool,
    services_dir: &Path,
) -> Result<AdvertiseOutcome> {
    let mut sysroot = Sysroot::new(settings);
    let commit = match sysroot.load() {
        Ok(()) => match advertisable_commit(&sysroot) {
            Ok(commit) => Some(commit),
            Err(e) => {
                warn!("Error getting advertisable commit: {}", e);
                None
            }
        },
        Err(e) => {
            warn!("Error loading sysroot: {}", e);
            None
        }
    };

    let commit = match (advertise_updates, commit) {
        (true, Some(commit)) => {
            info!(
                "Advertising updates is enabled, and deployed commit ‘{}’ ({}, {}) will be advertised.",
                commit.checksum,
                format_timestamp(commit.timestamp),
                commit.ostree_path
            );
            commit
        }
        (false, Some(commit)) => {
            info!(
                "Advertising updates is disabled. Deployed commit ‘{}’ ({}, {}) will not be advertised.",
                commit.checksum,
                format_timestamp(commit.timestamp),
                commit.ostree_path
            );
            return withdraw(services_dir);
        }
        (true, None) => {
            info!("Advertising updates is enabled, but no appropriate deployed commits were found. Not advertising updates.");
            return withdraw(services_dir);
        }
        (false, None) => {
            info!("Advertising updates is disabled, and no appropriate deployed commits were found. Not advertising updates.");
            return withdraw(services_dir);
        }
    };

    let ad = advertisement(&sysroot)?;
    if let Err(e) = generate_legacy(services_dir, &commit.ostree_path, commit.timestamp) {
        let _ = delete_legacy(services_dir);
        return Err(e);
    }
    if let Err(e) = generate_ostree(services_dir, &ad, &TxtOptions::default()) {
        let _ = delete_ostree(services_dir, 0);
        let _ = delete_legacy(services_dir);
        return Err(e);
    }
    Ok(AdvertiseOutcome::Advertised(commit))
}

fn withdraw(services_dir: &Path) -> Result<AdvertiseOutcome> {
    delete_legacy(services_dir)?;
    delete_ostree(services_dir, 0)?;
    Ok(AdvertiseOutcome::Withdrawn)
}

/// Refs and summary timestamp of the sysroot repository as served to peers.
fn advertisement(sysroot: &Sysroot) -> Result<Advertisement> {
    let repo = sysroot.repo()?;
    let remote = sysroot
        .booted_deployment()
        .and_then(|d| d.origin.as_ref())
        .and_then(|o| o.remote.clone());
    let summary = match repo.read_summary()? {
        Some(summary) => summary,
        None => repo.regenerate_summary(remote.as_deref())?,
    };
    if summary.refs.is_empty() {
        return Err(UpdaterError::NotFound("no refs to advertise".to_string()));
    }
    let refs = summary
        .refs
        .keys()
        .map(|name| CollectionRef::new(summary.collection_id.as_deref(), name))
        .collect();
    Ok(Advertisement {
        refs,
        summary_timestamp: summary.timestamp,
        repo_index: 0,
        ostree_path: None,
    })
}

fn format_timestamp(timestamp: u64) -> String {
    i64::try_from(timestamp)
        .ok()
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|dt| dt.format("%FT%T%:z").to_string())
        .unwrap_or_else(|| timestamp.to_string())
}
