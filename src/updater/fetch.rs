//! Fetch: download the commit Poll found.

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::candidate::UpdateCandidate;
use crate::config::Config;
use crate::error::{Result, UpdaterError};
use crate::repo::pull::ProgressCallback;
use crate::repo::PullFlags;
use crate::sysroot::{PendingUpdate, Sysroot};

/// Pull exactly `candidate.checksum` and record it as the pending update.
///
/// Offline candidates are fetched from local sources only.
pub async fn fetch(
    config: &Config,
    candidate: &UpdateCandidate,
    progress: ProgressCallback<'_>,
    cancel: &CancellationToken,
) -> Result<()> {
    let sysroot = Sysroot::new(&config.sysroot);
    let repo = sysroot.repo()?;
    let sources = candidate.fetch_sources();
    if sources.is_empty() {
        return Err(UpdaterError::NotFound(format!(
            "No source offers {} for {}",
            candidate.checksum, candidate.collection_ref
        )));
    }

    info!(
        update = %candidate.checksum,
        refspec = %candidate.new_refspec,
        sources = sources.len(),
        offline_only = candidate.offline_only,
        "Fetching update"
    );
    let pulled = repo
        .pull_with_results(
            &sources,
            candidate.remote(),
            &candidate.collection_ref,
            Some(&candidate.checksum),
            PullFlags::NONE,
            Some(progress),
            cancel,
        )
        .await?;
    if pulled != candidate.checksum {
        return Err(UpdaterError::Corrupt(format!(
            "Pulled commit {} instead of {}",
            pulled, candidate.checksum
        )));
    }

    sysroot.write_pending_update(&PendingUpdate {
        checksum: candidate.checksum.clone(),
        refspec: candidate.new_refspec.to_string(),
        original_refspec: candidate.old_refspec.to_string(),
    })?;
    info!(update = %candidate.checksum, "Update fetched");
    Ok(())
}
