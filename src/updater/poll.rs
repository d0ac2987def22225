//! Poll: find the newest commit the booted system should move to.
//!
//! The booted branch is checked first, following end-of-life rebases. When
//! it has nothing new and the booted commit names a checkpoint target, the
//! checkpoint policy decides whether the target branch is polled instead.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::candidate::UpdateCandidate;
use crate::checkpoint::{should_follow_commit, BlockReason};
use crate::config::Config;
use crate::error::{Result, UpdaterError};
use crate::finder::{
    rank, volume::removable_mounts, BootedCommit, Finder, LanFinder, MainFinder, MetadataPool,
    OfferedRef, PoolOutcome, SourceKind, SourceResult, VolumeFinder,
};
use crate::refspec::{CollectionRef, Refspec};
use crate::repo::config::COLLECTION_ID_OPTION;
use crate::repo::object::{major_version, CHECKPOINT_TARGET_KEY};
use crate::repo::pull::open_source;
use crate::repo::{Commit, PullFlags, Repo};
use crate::sysroot::Sysroot;
use crate::utils::retry::RetryConfig;

const MOUNTS_TABLE: &str = "/proc/self/mounts";

/// Where Poll looks for updates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollSource {
    /// The finders named by the download configuration.
    Configured,
    /// A single volume mounted at the given path.
    Volume(PathBuf),
}

/// Finders and ranking parameters for one poll.
struct SourcePlan {
    finders: Vec<Arc<dyn Finder>>,
    order: Vec<SourceKind>,
    /// Queried directly when no finder offers the ref.
    fallback_url: Option<String>,
    timeout: Duration,
}

impl SourcePlan {
    fn configured(
        config: &Config,
        repo: &Repo,
        remote: &str,
        collection_id: Option<&str>,
    ) -> Result<Self> {
        let download = config.download()?;
        let retry = RetryConfig::from(&config.finders);
        let mut finders: Vec<Arc<dyn Finder>> = Vec::new();
        let mut fallback_url = None;

        for kind in &download.order {
            match kind {
                SourceKind::Main => {
                    let urls = match &download.override_uris {
                        Some(uris) => uris.clone(),
                        None => vec![repo.remote_url(remote)?],
                    };
                    fallback_url = urls.first().cloned();
                    finders.push(Arc::new(MainFinder::new(
                        urls,
                        collection_id.map(str::to_string),
                        retry.clone(),
                    )));
                }
                SourceKind::Lan => finders.push(Arc::new(LanFinder::new(
                    Duration::from_millis(config.lan.browse_ms),
                    config.lan.peers.clone(),
                    retry.clone(),
                ))),
                SourceKind::Volume => {
                    for mount in removable_mounts(Path::new(MOUNTS_TABLE)) {
                        finders.push(Arc::new(VolumeFinder::new(mount)));
                    }
                }
            }
        }

        Ok(Self {
            finders,
            order: download.order,
            fallback_url,
            timeout: config.finders.timeout(),
        })
    }

    fn volume(config: &Config, path: &Path) -> Self {
        Self {
            finders: vec![Arc::new(VolumeFinder::new(path))],
            order: vec![SourceKind::Volume],
            fallback_url: None,
            timeout: config.finders.timeout(),
        }
    }

    fn pool(&self) -> MetadataPool {
        MetadataPool::new(self.finders.clone(), self.timeout)
    }
}

/// The booted deployment as seen by Poll.
struct Booted {
    checksum: String,
    refspec: Refspec,
    remote: String,
    /// `None` when the commit object is missing locally.
    commit: Option<Commit>,
}

/// Newest commit found on a branch, after end-of-life rebases.
struct Latest {
    checksum: String,
    commit: Commit,
    refspec: Refspec,
    collection_ref: CollectionRef,
    sources: Vec<SourceResult>,
    offline_only: bool,
}

/// Run one poll. `Ok(None)` means no update is available.
pub async fn poll(
    config: &Config,
    source: &PollSource,
    cancel: &CancellationToken,
) -> Result<Option<UpdateCandidate>> {
    let mut sysroot = Sysroot::new(&config.sysroot);
    sysroot.load()?;
    let deployment = sysroot
        .booted_deployment()
        .cloned()
        .ok_or_else(UpdaterError::not_ostree_system)?;
    let refspec = deployment.origin.clone().ok_or_else(|| {
        UpdaterError::InvalidConfig(format!(
            "No origin refspec for deployment ‘{}’",
            deployment.dir_name()
        ))
    })?;
    let remote = refspec.remote.clone().ok_or_else(|| {
        UpdaterError::InvalidConfig(format!(
            "Invalid refspec ‘{}’ in origin: did not contain a remote name",
            refspec
        ))
    })?;

    let repo = sysroot.repo()?;
    let collection_id = repo.remote_option(&remote, COLLECTION_ID_OPTION)?;
    let plan = match source {
        PollSource::Configured => {
            SourcePlan::configured(config, &repo, &remote, collection_id.as_deref())?
        }
        PollSource::Volume(path) => SourcePlan::volume(config, path),
    };

    let booted = Booted {
        commit: repo.load_commit(&deployment.checksum).ok(),
        checksum: deployment.checksum,
        refspec,
        remote,
    };
    info!(
        booted = %booted.checksum,
        refspec = %booted.refspec,
        finders = plan.finders.len(),
        "Polling for updates"
    );

    let booted_commit = booted.commit.as_ref().map(|commit| BootedCommit {
        checksum: &booted.checksum,
        timestamp: commit.timestamp,
    });
    let latest = fetch_latest_commit(
        &repo,
        &plan,
        &booted.remote,
        booted.refspec.clone(),
        collection_id.clone(),
        booted_commit,
        cancel,
    )
    .await?;

    if let Some(latest) = latest {
        if let Some(user_visible) = is_checksum_an_update(&booted, &latest) {
            return Ok(Some(build_candidate(&repo, &booted, latest, user_visible)));
        }
    }

    let Some(target) = checkpoint_target(&booted) else {
        info!(refspec = %booted.refspec, "No update available");
        return Ok(None);
    };
    match should_follow_commit(&repo, &booted.checksum, &booted.refspec.ref_name, &target) {
        Ok(()) => {}
        Err(UpdaterError::CheckpointBlock(block)) if block.reason == BlockReason::TargetEqualsSource => {
            info!(reason = %block, "Not following checkpoint");
            return Ok(None);
        }
        Err(e) => return Err(e),
    }

    info!(target = %target, "Following checkpoint");
    let target_refspec = booted.refspec.with_ref(&target)?;
    let latest = fetch_latest_commit(
        &repo,
        &plan,
        &booted.remote,
        target_refspec,
        collection_id,
        None,
        cancel,
    )
    .await?;
    Ok(latest.map(|latest| {
        let user_visible = is_user_visible(&booted, &latest.commit);
        build_candidate(&repo, &booted, latest, user_visible)
    }))
}

/// Find the newest commit on `refspec`'s branch and pull its commit object.
async fn fetch_latest_commit(
    repo: &Repo,
    plan: &SourcePlan,
    remote: &str,
    mut refspec: Refspec,
    collection_id: Option<String>,
    mut booted: Option<BootedCommit<'_>>,
    cancel: &CancellationToken,
) -> Result<Option<Latest>> {
    let mut collection_ref = CollectionRef::new(collection_id.as_deref(), &refspec.ref_name);
    let mut seen = HashSet::new();

    loop {
        seen.insert(refspec.ref_name.clone());
        let results = match plan.pool().run(&[collection_ref.clone()], booted, cancel).await? {
            PoolOutcome::NoUpdateAvailable => return Ok(None),
            PoolOutcome::Results(results) => results,
        };

        let mut ranked = rank(results, &collection_ref, &plan.order, plan.fallback_url.as_deref());
        if ranked.is_empty() {
            if seen.len() > 1 {
                return Err(UpdaterError::NotFound(format!(
                    "No source offers rebase target {}",
                    collection_ref
                )));
            }
            debug!(target = %collection_ref, "No source offers the ref");
            return Ok(None);
        }

        let checksum = match &ranked.best {
            Some(best) => {
                repo.pull_with_results(
                    &ranked.results,
                    Some(remote),
                    &collection_ref,
                    Some(&best.checksum),
                    PullFlags::COMMIT_ONLY,
                    None,
                    cancel,
                )
                .await?
            }
            None => {
                let source = open_source(&ranked.results[0].base_url)?;
                repo.pull_from_source(
                    source.as_ref(),
                    Some(remote),
                    &refspec.ref_name,
                    None,
                    PullFlags::COMMIT_ONLY,
                    None,
                    cancel,
                )
                .await?
            }
        };
        let commit = repo.load_commit(&checksum)?;

        if ranked.is_fallback() {
            let offer = OfferedRef {
                collection_ref: collection_ref.clone(),
                checksum: checksum.clone(),
                timestamp: commit.timestamp,
            };
            ranked.results[0].offered_refs.push(offer.clone());
            ranked.best = Some(offer);
        }

        match commit.endoflife_rebase() {
            Some(next) if next != refspec.ref_name && !seen.contains(next) => {
                info!(from = %refspec.ref_name, to = %next, "Following end-of-life rebase");
                let next_collection_id = commit
                    .collection_binding()
                    .map(str::to_string)
                    .or_else(|| collection_ref.collection_id.clone());
                refspec = refspec.with_ref(next)?;
                collection_ref = CollectionRef::new(next_collection_id.as_deref(), next);
                booted = None;
            }
            Some(next) if next != refspec.ref_name => {
                warn!(ref_name = %next, "End-of-life rebase loop detected; ignoring");
                return Ok(Some(latest(checksum, commit, refspec, collection_ref, ranked)));
            }
            _ => return Ok(Some(latest(checksum, commit, refspec, collection_ref, ranked))),
        }
    }
}

fn latest(
    checksum: String,
    commit: Commit,
    refspec: Refspec,
    collection_ref: CollectionRef,
    ranked: crate::finder::RankedSources,
) -> Latest {
    Latest {
        checksum,
        commit,
        refspec,
        collection_ref,
        sources: ranked.results,
        offline_only: ranked.offline_only,
    }
}

/// `None` if `latest` is not an update for `booted`; otherwise whether it
/// should be shown to the user.
fn is_checksum_an_update(booted: &Booted, latest: &Latest) -> Option<bool> {
    if latest.checksum == booted.checksum {
        return None;
    }
    let Some(current) = &booted.commit else {
        warn!(
            "Error loading current commit ‘{}’ to check if ‘{}’ is an update (assuming it is): not found",
            booted.checksum, latest.checksum
        );
        return Some(false);
    };

    let is_newer = latest.refspec.ref_name != booted.refspec.ref_name
        || latest.commit.timestamp > current.timestamp;
    if !is_newer {
        debug!(
            update = %latest.checksum,
            booted = %booted.checksum,
            "Offered commit is not newer than the booted commit"
        );
        return None;
    }
    Some(is_user_visible(booted, &latest.commit))
}

fn is_user_visible(booted: &Booted, update: &Commit) -> bool {
    let booted_major = booted
        .commit
        .as_ref()
        .and_then(Commit::version)
        .and_then(major_version);
    let update_major = update.version().and_then(major_version);
    match (booted_major, update_major) {
        (Some(booted), Some(update)) => update > booted,
        _ => false,
    }
}

/// Successor ref named by the booted commit, if any.
fn checkpoint_target(booted: &Booted) -> Option<String> {
    let Some(commit) = &booted.commit else {
        warn!(
            "Error loading commit ‘{}’ to find checkpoint (assuming none)",
            booted.checksum
        );
        return None;
    };
    let raw = commit.metadata.get(CHECKPOINT_TARGET_KEY)?;
    let Some(raw) = raw.as_str() else {
        warn!("Ignoring non-string {} metadata", CHECKPOINT_TARGET_KEY);
        return None;
    };
    match Refspec::parse(raw) {
        Ok(target) => {
            if let Some(remote) = &target.remote {
                warn!(
                    "Ignoring remote '{}' in {} metadata '{}'",
                    remote, CHECKPOINT_TARGET_KEY, raw
                );
            }
            Some(target.ref_name)
        }
        Err(e) => {
            warn!("Failed to parse {} metadata '{}': {}", CHECKPOINT_TARGET_KEY, raw, e);
            None
        }
    }
}

/// Expand `${booted_version}` and `${update_version}` in a release notes
/// URI template.
pub fn expand_release_notes_uri(
    template: &str,
    booted_version: Option<&str>,
    update_version: Option<&str>,
) -> String {
    template
        .replace("${booted_version}", booted_version.unwrap_or("-"))
        .replace("${update_version}", update_version.unwrap_or("-"))
}

fn build_candidate(repo: &Repo, booted: &Booted, latest: Latest, is_user_visible: bool) -> UpdateCandidate {
    let sizes = repo.commit_sizes(&latest.commit);
    let update_version = latest.commit.version().map(str::to_string);
    let booted_version = booted.commit.as_ref().and_then(Commit::version);
    let release_notes_uri = latest
        .commit
        .release_notes_uri()
        .map(|template| expand_release_notes_uri(template, booted_version, update_version.as_deref()));

    info!(
        update = %latest.checksum,
        refspec = %latest.refspec,
        version = update_version.as_deref().unwrap_or("-"),
        offline_only = latest.offline_only,
        "Update available"
    );
    UpdateCandidate {
        checksum: latest.checksum,
        new_refspec: latest.refspec,
        old_refspec: booted.refspec.clone(),
        collection_ref: latest.collection_ref,
        version: update_version,
        is_user_visible,
        release_notes_uri,
        label: latest.commit.subject,
        message: latest.commit.body,
        sizes,
        sources: latest.sources,
        offline_only: latest.offline_only,
    }
}
