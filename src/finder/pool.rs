//! Concurrent metadata fetch across all configured finders.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Finder, SourceResult};
use crate::error::{Result, UpdaterError};
use crate::refspec::CollectionRef;

/// Default per-finder time limit.
pub const DEFAULT_FINDER_TIMEOUT: Duration = Duration::from_secs(30);

/// What the pool found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolOutcome {
    /// Results from every finder that answered, unranked.
    Results(Vec<SourceResult>),
    /// Nothing newer than the booted commit is on offer.
    NoUpdateAvailable,
}

/// The booted commit, for the single-source no-update shortcut.
#[derive(Debug, Clone, Copy)]
pub struct BootedCommit<'a> {
    pub checksum: &'a str,
    pub timestamp: u64,
}

/// Runs a set of finders concurrently.
pub struct MetadataPool {
    finders: Vec<Arc<dyn Finder>>,
    timeout: Duration,
}

impl MetadataPool {
    pub fn new(finders: Vec<Arc<dyn Finder>>, timeout: Duration) -> Self {
        Self { finders, timeout }
    }

    /// Query every finder for `refs`.
    ///
    /// A finder that times out contributes nothing and is not a failure.
    /// The pool fails only when every finder failed; the first error is
    /// returned with the others appended.
    pub async fn run(
        &self,
        refs: &[CollectionRef],
        booted: Option<BootedCommit<'_>>,
        cancel: &CancellationToken,
    ) -> Result<PoolOutcome> {
        if self.finders.is_empty() {
            debug!("No finders configured");
            return Ok(PoolOutcome::NoUpdateAvailable);
        }

        let queries = self.finders.iter().map(|finder| async move {
            let outcome = tokio::time::timeout(self.timeout, finder.find(refs, cancel)).await;
            (finder, outcome)
        });
        let outcomes = join_all(queries).await;

        if cancel.is_cancelled() {
            return Err(UpdaterError::cancelled());
        }

        let mut results = Vec::new();
        let mut errors: Vec<(String, UpdaterError)> = Vec::new();
        let mut succeeded = 0usize;
        for (finder, outcome) in outcomes {
            match outcome {
                Ok(Ok(found)) => {
                    succeeded += 1;
                    debug!(finder = %finder.describe(), results = found.len(), "Finder completed");
                    results.extend(found);
                }
                Ok(Err(e)) if e.is_cancelled() => return Err(e),
                Ok(Err(e)) => {
                    warn!("Failed to poll metadata from source {}: {}", finder.describe(), e);
                    errors.push((finder.describe(), e));
                }
                Err(_) => {
                    succeeded += 1;
                    warn!(
                        finder = %finder.describe(),
                        timeout_secs = self.timeout.as_secs(),
                        "Finder timed out; continuing with partial results"
                    );
                }
            }
        }

        if succeeded == 0 {
            let mut errors = errors.into_iter();
            if let Some((_, first)) = errors.next() {
                let others: Vec<String> = errors.map(|(name, e)| format!("{}: {}", name, e)).collect();
                return Err(if others.is_empty() {
                    first
                } else {
                    first.annotate(&others.join("; "))
                });
            }
        }

        if succeeded == 1 {
            if let Some(booted) = booted {
                let offers: Vec<_> = results
                    .iter()
                    .flat_map(|r| r.offered_refs.iter())
                    .collect();
                if !offers.is_empty()
                    && offers
                        .iter()
                        .all(|o| o.checksum == booted.checksum || o.timestamp <= booted.timestamp)
                {
                    debug!(booted = %booted.checksum, "Only source offers nothing newer than the booted commit");
                    return Ok(PoolOutcome::NoUpdateAvailable);
                }
            }
        }

        Ok(PoolOutcome::Results(results))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::finder::{OfferedRef, SourceKind};
    use async_trait::async_trait;

    const REF: &str = "os/eos/amd64/eos3";

    enum Behaviour {
        Offer(u64),
        Fail(&'static str),
        Hang,
    }

    struct FakeFinder {
        kind: SourceKind,
        behaviour: Behaviour,
    }

    #[async_trait]
    impl Finder for FakeFinder {
        fn kind(&self) -> SourceKind {
            self.kind
        }

        fn describe(&self) -> String {
            format!("fake {}", self.kind)
        }

        async fn find(
            &self,
            refs: &[CollectionRef],
            cancel: &CancellationToken,
        ) -> Result<Vec<SourceResult>> {
            match self.behaviour {
                Behaviour::Offer(timestamp) => {
                    let mut result = SourceResult::new(self.kind, "http://fake", 0);
                    result.offered_refs.push(OfferedRef {
                        collection_ref: refs[0].clone(),
                        checksum: format!("{:064x}", timestamp),
                        timestamp,
                    });
                    Ok(vec![result])
                }
                Behaviour::Fail(msg) => Err(UpdaterError::Network(msg.to_string())),
                Behaviour::Hang => {
                    cancel.cancelled().await;
                    Err(UpdaterError::cancelled())
                }
            }
        }
    }

    fn pool(finders: Vec<FakeFinder>) -> MetadataPool {
        MetadataPool::new(
            finders
                .into_iter()
                .map(|f| Arc::new(f) as Arc<dyn Finder>)
                .collect(),
            Duration::from_millis(50),
        )
    }

    fn refs() -> Vec<CollectionRef> {
        vec![CollectionRef::new(None, REF)]
    }

    #[tokio::test]
    async fn test_no_finders_is_no_update() {
        let outcome = pool(Vec::new())
            .run(&refs(), None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, PoolOutcome::NoUpdateAvailable);
    }

    #[tokio::test]
    async fn test_partial_failure_is_success() {
        let outcome = pool(vec![
            FakeFinder { kind: SourceKind::Main, behaviour: Behaviour::Fail("down") },
            FakeFinder { kind: SourceKind::Lan, behaviour: Behaviour::Offer(7) },
        ])
        .run(&refs(), None, &CancellationToken::new())
        .await
        .unwrap();
        match outcome {
            PoolOutcome::Results(results) => assert_eq!(results.len(), 1),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_failures_annotated() {
        let err = pool(vec![
            FakeFinder { kind: SourceKind::Main, behaviour: Behaviour::Fail("first") },
            FakeFinder { kind: SourceKind::Lan, behaviour: Behaviour::Fail("second") },
        ])
        .run(&refs(), None, &CancellationToken::new())
        .await
        .unwrap_err();
        assert_eq!(err.name(), "NETWORK");
        assert_eq!(err.to_string(), "first; fake lan: second");
    }

    #[tokio::test]
    async fn test_timeout_counts_as_partial_success() {
        let outcome = pool(vec![
            FakeFinder { kind: SourceKind::Main, behaviour: Behaviour::Fail("down") },
            FakeFinder { kind: SourceKind::Lan, behaviour: Behaviour::Hang },
        ])
        .run(&refs(), None, &CancellationToken::new())
        .await
        .unwrap();
        assert_eq!(outcome, PoolOutcome::Results(Vec::new()));
    }

    #[tokio::test]
    async fn test_single_source_with_old_commit_is_no_update() {
        let booted = format!("{:064x}", 9);
        let outcome = pool(vec![FakeFinder {
            kind: SourceKind::Main,
            behaviour: Behaviour::Offer(9),
        }])
        .run(
            &refs(),
            Some(BootedCommit { checksum: &booted, timestamp: 9 }),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome, PoolOutcome::NoUpdateAvailable);
    }

    #[tokio::test]
    async fn test_single_source_with_newer_commit() {
        let booted = format!("{:064x}", 9);
        let outcome = pool(vec![FakeFinder {
            kind: SourceKind::Main,
            behaviour: Behaviour::Offer(10),
        }])
        .run(
            &refs(),
            Some(BootedCommit { checksum: &booted, timestamp: 9 }),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert!(matches!(outcome, PoolOutcome::Results(r) if r.len() == 1));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = pool(vec![FakeFinder { kind: SourceKind::Lan, behaviour: Behaviour::Hang }])
            .run(&refs(), None, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
