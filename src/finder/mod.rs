//! Update source discovery.
//!
//! A [`Finder`] is one discovery backend: the Internet origin ([`MainFinder`]),
//! peers on the local network ([`LanFinder`]) or a mounted volume
//! ([`VolumeFinder`]). Each returns [`SourceResult`]s describing where the
//! requested refs can be downloaded from. The [`pool`] runs finders
//! concurrently and [`rank`] orders their results.

pub mod lan;
pub mod main;
pub mod pool;
pub mod rank;
pub mod volume;

use std::fmt;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::refspec::CollectionRef;
use crate::repo::Summary;

pub use lan::LanFinder;
pub use main::MainFinder;
pub use pool::{BootedCommit, MetadataPool, PoolOutcome};
pub use rank::{rank, RankedSources};
pub use volume::VolumeFinder;

/// Kind of update source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum SourceKind {
    /// Internet origin server.
    Main,
    /// Peer on the local network.
    Lan,
    /// Removable or mounted volume.
    Volume,
}

impl SourceKind {
    /// Name used in `[Download] Order=`.
    pub fn config_name(self) -> &'static str {
        match self {
            SourceKind::Main => "main",
            SourceKind::Lan => "lan",
            SourceKind::Volume => "volume",
        }
    }

    pub fn from_config_name(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "main" => Some(SourceKind::Main),
            "lan" => Some(SourceKind::Lan),
            "volume" => Some(SourceKind::Volume),
            _ => None,
        }
    }

    /// LAN and Volume sources do not use the Internet.
    pub fn is_local(self) -> bool {
        !matches!(self, SourceKind::Main)
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.config_name())
    }
}

/// A ref offered by a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedRef {
    pub collection_ref: CollectionRef,
    pub checksum: String,
    /// Commit timestamp, seconds since the epoch.
    pub timestamp: u64,
}

/// One discovered source and what it offers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceResult {
    pub kind: SourceKind,
    /// Repository base URL (`http://…` or `file://…`).
    pub base_url: String,
    /// Lower is better (round-trip time in ms for LAN peers).
    pub priority: i32,
    pub offered_refs: Vec<OfferedRef>,
}

impl SourceResult {
    pub fn new(kind: SourceKind, base_url: &str, priority: i32) -> Self {
        Self {
            kind,
            base_url: base_url.to_string(),
            priority,
            offered_refs: Vec::new(),
        }
    }

    /// Build a result offering whichever of `wanted` appear in `summary`.
    ///
    /// `fallback_collection_id` is used when the summary carries none.
    pub fn from_summary(
        kind: SourceKind,
        base_url: &str,
        priority: i32,
        summary: &Summary,
        wanted: &[CollectionRef],
        fallback_collection_id: Option<&str>,
    ) -> Self {
        let collection_id = summary
            .collection_id
            .as_deref()
            .or(fallback_collection_id);
        let mut result = Self::new(kind, base_url, priority);
        for target in wanted {
            let Some(entry) = summary.lookup(&target.ref_name) else {
                continue;
            };
            if !target.matches(collection_id, &target.ref_name) {
                continue;
            }
            result.offered_refs.push(OfferedRef {
                collection_ref: CollectionRef::new(collection_id, &target.ref_name),
                checksum: entry.checksum.clone(),
                timestamp: entry.timestamp,
            });
        }
        result
    }

    /// The offer satisfying `target`, if any.
    pub fn offer(&self, target: &CollectionRef) -> Option<&OfferedRef> {
        self.offered_refs.iter().find(|offered| {
            target.matches(
                offered.collection_ref.collection_id.as_deref(),
                &offered.collection_ref.ref_name,
            )
        })
    }
}

/// A discovery backend.
#[async_trait]
pub trait Finder: Send + Sync {
    fn kind(&self) -> SourceKind;

    /// Human-readable description for logs.
    fn describe(&self) -> String;

    /// Find sources offering any of `refs`. A finder that finds nothing
    /// returns an empty list rather than an error.
    async fn find(
        &self,
        refs: &[CollectionRef],
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceResult>>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::SummaryRef;

    fn summary(collection_id: Option<&str>) -> Summary {
        let mut summary = Summary {
            timestamp: 10,
            collection_id: collection_id.map(str::to_string),
            ..Default::default()
        };
        summary.refs.insert(
            "os/eos/amd64/eos3".to_string(),
            SummaryRef {
                checksum: "a".repeat(64),
                timestamp: 5,
            },
        );
        summary
    }

    #[test]
    fn test_source_kind_config_names() {
        for kind in [SourceKind::Main, SourceKind::Lan, SourceKind::Volume] {
            assert_eq!(SourceKind::from_config_name(kind.config_name()), Some(kind));
        }
        assert_eq!(SourceKind::from_config_name(" LAN "), Some(SourceKind::Lan));
        assert_eq!(SourceKind::from_config_name("usb"), None);
        assert!(!SourceKind::Main.is_local());
        assert!(SourceKind::Volume.is_local());
    }

    #[test]
    fn test_from_summary_filters_wanted_refs() {
        let wanted = [
            CollectionRef::new(Some("com.example.Os"), "os/eos/amd64/eos3"),
            CollectionRef::new(Some("com.example.Os"), "os/eos/amd64/eos4"),
        ];
        let result = SourceResult::from_summary(
            SourceKind::Main,
            "http://example.com",
            0,
            &summary(Some("com.example.Os")),
            &wanted,
            None,
        );
        assert_eq!(result.offered_refs.len(), 1);
        assert_eq!(result.offered_refs[0].timestamp, 5);
        assert!(result.offer(&wanted[0]).is_some());
        assert!(result.offer(&wanted[1]).is_none());
    }

    #[test]
    fn test_from_summary_rejects_other_collection() {
        let wanted = [CollectionRef::new(Some("com.example.Os"), "os/eos/amd64/eos3")];
        let result = SourceResult::from_summary(
            SourceKind::Lan,
            "http://peer",
            3,
            &summary(Some("org.other")),
            &wanted,
            None,
        );
        assert!(result.offered_refs.is_empty());
    }

    #[test]
    fn test_from_summary_uses_fallback_collection_id() {
        let wanted = [CollectionRef::new(Some("com.example.Os"), "os/eos/amd64/eos3")];
        let result = SourceResult::from_summary(
            SourceKind::Main,
            "http://example.com",
            0,
            &summary(None),
            &wanted,
            Some("com.example.Os"),
        );
        assert_eq!(result.offered_refs.len(), 1);
    }
}
