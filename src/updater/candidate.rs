//! The update found by Poll and consumed by Fetch.

use crate::finder::SourceResult;
use crate::refspec::{CollectionRef, Refspec};
use crate::repo::CommitSizes;

/// An update found by Poll.
///
/// Immutable once built: Fetch downloads exactly `checksum` from `sources`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateCandidate {
    pub checksum: String,
    /// Refspec the update is pulled from; differs from `old_refspec` after
    /// a checkpoint or end-of-life rebase.
    pub new_refspec: Refspec,
    /// Refspec of the booted deployment.
    pub old_refspec: Refspec,
    pub collection_ref: CollectionRef,
    pub version: Option<String>,
    pub is_user_visible: bool,
    pub release_notes_uri: Option<String>,
    pub label: String,
    pub message: String,
    pub sizes: CommitSizes,
    /// Ranked sources offering `checksum`.
    pub sources: Vec<SourceResult>,
    pub offline_only: bool,
}

impl UpdateCandidate {
    /// Remote the update is pulled into.
    pub fn remote(&self) -> Option<&str> {
        self.new_refspec.remote.as_deref()
    }

    /// Sources Fetch may use: only local ones when the poll found the
    /// update offline.
    pub fn fetch_sources(&self) -> Vec<SourceResult> {
        self.sources
            .iter()
            .filter(|s| !self.offline_only || s.kind.is_local())
            .cloned()
            .collect()
    }
}
