//! Ordering of discovered sources.
//!
//! Local sources (LAN peers, volumes) are preferred whenever they offer a
//! commit at least as new as the Internet origin's; the update can then be
//! fetched without touching the Internet at all.

use std::cmp::Reverse;

use tracing::debug;

use super::{OfferedRef, SourceKind, SourceResult};
use crate::refspec::CollectionRef;

/// Sources for one target ref, best first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RankedSources {
    pub results: Vec<SourceResult>,
    /// Only local sources remain; the fetch must not use the Internet.
    pub offline_only: bool,
    /// Offer of the first result, if any source offers the target.
    pub best: Option<OfferedRef>,
}

impl RankedSources {
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Whether the only entry is the synthesized fallback source.
    pub fn is_fallback(&self) -> bool {
        self.best.is_none() && !self.results.is_empty()
    }
}

/// Rank `results` for `target`.
///
/// `order` is the configured source precedence used to break timestamp
/// ties; kinds missing from it sort after the listed ones. When no result
/// offers the target and `fallback_url` is set, a single Main result for
/// that URL (offering nothing) is returned so the caller can query it
/// directly.
pub fn rank(
    results: Vec<SourceResult>,
    target: &CollectionRef,
    order: &[SourceKind],
    fallback_url: Option<&str>,
) -> RankedSources {
    let precedence = |kind: SourceKind| {
        order
            .iter()
            .position(|k| *k == kind)
            .unwrap_or(order.len() + kind as usize)
    };

    let mut offering: Vec<(OfferedRef, SourceResult)> = results
        .into_iter()
        .filter_map(|result| result.offer(target).cloned().map(|offer| (offer, result)))
        .collect();

    if offering.is_empty() {
        return match fallback_url {
            Some(url) => {
                debug!(url = %url, target = %target, "No source offers the target; falling back to the remote URL");
                RankedSources {
                    results: vec![SourceResult::new(SourceKind::Main, url, i32::MAX)],
                    offline_only: false,
                    best: None,
                }
            }
            None => RankedSources {
                results: Vec::new(),
                offline_only: false,
                best: None,
            },
        };
    }

    let main_best = offering
        .iter()
        .filter(|(_, r)| !r.kind.is_local())
        .map(|(offer, _)| offer.timestamp)
        .max();
    let local_best = offering
        .iter()
        .filter(|(_, r)| r.kind.is_local())
        .map(|(offer, _)| offer.timestamp)
        .max();

    let offline_only = match (local_best, main_best) {
        (Some(local), Some(main)) => local >= main,
        (Some(_), None) => true,
        (None, _) => false,
    };
    offering.retain(|(_, r)| r.kind.is_local() == offline_only);

    offering.sort_by_key(|(offer, r)| (Reverse(offer.timestamp), precedence(r.kind), r.priority));

    let best = offering.first().map(|(offer, _)| offer.clone());
    RankedSources {
        results: offering.into_iter().map(|(_, r)| r).collect(),
        offline_only,
        best,
    }
}
