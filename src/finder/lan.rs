//! Local-network peer finder.
//!
//! Peers advertise their repositories as `_ostree_repo._tcp` DNS-SD services.
//! A browse sends one multicast PTR query and collects answers for the
//! configured window. Each service's bloom filter is checked before its
//! summary is downloaded; the summary round-trip time becomes the result's
//! priority so nearer peers win ties.

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use backon::Retryable;
use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, Record, RecordType};
use hickory_proto::serialize::binary::BinEncodable;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::main::fetch_summary;
use super::{Finder, SourceKind, SourceResult};
use crate::advertise::txt::{decode_txt, split_txt_string, TxtRecord, OSTREE_SERVICE_TYPE};
use crate::error::{Result, UpdaterError};
use crate::refspec::CollectionRef;
use crate::repo::pull::open_source;
use crate::utils::retry::RetryConfig;

/// mDNS multicast group and port.
pub const MDNS_ADDR: SocketAddr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(224, 0, 0, 251)), 5353);

const MAX_PACKET: usize = 9000;

/// A resolved DNS-SD service instance.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveredService {
    pub instance: String,
    pub host: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub txt: Vec<TxtRecord>,
}

impl DiscoveredService {
    fn is_resolved(&self) -> bool {
        self.port != 0 && !self.addresses.is_empty()
    }
}

/// Finder for peers on the local network.
pub struct LanFinder {
    browse_window: Duration,
    static_peers: Vec<String>,
    retry: RetryConfig,
}

impl LanFinder {
    pub fn new(browse_window: Duration, static_peers: Vec<String>, retry: RetryConfig) -> Self {
        Self {
            browse_window,
            static_peers,
            retry,
        }
    }

    /// Download one peer's summary and time it.
    async fn query_peer(
        &self,
        url: &str,
        refs: &[CollectionRef],
        cancel: &CancellationToken,
    ) -> Result<Option<SourceResult>> {
        let source = open_source(url).map_err(UpdaterError::from)?;
        let started = Instant::now();
        let summary = (|| async { fetch_summary(source.as_ref(), cancel).await })
            .retry(self.retry.backoff())
            .when(|e: &UpdaterError| e.is_transient())
            .notify(|e: &UpdaterError, dur| {
                debug!(peer = %url, error = %e, delay = ?dur, "Peer summary fetch failed, retrying");
            })
            .await?;
        let rtt_ms = i32::try_from(started.elapsed().as_millis()).unwrap_or(i32::MAX);

        let Some(summary) = summary else {
            debug!(peer = %url, "Peer has no summary");
            return Ok(None);
        };
        let result = SourceResult::from_summary(SourceKind::Lan, url, rtt_ms, &summary, refs, None);
        Ok((!result.offered_refs.is_empty()).then_some(result))
    }
}

#[async_trait]
impl Finder for LanFinder {
    fn kind(&self) -> SourceKind {
        SourceKind::Lan
    }

    fn describe(&self) -> String {
        if self.static_peers.is_empty() {
            "lan (mDNS)".to_string()
        } else {
            format!("lan (mDNS, {})", self.static_peers.join(", "))
        }
    }

    async fn find(
        &self,
        refs: &[CollectionRef],
        cancel: &CancellationToken,
    ) -> Result<Vec<SourceResult>> {
        if cancel.is_cancelled() {
            return Err(UpdaterError::cancelled());
        }

        let mut urls = self.static_peers.clone();
        if !self.browse_window.is_zero() {
            let services = browse(OSTREE_SERVICE_TYPE, self.browse_window, cancel).await?;
            debug!(count = services.len(), "Browsed local network");
            for service in services {
                match candidate_url(&service, refs) {
                    Some(url) => urls.push(url),
                    None => debug!(instance = %service.instance, "Peer does not offer the wanted refs"),
                }
            }
        }

        let mut results = Vec::new();
        for url in urls {
            match self.query_peer(&url, refs, cancel).await {
                Ok(Some(result)) => {
                    info!(peer = %url, rtt_ms = result.priority, "Found peer offering update");
                    results.push(result);
                }
                Ok(None) => {}
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => warn!(peer = %url, error = %e, "Failed to query peer"),
            }
        }
        Ok(results)
    }
}

/// Repository URL of a service whose bloom filter may contain one of `refs`.
pub fn candidate_url(service: &DiscoveredService, refs: &[CollectionRef]) -> Option<String> {
    let decoded = match decode_txt(&service.txt) {
        Ok(decoded) => decoded,
        Err(e) => {
            debug!(instance = %service.instance, error = %e, "Ignoring peer with invalid TXT records");
            return None;
        }
    };
    if !refs.iter().any(|r| decoded.may_offer(r)) {
        return None;
    }
    let addr = service.addresses.first()?;
    let prefix = match decoded.repo_index {
        0 => String::new(),
        n => format!("/{}", n),
    };
    Some(format!("http://{}{}", SocketAddr::new(*addr, service.port), prefix))
}

// ============================================================================
// mDNS browsing
// ============================================================================

/// Build the one-shot PTR query for `service_type` (e.g. `_ostree_repo._tcp`).
pub fn browse_query(service_type: &str) -> Result<Vec<u8>> {
    let name = Name::from_ascii(format!("{}.local.", service_type))
        .map_err(|e| UpdaterError::Network(format!("Invalid service type {}: {}", service_type, e)))?;
    let mut message = Message::new();
    message
        .set_id(0)
        .set_message_type(MessageType::Query)
        .set_op_code(OpCode::Query)
        .set_recursion_desired(false);
    message.add_query(Query::query(name, RecordType::PTR));
    message
        .to_bytes()
        .map_err(|e| UpdaterError::Network(format!("Failed to encode mDNS query: {}", e)))
}

/// Send a browse query and collect resolved services until `window` elapses.
pub async fn browse(
    service_type: &str,
    window: Duration,
    cancel: &CancellationToken,
) -> Result<Vec<DiscoveredService>> {
    let network = |e: std::io::Error| UpdaterError::Network(format!("mDNS browse failed: {}", e));
    let socket = UdpSocket::bind(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
        .await
        .map_err(network)?;
    socket
        .send_to(&browse_query(service_type)?, MDNS_ADDR)
        .await
        .map_err(network)?;

    let mut services = BTreeMap::new();
    let deadline = tokio::time::Instant::now() + window;
    let mut buf = vec![0u8; MAX_PACKET];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Err(UpdaterError::cancelled()),
            _ = tokio::time::sleep_until(deadline) => break,
            received = socket.recv_from(&mut buf) => {
                let (len, from) = received.map_err(network)?;
                match Message::from_vec(&buf[..len]) {
                    Ok(message) => merge_response(&mut services, &message, service_type),
                    Err(e) => debug!(from = %from, error = %e, "Ignoring malformed mDNS packet"),
                }
            }
        }
    }

    Ok(services
        .into_values()
        .filter(DiscoveredService::is_resolved)
        .collect())
}

/// Fold one mDNS response into the services seen so far.
pub fn merge_response(
    services: &mut BTreeMap<String, DiscoveredService>,
    message: &Message,
    service_type: &str,
) {
    let suffix = format!("{}.local.", service_type).to_lowercase();
    let records: Vec<&Record> = message
        .answers()
        .iter()
        .chain(message.additionals())
        .collect();

    for record in &records {
        if let Some(RData::PTR(ptr)) = record.data() {
            if record.name().to_ascii().to_lowercase() == suffix {
                let instance = ptr.0.to_ascii();
                services
                    .entry(instance.clone())
                    .or_insert_with(|| DiscoveredService {
                        instance,
                        ..Default::default()
                    });
            }
        }
    }

    let mut hosts: BTreeMap<String, Vec<IpAddr>> = BTreeMap::new();
    for record in &records {
        let name = record.name().to_ascii();
        match record.data() {
            Some(RData::SRV(srv)) => {
                if let Some(service) = services.get_mut(&name) {
                    service.port = srv.port();
                    service.host = srv.target().to_ascii();
                }
            }
            Some(RData::TXT(txt)) => {
                if let Some(service) = services.get_mut(&name) {
                    service.txt = txt.txt_data().iter().map(|raw| split_txt_string(raw)).collect();
                }
            }
            Some(RData::A(a)) => hosts.entry(name).or_default().push(IpAddr::V4(a.0)),
            Some(RData::AAAA(aaaa)) => hosts.entry(name).or_default().push(IpAddr::V6(aaaa.0)),
            _ => {}
        }
    }

    for service in services.values_mut() {
        if let Some(addresses) = hosts.get(&service.host) {
            for addr in addresses {
                if !service.addresses.contains(addr) {
                    service.addresses.push(*addr);
                }
            }
        }
    }
}
