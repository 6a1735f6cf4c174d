//! A monitored peer: identity, address range, thresholds and last-seen time.
//!
//! Everything except the last-seen timestamp is fixed at construction. The
//! timestamp is written by the ingestion loop on every matching packet and
//! read by the check loop once per cycle, so it sits behind its own RwLock.

use crate::state::Thresholds;
use chrono::{DateTime, Utc};
use ipnet::IpNet;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;
use std::time::Duration;

/// Index of a peer in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(usize);

impl PeerId {
    pub(crate) fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// URL that events for a peer are POSTed to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WebhookTarget(String);

impl WebhookTarget {
    pub fn new(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for WebhookTarget {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A peer expected to send ICMP echo requests from an address range.
#[derive(Debug)]
pub struct Peer {
    id: PeerId,
    name: String,
    network: IpNet,
    thresholds: Thresholds,
    webhook: Option<WebhookTarget>,
    /// When the last matching packet arrived (None = never)
    last_seen: RwLock<Option<DateTime<Utc>>>,
}

impl Peer {
    pub(crate) fn new(
        id: PeerId,
        name: String,
        network: IpNet,
        thresholds: Thresholds,
        webhook: Option<WebhookTarget>,
    ) -> Self {
        Self {
            id,
            name,
            network: network.trunc(),
            thresholds,
            webhook,
            last_seen: RwLock::new(None),
        }
    }

    pub fn id(&self) -> PeerId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn network(&self) -> IpNet {
        self.network
    }

    pub fn thresholds(&self) -> Thresholds {
        self.thresholds
    }

    pub fn webhook(&self) -> Option<&WebhookTarget> {
        self.webhook.as_ref()
    }

    /// Check if the address falls inside this peer's network.
    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.network.contains(addr)
    }

    /// Record that a packet from this peer arrived at `now`.
    pub fn touch(&self, now: DateTime<Utc>) {
        *self.last_seen.write() = Some(now);
    }

    /// When the last matching packet arrived.
    pub fn last_seen(&self) -> Option<DateTime<Utc>> {
        *self.last_seen.read()
    }

    /// Check whether the peer was seen within `timeout` of `now`.
    ///
    /// Returns the observation together with the timestamp it was computed
    /// from, both taken under a single read lock.
    pub fn observe(&self, now: DateTime<Utc>, timeout: Duration) -> (bool, Option<DateTime<Utc>>) {
        let last_seen = self.last_seen.read();
        let seen = match *last_seen {
            Some(at) => now
                .signed_duration_since(at)
                .to_std()
                // Clock stepped backwards past the last packet: treat as just seen
                .map_or(true, |elapsed| elapsed < timeout),
            None => false,
        };
        (seen, *last_seen)
    }
}

impl Display for Peer {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Peer {} - Network {}", self.name, self.network)
    }
}
