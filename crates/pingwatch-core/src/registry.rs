//! Ordered registry of monitored peers.
//!
//! Built once from configuration; membership never changes afterwards.
//! Packets are routed to the first peer (in configuration order) whose
//! network contains the source address. Overlapping networks are allowed
//! and resolved by that order.

use crate::config::Config;
use crate::peer::{Peer, PeerId, WebhookTarget};
use crate::state::Thresholds;
use ipnet::IpNet;
use std::net::IpAddr;
use thiserror::Error;
use tracing::warn;

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("One or more peers must be configured")]
    TooFewPeers,
    #[error("Invalid network {range:?} for peer {peer:?}: {source}")]
    InvalidAddressRange {
        peer: String,
        range: String,
        source: ipnet::AddrParseError,
    },
}

/// Fixed, ordered collection of peers.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: Vec<Peer>,
}

impl PeerRegistry {
    /// Build the registry from configuration.
    ///
    /// Per-peer thresholds and webhook override the global values when set
    /// (non-zero / non-empty). Fails without building any peer if a network
    /// does not parse.
    pub fn from_config(config: &Config) -> Result<Self, RegistryError> {
        if config.peers.is_empty() {
            return Err(RegistryError::TooFewPeers);
        }

        let mut peers = Vec::with_capacity(config.peers.len());
        for (index, pc) in config.peers.iter().enumerate() {
            let up = override_or(pc.up_threshold, config.up_threshold);
            let down = override_or(pc.down_threshold, config.down_threshold);

            let webhook = if pc.webhook.is_empty() {
                &config.webhook
            } else {
                &pc.webhook
            };
            let webhook = (!webhook.is_empty()).then(|| WebhookTarget::new(webhook.as_str()));

            let network: IpNet =
                pc.network
                    .parse()
                    .map_err(|source| RegistryError::InvalidAddressRange {
                        peer: pc.name.clone(),
                        range: pc.network.clone(),
                        source,
                    })?;

            peers.push(Peer::new(
                PeerId::new(index),
                pc.name.clone(),
                network,
                Thresholds::new(up, down),
                webhook,
            ));
        }

        let registry = Self { peers };
        registry.warn_overlaps();
        Ok(registry)
    }

    /// Find the first peer whose network contains `addr`.
    pub fn find_peer_for(&self, addr: IpAddr) -> Option<&Peer> {
        self.peers.iter().find(|peer| peer.contains(&addr))
    }

    pub fn get(&self, id: PeerId) -> Option<&Peer> {
        self.peers.get(id.index())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Peer> {
        self.peers.iter()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Log every pair of peers whose networks overlap. Packets in the
    /// overlap always go to the earlier peer.
    fn warn_overlaps(&self) {
        for (i, earlier) in self.peers.iter().enumerate() {
            for later in &self.peers[i + 1..] {
                if overlaps(&earlier.network(), &later.network()) {
                    warn!(
                        "Network {} of peer {} overlaps network {} of peer {}; \
                         overlapping addresses are routed to {}",
                        earlier.network(),
                        earlier.name(),
                        later.network(),
                        later.name(),
                        earlier.name()
                    );
                }
            }
        }
    }
}

fn override_or(value: u32, global: u32) -> u32 {
    if value == 0 { global } else { value }
}

/// CIDR networks either nest or are disjoint.
fn overlaps(a: &IpNet, b: &IpNet) -> bool {
    a.contains(b) || b.contains(a)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;

    const HOOK_A: &str = "https://example.org/hook";
    const HOOK_B: &str = "https://example.com/hook";

    fn global_config(peers: Vec<PeerConfig>) -> Config {
        Config {
            up_threshold: 10,
            down_threshold: 11,
            monitor_cycle: "2s".to_string(),
            peer_timeout: "2s".to_string(),
            webhook: HOOK_A.to_string(),
            peers,
        }
    }

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    // ==================== Construction ====================

    #[test]
    fn test_no_peers() {
        let err = PeerRegistry::from_config(&Config::default()).unwrap_err();
        assert!(matches!(err, RegistryError::TooFewPeers));
    }

    #[test]
    fn test_invalid_network() {
        let config = global_config(vec![
            PeerConfig::new("good", "10.0.0.0/8"),
            PeerConfig::new("bad CIDR", "10.0.0.0/99"),
        ]);
        let err = PeerRegistry::from_config(&config).unwrap_err();
        assert!(matches!(
            err,
            RegistryError::InvalidAddressRange { ref peer, ref range, .. }
                if peer == "bad CIDR" && range == "10.0.0.0/99"
        ));
    }

    #[test]
    fn test_empty_network_is_invalid() {
        let config = global_config(vec![PeerConfig::new("empty", "")]);
        assert!(matches!(
            PeerRegistry::from_config(&config),
            Err(RegistryError::InvalidAddressRange { .. })
        ));
    }

    #[test]
    fn test_global_values() {
        let config = global_config(vec![
            PeerConfig::new("First", "192.168.1.0/24"),
            PeerConfig::new("Second", "192.168.2.0/24"),
        ]);
        let registry = PeerRegistry::from_config(&config).unwrap();

        assert_eq!(registry.len(), 2);
        for (i, peer) in registry.iter().enumerate() {
            assert_eq!(peer.id().index(), i);
            assert_eq!(peer.thresholds(), Thresholds::new(10, 11));
            assert_eq!(peer.webhook(), Some(&WebhookTarget::new(HOOK_A)));
            assert_eq!(peer.last_seen(), None);
        }
        assert_eq!(registry.iter().next().unwrap().name(), "First");
    }

    #[test]
    fn test_peer_overrides() {
        let config = global_config(vec![
            PeerConfig {
                down_threshold: 99,
                webhook: HOOK_B.to_string(),
                ..PeerConfig::new("First", "192.168.1.0/24")
            },
            PeerConfig {
                up_threshold: 128,
                ..PeerConfig::new("Second", "192.168.2.0/24")
            },
        ]);
        let registry = PeerRegistry::from_config(&config).unwrap();
        let peers: Vec<_> = registry.iter().collect();

        assert_eq!(peers[0].thresholds(), Thresholds::new(10, 99));
        assert_eq!(peers[0].webhook(), Some(&WebhookTarget::new(HOOK_B)));
        assert_eq!(peers[1].thresholds(), Thresholds::new(128, 11));
        assert_eq!(peers[1].webhook(), Some(&WebhookTarget::new(HOOK_A)));
    }

    #[test]
    fn test_no_webhook_anywhere() {
        let config = Config {
            webhook: String::new(),
            ..global_config(vec![PeerConfig::new("Quiet", "10.0.0.0/8")])
        };
        let registry = PeerRegistry::from_config(&config).unwrap();
        assert_eq!(registry.iter().next().unwrap().webhook(), None);
    }

    // ==================== Routing ====================

    #[test]
    fn test_first_match_wins() {
        let config = global_config(vec![
            PeerConfig::new("A", "10.0.0.0/24"),
            PeerConfig::new("B", "10.0.0.0/16"),
        ]);
        let registry = PeerRegistry::from_config(&config).unwrap();

        assert_eq!(registry.find_peer_for(addr("10.0.0.5")).unwrap().name(), "A");
        assert_eq!(registry.find_peer_for(addr("10.0.9.5")).unwrap().name(), "B");
    }

    #[test]
    fn test_unmatched_address() {
        let config = global_config(vec![PeerConfig::new("A", "10.0.0.0/24")]);
        let registry = PeerRegistry::from_config(&config).unwrap();
        assert!(registry.find_peer_for(addr("192.0.2.1")).is_none());
    }

    #[test]
    fn test_get_by_id() {
        let config = global_config(vec![
            PeerConfig::new("A", "10.0.0.0/24"),
            PeerConfig::new("B", "10.1.0.0/24"),
        ]);
        let registry = PeerRegistry::from_config(&config).unwrap();
        let b = registry.find_peer_for(addr("10.1.0.1")).unwrap();
        assert_eq!(registry.get(b.id()).unwrap().name(), "B");
    }

    #[test]
    fn test_overlaps() {
        let a: IpNet = "10.0.0.0/24".parse().unwrap();
        let b: IpNet = "10.0.0.0/16".parse().unwrap();
        let c: IpNet = "10.1.0.0/24".parse().unwrap();
        assert!(overlaps(&a, &b));
        assert!(overlaps(&b, &a));
        assert!(!overlaps(&a, &c));
    }
}
