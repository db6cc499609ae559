//! Topology sources.
//!
//! The area topology can come from a static environment literal (test rigs,
//! single-segment deployments) or from the light-discovery table a leader
//! accumulates from beacon replies. Consumers — backup selection, reelection,
//! policy distribution — depend only on [`TopologyProvider`] and never learn
//! which source is behind it.

use std::sync::Arc;

use crate::discovery::LightDiscovery;

/// A node of the area as seen by the leader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub device_id: String,
    pub device_ip: String,
}

pub trait TopologyProvider: Send + Sync {
    /// Known peers, in a stable iteration order.
    fn topology(&self) -> Vec<Endpoint>;

    /// Address of the leader currently observed on the segment, when the
    /// source can tell. Used by a waiting backup to detect that another
    /// backup has already taken over.
    fn disc_leader_ip(&self) -> Option<String>;
}

// ────────────────────────────────────────────────────────────────────────────
// Static (environment literal) source
// ────────────────────────────────────────────────────────────────────────────

pub struct EnvTopology {
    entries: Vec<Endpoint>,
}

impl EnvTopology {
    pub fn new(pairs: &[(String, String)]) -> Self {
        EnvTopology {
            entries: pairs
                .iter()
                .map(|(id, ip)| Endpoint { device_id: id.clone(), device_ip: ip.clone() })
                .collect(),
        }
    }
}

impl TopologyProvider for EnvTopology {
    fn topology(&self) -> Vec<Endpoint> {
        self.entries.clone()
    }

    fn disc_leader_ip(&self) -> Option<String> {
        // A static literal has no live view of the segment.
        None
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Light-discovery backed source
// ────────────────────────────────────────────────────────────────────────────

pub struct DiscoveryTopology {
    discovery: Arc<LightDiscovery>,
}

impl DiscoveryTopology {
    pub fn new(discovery: Arc<LightDiscovery>) -> Self {
        DiscoveryTopology { discovery }
    }
}

impl TopologyProvider for DiscoveryTopology {
    fn topology(&self) -> Vec<Endpoint> {
        self.discovery
            .entries()
            .into_iter()
            .map(|d| Endpoint { device_id: d.device_id, device_ip: d.device_ip })
            .collect()
    }

    fn disc_leader_ip(&self) -> Option<String> {
        self.discovery.detected_leader().map(|(_, ip)| ip)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_topology_preserves_order() {
        let provider = EnvTopology::new(&[
            ("agent/B".to_string(), "10.0.0.2".to_string()),
            ("agent/A".to_string(), "10.0.0.1".to_string()),
        ]);
        let topo = provider.topology();
        assert_eq!(topo.len(), 2);
        assert_eq!(topo[0].device_id, "agent/B");
        assert_eq!(topo[1].device_ip, "10.0.0.1");
        assert_eq!(provider.disc_leader_ip(), None);
    }

    #[test]
    fn empty_env_topology_is_empty() {
        let provider = EnvTopology::new(&[]);
        assert!(provider.topology().is_empty());
    }
}
