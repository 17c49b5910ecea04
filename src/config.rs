//! Configuration for cluster bootstrap and the peer transport.

use crate::types::{Id, Urls};
use std::time::Duration;

/// How long a peer is given to produce response headers once a connection
/// is established.
pub const RESPONSE_HEADER_TIMEOUT: Duration = Duration::from_secs(5);

/// Inputs of the bootstrap resolver.
///
/// Exactly one of `initial_cluster`, `dns_domain` and `discovery_url` must
/// be set; the resolver rejects anything else.
pub struct BootstrapConfig {
    /// This member's human-readable name.
    pub name: String,

    /// Peer URLs this member advertises to the rest of the cluster.
    pub advertised_peer_urls: Urls,

    /// Cluster token salting id derivation. Ignored on the discovery-URL
    /// path, where the discovery URL itself becomes the token.
    pub token: String,

    /// Static `name=url,...` bootstrap string.
    pub initial_cluster: Option<String>,

    /// Domain for DNS-SRV discovery.
    pub dns_domain: Option<String>,

    /// Rendezvous service URL for discovery bootstrap.
    pub discovery_url: Option<String>,
}

impl BootstrapConfig {
    /// Configuration for a statically configured cluster.
    pub fn new_static(
        name: String,
        advertised_peer_urls: Urls,
        token: String,
        initial_cluster: String,
    ) -> Self {
        Self {
            name,
            advertised_peer_urls,
            token,
            initial_cluster: Some(initial_cluster),
            dns_domain: None,
            discovery_url: None,
        }
    }

    /// Configuration for DNS-SRV discovery over `domain`.
    pub fn new_dns(name: String, advertised_peer_urls: Urls, token: String, domain: String) -> Self {
        Self {
            name,
            advertised_peer_urls,
            token,
            initial_cluster: None,
            dns_domain: Some(domain),
            discovery_url: None,
        }
    }

    /// Configuration for discovery-URL rendezvous bootstrap.
    pub fn new_discovery(name: String, advertised_peer_urls: Urls, discovery_url: String) -> Self {
        Self {
            name,
            advertised_peer_urls,
            token: String::new(),
            initial_cluster: None,
            dns_domain: None,
            discovery_url: Some(discovery_url),
        }
    }
}

/// Configuration of the peer transport hub.
#[derive(Clone, Debug)]
pub struct TransportConfig {
    /// This member's id; messages addressed to it are never sent out.
    pub id: Id,

    /// Local cluster id, stamped on every outbound request and checked on
    /// every inbound one.
    pub cluster_id: Id,

    /// Raft heartbeat interval, used to size the dial timeout.
    pub heartbeat_interval: Duration,

    /// Raft election timeout, used to size the dial timeout.
    pub election_timeout: Duration,

    /// Build version advertised to peers, if any.
    pub server_version: Option<String>,

    /// Upper bound on an inbound raft message body.
    pub max_request_bytes: usize,
}

impl TransportConfig {
    pub fn new(id: Id, cluster_id: Id) -> Self {
        Self {
            id,
            cluster_id,
            heartbeat_interval: Duration::from_millis(100),
            election_timeout: Duration::from_millis(1000),
            server_version: None,
            max_request_bytes: 64 * 1024 * 1024,
        }
    }

    pub fn with_raft_timing(mut self, heartbeat: Duration, election: Duration) -> Self {
        self.heartbeat_interval = heartbeat;
        self.election_timeout = election;
        self
    }

    pub fn with_server_version(mut self, version: String) -> Self {
        self.server_version = Some(version);
        self
    }

    pub fn with_max_request_bytes(mut self, max: usize) -> Self {
        self.max_request_bytes = max;
        self
    }

    /// Time allowed to reach a peer: generous enough to survive an
    /// election on the other side.
    pub fn dial_timeout(&self) -> Duration {
        3 * self.heartbeat_interval + self.election_timeout
    }

    /// Per-request deadline for an outbound post.
    pub fn request_timeout(&self) -> Duration {
        self.dial_timeout() + RESPONSE_HEADER_TIMEOUT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dial_timeout_tracks_raft_timing() {
        let cfg = TransportConfig::new(Id(1), Id(1)).with_raft_timing(
            Duration::from_millis(100),
            Duration::from_millis(1000),
        );
        assert_eq!(cfg.dial_timeout(), Duration::from_millis(1300));
        assert_eq!(
            cfg.request_timeout(),
            Duration::from_millis(1300) + RESPONSE_HEADER_TIMEOUT
        );
    }
}
