//! Discovery-URL rendezvous bootstrap.

use crate::cluster::Member;
use serde::{Deserialize, Serialize};
use slog::{info, Logger};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The rendezvous already holds a full cluster and we are not part of
    /// it. Callers may fall back to another mode (e.g. proxying).
    #[error("discovery cluster at {url:?} is already full")]
    FullCluster { url: String },

    /// A member with our id has registered before. Usually means the local
    /// data directory was lost after a previous registration.
    #[error("member has previously registered with the discovery service at {url:?}")]
    DuplicateId { url: String },

    #[error("discovery request to {url:?} failed: {reason}")]
    Http { url: String, reason: String },

    #[error("discovery response from {url:?} is malformed: {reason}")]
    BadResponse { url: String, reason: String },
}

/// Rendezvous state returned by the discovery service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    /// Cluster size the rendezvous was created with.
    pub size: usize,
    /// Registered `name=url` entries, in registration order.
    pub entries: Vec<String>,
}

/// Client for the discovery rendezvous service.
///
/// The one HTTP client in the transport that follows redirects: discovery
/// services commonly bounce requests to a canonical endpoint.
pub struct DiscoveryClient {
    client: reqwest::Client,
    logger: Logger,
}

impl DiscoveryClient {
    pub fn new(logger: Logger) -> DiscoveryClient {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(5))
            .build()
            .expect("failed to create HTTP client");
        DiscoveryClient { client, logger }
    }

    /// Registers `member` under the discovery URL and returns the full
    /// rendezvous state as an initial-cluster string.
    pub async fn join_cluster(
        &self,
        durl: &str,
        member: &Member,
    ) -> Result<String, DiscoveryError> {
        let base = durl.trim_end_matches('/');
        let register_url = format!("{}/{}", base, member.id().padded_hex());

        let resp = self
            .client
            .put(&register_url)
            .query(&[
                ("name", member.name().to_string()),
                ("peerURLs", member.peer_urls().to_string()),
            ])
            .send()
            .await
            .map_err(|e| DiscoveryError::Http {
                url: register_url.clone(),
                reason: e.to_string(),
            })?;
        if resp.status().as_u16() == 409 {
            return Err(DiscoveryError::DuplicateId {
                url: durl.to_string(),
            });
        }
        if !resp.status().is_success() {
            return Err(DiscoveryError::Http {
                url: register_url,
                reason: format!("unexpected status {}", resp.status()),
            });
        }

        let state: DiscoveryResponse = self
            .client
            .get(base)
            .send()
            .await
            .map_err(|e| DiscoveryError::Http {
                url: durl.to_string(),
                reason: e.to_string(),
            })?
            .json()
            .await
            .map_err(|e| DiscoveryError::BadResponse {
                url: durl.to_string(),
                reason: e.to_string(),
            })?;

        info!(self.logger, "fetched discovery state";
            "url" => durl,
            "size" => state.size,
            "entries" => state.entries.len(),
        );
        check_cluster_slot(&state, member.name(), durl)?;
        Ok(state.entries.join(","))
    }
}

/// Fails with `FullCluster` when `self_name` is not among the first `size`
/// distinct names of the rendezvous state.
pub(crate) fn check_cluster_slot(
    state: &DiscoveryResponse,
    self_name: &str,
    durl: &str,
) -> Result<(), DiscoveryError> {
    let mut names: Vec<&str> = Vec::new();
    for entry in &state.entries {
        let name = entry.split('=').next().unwrap_or("");
        if !names.contains(&name) {
            names.push(name);
        }
    }
    match names.iter().position(|n| *n == self_name) {
        Some(pos) if pos < state.size => Ok(()),
        _ => Err(DiscoveryError::FullCluster {
            url: durl.to_string(),
        }),
    }
}
