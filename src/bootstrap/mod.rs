//! Bootstrap resolution: turns raw configuration into a concrete initial
//! cluster and an effective cluster token.
//!
//! Three mutually exclusive methods are supported: a static
//! `name=url,...` string, DNS-SRV discovery over a domain, and a
//! discovery-URL rendezvous.

pub mod discovery;
pub mod srv;

pub use discovery::{DiscoveryClient, DiscoveryError, DiscoveryResponse};
pub use srv::{SrvError, SrvRecord, SrvResolver, SystemSrvResolver};

use crate::cluster::{Cluster, ClusterError, Member};
use crate::config::BootstrapConfig;
use crate::types::Urls;
use slog::{info, Logger};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("exactly one of initial-cluster, dns-domain and discovery-url must be set")]
    AmbiguousBootstrap,

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Srv(#[from] SrvError),

    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
}

/// Resolves bootstrap configuration into a `(Cluster, token)` pair.
pub struct BootstrapResolver {
    srv: Arc<dyn SrvResolver>,
    discovery: DiscoveryClient,
    logger: Logger,
}

impl BootstrapResolver {
    /// Resolver using the system DNS configuration.
    pub fn new(logger: Logger) -> Result<BootstrapResolver, BootstrapError> {
        let srv = Arc::new(SystemSrvResolver::from_system_conf()?);
        Ok(BootstrapResolver::with_srv_resolver(srv, logger))
    }

    /// Resolver with an injected SRV implementation.
    pub fn with_srv_resolver(srv: Arc<dyn SrvResolver>, logger: Logger) -> BootstrapResolver {
        let discovery = DiscoveryClient::new(logger.clone());
        BootstrapResolver {
            srv,
            discovery,
            logger,
        }
    }

    /// Produces the initial cluster and the effective cluster token.
    pub async fn resolve(
        &self,
        cfg: &BootstrapConfig,
    ) -> Result<(Cluster, String), BootstrapError> {
        let methods_set = [
            cfg.initial_cluster.is_some(),
            cfg.dns_domain.is_some(),
            cfg.discovery_url.is_some(),
        ];
        if methods_set.iter().filter(|set| **set).count() != 1 {
            return Err(BootstrapError::AmbiguousBootstrap);
        }

        if let Some(initial) = &cfg.initial_cluster {
            let cluster = Cluster::new_from_string(&cfg.token, initial)?;
            info!(self.logger, "bootstrapped from static configuration";
                "cluster_id" => %cluster.id(),
            );
            return Ok((cluster, cfg.token.clone()));
        }

        if let Some(domain) = &cfg.dns_domain {
            let synthesized = srv::dns_cluster_string(
                &cfg.name,
                domain,
                self.srv.as_ref(),
                &cfg.advertised_peer_urls,
                &self.logger,
            )
            .await?;
            let cluster = Cluster::new_from_string(&cfg.token, &synthesized)?;
            info!(self.logger, "bootstrapped from DNS SRV records";
                "domain" => domain,
                "cluster_id" => %cluster.id(),
            );
            return Ok((cluster, cfg.token.clone()));
        }

        let durl = cfg
            .discovery_url
            .as_ref()
            .expect("one bootstrap method is set");
        // The discovery URL doubles as the cluster token, so two members
        // agreeing on it land in the same cluster id space.
        let me = Member::new(&cfg.name, cfg.advertised_peer_urls.clone(), durl, None);
        let peers = self.discovery.join_cluster(durl, &me).await?;
        let cluster = Cluster::new_from_string(durl, &peers)?;
        info!(self.logger, "bootstrapped from discovery service";
            "url" => durl,
            "cluster_id" => %cluster.id(),
        );
        Ok((cluster, durl.clone()))
    }
}

/// The `name=url,...` string advertising only ourselves, used on paths
/// where the rest of the cluster is not known yet.
pub fn gen_cluster_string(name: &str, urls: &Urls) -> String {
    urls.string_slice()
        .into_iter()
        .map(|u| format!("{}={}", name, u))
        .collect::<Vec<_>>()
        .join(",")
}
