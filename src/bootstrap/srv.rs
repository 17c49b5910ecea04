//! DNS-SRV cluster synthesis.

use crate::types::Urls;
use async_trait::async_trait;
use hickory_resolver::TokioAsyncResolver;
use slog::{info, warn, Logger};
use thiserror::Error;
use tokio::net::lookup_host;

/// SRV services queried for peer discovery, with the URL scheme each one
/// implies. The SSL service is queried first so it wins a self tie.
const SRV_SERVICES: [(&str, &str); 2] = [
    ("_etcd-server-ssl._tcp.", "https://"),
    ("_etcd-server._tcp.", "http://"),
];

#[derive(Debug, Error)]
pub enum SrvError {
    #[error("SRV query {query:?} failed: {reason}")]
    Query { query: String, reason: String },

    #[error("cannot resolve host {host:?}: {reason}")]
    Resolve { host: String, reason: String },

    #[error("all SRV queries for domain {domain:?} failed")]
    AllQueriesFailed { domain: String },

    #[error("cannot initialize system resolver: {reason}")]
    Init { reason: String },
}

/// One SRV answer, reduced to what bootstrap needs. Priority and weight
/// are dropped at this seam.
#[derive(Clone, Debug)]
pub struct SrvRecord {
    pub target: String,
    pub port: u16,
}

/// SRV lookups, injected so tests and alternative resolvers can stand in
/// for the system one.
///
/// Answer order is preserved downstream; a resolver that wants weighted
/// ordering can sort its answers before returning them.
#[async_trait]
pub trait SrvResolver: Send + Sync {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, SrvError>;
}

/// SRV resolver backed by the system DNS configuration.
pub struct SystemSrvResolver {
    inner: TokioAsyncResolver,
}

impl SystemSrvResolver {
    pub fn from_system_conf() -> Result<SystemSrvResolver, SrvError> {
        let inner = TokioAsyncResolver::tokio_from_system_conf().map_err(|e| SrvError::Init {
            reason: e.to_string(),
        })?;
        Ok(SystemSrvResolver { inner })
    }
}

#[async_trait]
impl SrvResolver for SystemSrvResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, SrvError> {
        let lookup = self
            .inner
            .srv_lookup(name)
            .await
            .map_err(|e| SrvError::Query {
                query: name.to_string(),
                reason: e.to_string(),
            })?;
        Ok(lookup
            .iter()
            .map(|srv| SrvRecord {
                target: srv.target().to_utf8().trim_end_matches('.').to_string(),
                port: srv.port(),
            })
            .collect())
    }
}

/// Resolves `host:port` to its first socket address.
async fn resolve_addr(host: &str) -> Result<String, SrvError> {
    let mut addrs = lookup_host(host).await.map_err(|e| SrvError::Resolve {
        host: host.to_string(),
        reason: e.to_string(),
    })?;
    match addrs.next() {
        Some(a) => Ok(a.to_string()),
        None => Err(SrvError::Resolve {
            host: host.to_string(),
            reason: "no addresses".to_string(),
        }),
    }
}

/// Synthesizes an initial-cluster string from the SRV records of `domain`.
///
/// Discovered addresses matching one of our resolved advertised peer URLs
/// are labeled with `name` and emitted once (the SSL pass wins a tie);
/// everything else is labeled with a counter starting at 0. One failing
/// SRV query is tolerated; two fail the bootstrap.
pub(crate) async fn dns_cluster_string(
    name: &str,
    domain: &str,
    resolver: &dyn SrvResolver,
    advertised_peer_urls: &Urls,
    logger: &Logger,
) -> Result<String, SrvError> {
    // Resolve the advertised URLs first so self is recognized by address,
    // not by name.
    let mut self_addrs = Vec::new();
    for host in advertised_peer_urls.hosts() {
        self_addrs.push(resolve_addr(&host).await?);
    }

    let mut parts: Vec<String> = Vec::new();
    let mut temp_name = 0usize;
    let mut self_emitted: Vec<String> = Vec::new();
    let mut fail_count = 0;
    let mut last_err: Option<SrvError> = None;

    for (service, prefix) in SRV_SERVICES {
        let query = format!("{}{}", service, domain);
        let records = match resolver.lookup_srv(&query).await {
            Ok(r) => r,
            Err(e) => {
                warn!(logger, "SRV query failed"; "query" => &query, "error" => %e);
                fail_count += 1;
                last_err = Some(e);
                continue;
            }
        };
        for rec in records {
            let host = format!("{}:{}", rec.target, rec.port);
            let addr = match resolve_addr(&host).await {
                Ok(a) => a,
                Err(e) => {
                    warn!(logger, "cannot resolve SRV target"; "host" => &host, "error" => %e);
                    continue;
                }
            };
            let label = if self_addrs.contains(&addr) {
                if self_emitted.contains(&addr) {
                    continue;
                }
                self_emitted.push(addr.clone());
                name.to_string()
            } else {
                let label = temp_name.to_string();
                temp_name += 1;
                label
            };
            info!(logger, "got bootstrap entry from DNS";
                "query" => &query,
                "entry" => format!("{}={}{}", label, prefix, addr),
            );
            parts.push(format!("{}={}{}", label, prefix, addr));
        }
    }

    if fail_count == SRV_SERVICES.len() {
        warn!(logger, "too many errors querying DNS SRV records; failing discovery";
            "domain" => domain,
        );
        return Err(last_err.unwrap_or(SrvError::AllQueriesFailed {
            domain: domain.to_string(),
        }));
    }
    Ok(parts.join(","))
}
