//! Discovery rendezvous bootstrap against a local fake service.

use async_trait::async_trait;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, put};
use axum::{Json, Router};
use raftnet::bootstrap::{
    BootstrapError, BootstrapResolver, DiscoveryError, DiscoveryResponse, SrvError, SrvRecord,
    SrvResolver,
};
use raftnet::{BootstrapConfig, Urls};
use slog::{o, Drain, Logger};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

fn test_logger() -> Logger {
    let decorator = slog_term::PlainDecorator::new(std::io::stdout());
    let drain = slog_term::FullFormat::new(decorator).build().fuse();
    let drain = slog_async::Async::new(drain).build().fuse();
    Logger::root(drain, o!())
}

/// Resolver that must not be reached on the discovery path.
struct PanickingSrvResolver;

#[async_trait]
impl SrvResolver for PanickingSrvResolver {
    async fn lookup_srv(&self, name: &str) -> Result<Vec<SrvRecord>, SrvError> {
        panic!("unexpected SRV lookup for {}", name);
    }
}

/// Minimal rendezvous service: PUT registers, GET returns the state.
struct FakeDiscovery {
    size: usize,
    reject_registrations: bool,
    registered: Mutex<Vec<(String, Vec<String>)>>,
}

impl FakeDiscovery {
    fn seeded(size: usize, entries: &[(&str, &str)]) -> FakeDiscovery {
        FakeDiscovery {
            size,
            reject_registrations: false,
            registered: Mutex::new(
                entries
                    .iter()
                    .map(|(id, entry)| (id.to_string(), vec![entry.to_string()]))
                    .collect(),
            ),
        }
    }
}

async fn handle_register(
    State(disco): State<Arc<FakeDiscovery>>,
    Path(id): Path<String>,
    Query(params): Query<HashMap<String, String>>,
) -> StatusCode {
    let mut registered = disco.registered.lock().unwrap();
    if disco.reject_registrations || registered.iter().any(|(known, _)| known == &id) {
        return StatusCode::CONFLICT;
    }
    let name = params.get("name").cloned().unwrap_or_default();
    let urls = params.get("peerURLs").cloned().unwrap_or_default();
    let entries = urls
        .split(',')
        .map(|u| format!("{}={}", name, u))
        .collect();
    registered.push((id, entries));
    StatusCode::OK
}

async fn handle_state(State(disco): State<Arc<FakeDiscovery>>) -> Json<DiscoveryResponse> {
    let registered = disco.registered.lock().unwrap();
    Json(DiscoveryResponse {
        size: disco.size,
        entries: registered.iter().flat_map(|(_, e)| e.clone()).collect(),
    })
}

async fn serve_discovery(disco: Arc<FakeDiscovery>) -> SocketAddr {
    let app = Router::new()
        .route("/", get(handle_state))
        .route("/:id", put(handle_register))
        .with_state(disco);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn discovery_config(durl: String) -> BootstrapConfig {
    BootstrapConfig::new_discovery(
        "n1".to_string(),
        Urls::parse(["http://10.0.0.1:2380"]).unwrap(),
        durl,
    )
}

fn resolver() -> BootstrapResolver {
    BootstrapResolver::with_srv_resolver(Arc::new(PanickingSrvResolver), test_logger())
}

#[tokio::test]
async fn test_discovery_bootstrap_joins_rendezvous() {
    let disco = Arc::new(FakeDiscovery::seeded(
        3,
        &[("seed0", "n0=http://10.0.0.9:2380")],
    ));
    let addr = serve_discovery(disco.clone()).await;
    let durl = format!("http://{}", addr);

    let (cluster, token) = resolver()
        .resolve(&discovery_config(durl.clone()))
        .await
        .unwrap();

    // The discovery URL became the cluster token.
    assert_eq!(token, durl);
    assert_eq!(cluster.name(), durl);

    // Both the seeded peer and ourselves are members now.
    assert_eq!(cluster.members().len(), 2);
    assert!(cluster.member_by_name("n0").is_some());
    let me = cluster.member_by_name("n1").unwrap();
    assert_eq!(me.peer_urls().string_slice(), vec!["http://10.0.0.1:2380"]);

    // Registration landed on the service.
    assert_eq!(disco.registered.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_discovery_bootstrap_full_cluster() {
    let disco = Arc::new(FakeDiscovery::seeded(
        1,
        &[("seed0", "n0=http://10.0.0.9:2380")],
    ));
    let addr = serve_discovery(disco).await;

    let err = resolver()
        .resolve(&discovery_config(format!("http://{}", addr)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Discovery(DiscoveryError::FullCluster { .. })
    ));
}

#[tokio::test]
async fn test_discovery_bootstrap_duplicate_registration() {
    let disco = Arc::new(FakeDiscovery {
        size: 3,
        reject_registrations: true,
        registered: Mutex::new(Vec::new()),
    });
    let addr = serve_discovery(disco).await;

    let err = resolver()
        .resolve(&discovery_config(format!("http://{}", addr)))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        BootstrapError::Discovery(DiscoveryError::DuplicateId { .. })
    ));
}
