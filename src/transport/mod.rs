//! Peer transport: a registry of remote peers, one pipeline sender per
//! peer, and the HTTP endpoints raft messages arrive on.

pub mod error;
pub mod handler;
pub mod pipeline;
pub mod raft;
pub(crate) mod urlpick;

pub use error::TransportError;
pub use handler::{MemberInfo, PeerHandler};
pub use pipeline::{HttpRoundTripper, PeerRequest, PeerResponse, RoundTripper};
pub use raft::{ProcessError, Raft};

use crate::cluster::Cluster;
use crate::config::TransportConfig;
use crate::stats::{LeaderStats, ServerStats};
use crate::transport::pipeline::Pipeline;
use crate::transport::urlpick::UrlPicker;
use crate::types::{Id, Urls};
use protobuf::Message as PbMessage;
use ::raft::eraftpb::{Message, MessageType};
use slog::{info, o, Logger};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::mpsc;

/// Path remote peers post raft messages to.
pub const RAFT_PREFIX: &str = "/raft";

/// The transport hub.
///
/// Owns the id→sender map exclusively; membership changes arrive as
/// `add_peer`/`remove_peer`/`update_peer` calls from the owning server's
/// apply loop. The peer-map lock is held only across map operations, never
/// across a send or an HTTP call.
pub struct Transport {
    cfg: TransportConfig,
    round_tripper: Arc<dyn RoundTripper>,
    raft_node: Arc<dyn Raft>,
    server_stats: Arc<ServerStats>,
    leader_stats: Arc<LeaderStats>,
    error_tx: mpsc::Sender<TransportError>,
    peers: RwLock<HashMap<Id, Arc<Pipeline>>>,
    logger: Logger,
}

impl Transport {
    /// Creates a transport posting over HTTP. The returned receiver is the
    /// hub's error channel: the first fatal transport error lands there and
    /// the owning server is expected to shut down on receipt.
    pub fn new(
        cfg: TransportConfig,
        raft_node: Arc<dyn Raft>,
        server_stats: Arc<ServerStats>,
        leader_stats: Arc<LeaderStats>,
        logger: Logger,
    ) -> (Transport, mpsc::Receiver<TransportError>) {
        let round_tripper = Arc::new(HttpRoundTripper::new(cfg.request_timeout()));
        Transport::with_round_tripper(cfg, round_tripper, raft_node, server_stats, leader_stats, logger)
    }

    /// Same as [`Transport::new`] with an injected round-tripper. Tests
    /// gate or record peer traffic this way.
    pub fn with_round_tripper(
        cfg: TransportConfig,
        round_tripper: Arc<dyn RoundTripper>,
        raft_node: Arc<dyn Raft>,
        server_stats: Arc<ServerStats>,
        leader_stats: Arc<LeaderStats>,
        logger: Logger,
    ) -> (Transport, mpsc::Receiver<TransportError>) {
        let (error_tx, error_rx) = mpsc::channel(1);
        let t = Transport {
            cfg,
            round_tripper,
            raft_node,
            server_stats,
            leader_stats,
            error_tx,
            peers: RwLock::new(HashMap::new()),
            logger,
        };
        (t, error_rx)
    }

    /// The router serving this transport's peer endpoints.
    pub fn handler(&self, cluster: Arc<RwLock<Cluster>>) -> axum::Router {
        PeerHandler::new(
            self.raft_node.clone(),
            cluster,
            self.cfg.cluster_id,
            self.server_stats.clone(),
            self.cfg.max_request_bytes,
            self.logger.clone(),
        )
        .into_router()
    }

    /// Dispatches outbound messages by destination id.
    ///
    /// A zero destination is an intentional drop. An unknown destination is
    /// dropped too: Raft may still reference a peer the apply loop just
    /// removed, which is not an error.
    pub fn send(&self, msgs: Vec<Message>) {
        for m in msgs {
            if m.to == 0 {
                continue;
            }
            let to = Id(m.to);
            let peer = {
                let peers = self.peers.read().expect("peer map lock poisoned");
                peers.get(&to).cloned()
            };
            let Some(peer) = peer else {
                info!(self.logger, "ignoring message to unknown peer"; "to" => %to);
                continue;
            };
            if m.get_msg_type() == MessageType::MsgAppend {
                self.server_stats.send_append_req(m.compute_size() as usize);
            }
            peer.send(m);
        }
    }

    /// Starts a sender for `id`. Adding self or an already-known peer is a
    /// no-op.
    pub fn add_peer(&self, id: Id, urls: Urls) {
        if id == self.cfg.id {
            return;
        }
        let mut peers = self.peers.write().expect("peer map lock poisoned");
        if peers.contains_key(&id) {
            return;
        }
        let picker = Arc::new(UrlPicker::new(urls));
        let fs = self.leader_stats.follower(id);
        let pipeline = Pipeline::new(
            id,
            self.cfg.cluster_id,
            self.cfg.server_version.clone(),
            self.round_tripper.clone(),
            picker,
            fs,
            self.raft_node.clone(),
            self.error_tx.clone(),
            self.logger.new(o!("peer" => id.to_string())),
        );
        peers.insert(id, Arc::new(pipeline));
        info!(self.logger, "added peer"; "id" => %id);
    }

    /// Starts one sender per cluster member, excluding self.
    pub fn add_cluster_peers(&self, cluster: &Cluster) {
        for m in cluster.members() {
            self.add_peer(m.id(), m.peer_urls().clone());
        }
    }

    /// Stops and forgets the sender for `id`. Removing an unknown peer is
    /// a caller contract violation and panics; removing self is a no-op.
    pub async fn remove_peer(&self, id: Id) {
        if id == self.cfg.id {
            return;
        }
        let removed = {
            let mut peers = self.peers.write().expect("peer map lock poisoned");
            peers.remove(&id)
        };
        let Some(peer) = removed else {
            panic!("unexpected removal of unknown peer {}", id);
        };
        peer.stop().await;
        self.leader_stats.remove(id);
        info!(self.logger, "removed peer"; "id" => %id);
    }

    pub async fn remove_all_peers(&self) {
        let drained: Vec<(Id, Arc<Pipeline>)> = {
            let mut peers = self.peers.write().expect("peer map lock poisoned");
            peers.drain().collect()
        };
        for (id, peer) in drained {
            peer.stop().await;
            self.leader_stats.remove(id);
        }
    }

    /// Replaces the advertised URLs of a known peer; its workers keep
    /// running. Updating self or an unknown peer is a no-op.
    pub fn update_peer(&self, id: Id, urls: Urls) {
        if id == self.cfg.id {
            return;
        }
        let peer = {
            let peers = self.peers.read().expect("peer map lock poisoned");
            peers.get(&id).cloned()
        };
        if let Some(peer) = peer {
            peer.update(urls);
        }
    }

    /// Ids with an active sender.
    pub fn peer_ids(&self) -> Vec<Id> {
        let peers = self.peers.read().expect("peer map lock poisoned");
        let mut ids: Vec<Id> = peers.keys().copied().collect();
        ids.sort();
        ids
    }

    /// Stops every sender and drops the registry.
    pub async fn stop(&self) {
        self.remove_all_peers().await;
        info!(self.logger, "transport stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::raft::ProcessError;
    use async_trait::async_trait;
    use protobuf::Message as PbMessage;
    use ::raft::SnapshotStatus;
    use slog::Drain;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn test_logger() -> Logger {
        let decorator = slog_term::PlainDecorator::new(std::io::stdout());
        let drain = slog_term::FullFormat::new(decorator).build().fuse();
        let drain = slog_async::Async::new(drain).build().fuse();
        Logger::root(drain, o!())
    }

    fn urls(list: &[&str]) -> Urls {
        Urls::parse(list).unwrap()
    }

    #[derive(Default)]
    struct FakeRaft {
        unreachable: AtomicU64,
    }

    #[async_trait]
    impl Raft for FakeRaft {
        async fn process(&self, _msg: Message) -> Result<(), ProcessError> {
            Ok(())
        }

        fn report_unreachable(&self, _id: u64) {
            self.unreachable.fetch_add(1, Ordering::Relaxed);
        }

        fn report_snapshot(&self, _id: u64, _status: SnapshotStatus) {}
    }

    struct RecordingRoundTripper {
        requests: StdMutex<Vec<PeerRequest>>,
    }

    impl RecordingRoundTripper {
        fn new() -> RecordingRoundTripper {
            RecordingRoundTripper {
                requests: StdMutex::new(Vec::new()),
            }
        }

        fn count(&self) -> usize {
            self.requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl RoundTripper for RecordingRoundTripper {
        async fn round_trip(&self, req: PeerRequest) -> Result<PeerResponse, TransportError> {
            self.requests.lock().unwrap().push(req);
            Ok(PeerResponse {
                status: 204,
                location: None,
            })
        }
    }

    fn new_transport(
        rt: Arc<dyn RoundTripper>,
    ) -> (Transport, mpsc::Receiver<TransportError>, Arc<ServerStats>) {
        let cfg = TransportConfig::new(Id(1), Id(1));
        let stats = Arc::new(ServerStats::new());
        let (t, rx) = Transport::with_round_tripper(
            cfg,
            rt,
            Arc::new(FakeRaft::default()),
            stats.clone(),
            Arc::new(LeaderStats::new(Id(1))),
            test_logger(),
        );
        (t, rx, stats)
    }

    #[tokio::test]
    async fn test_add_peer_is_idempotent() {
        let (t, _rx, _stats) = new_transport(Arc::new(RecordingRoundTripper::new()));

        t.add_peer(Id(2), urls(&["http://10.0.0.2:2380"]));
        t.add_peer(Id(2), urls(&["http://10.0.0.2:2380"]));

        assert_eq!(t.peer_ids(), vec![Id(2)]);
        t.stop().await;
    }

    #[tokio::test]
    async fn test_add_peer_skips_self() {
        let (t, _rx, _stats) = new_transport(Arc::new(RecordingRoundTripper::new()));

        t.add_peer(Id(1), urls(&["http://10.0.0.1:2380"]));
        assert!(t.peer_ids().is_empty());
        t.stop().await;
    }

    #[tokio::test]
    async fn test_send_to_unknown_peer_is_dropped() {
        let (t, _rx, _stats) = new_transport(Arc::new(RecordingRoundTripper::new()));

        let mut m = Message::default();
        m.to = 7;
        t.send(vec![m]);

        let mut zero = Message::default();
        zero.to = 0;
        t.send(vec![zero]);
        t.stop().await;
    }

    #[tokio::test]
    async fn test_send_counts_append_bytes_and_posts() {
        let rt = Arc::new(RecordingRoundTripper::new());
        let (t, _rx, stats) = new_transport(rt.clone());
        t.add_peer(Id(2), urls(&["http://10.0.0.2:2380"]));

        let mut m = Message::default();
        m.set_msg_type(MessageType::MsgAppend);
        m.to = 2;
        m.from = 1;
        let size = m.compute_size() as u64;
        t.send(vec![m]);

        for _ in 0..500 {
            if rt.count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(rt.count(), 1);
        assert_eq!(stats.send_append_count(), 1);
        assert_eq!(stats.send_append_bytes(), size);
        t.stop().await;
    }

    #[tokio::test]
    async fn test_remove_peer_stops_sender() {
        let rt = Arc::new(RecordingRoundTripper::new());
        let (t, _rx, _stats) = new_transport(rt.clone());
        t.add_peer(Id(2), urls(&["http://10.0.0.2:2380"]));

        t.remove_peer(Id(2)).await;
        assert!(t.peer_ids().is_empty());

        // Messages to the removed peer are dropped silently.
        let mut m = Message::default();
        m.to = 2;
        t.send(vec![m]);
        assert_eq!(rt.count(), 0);
        t.stop().await;
    }

    #[tokio::test]
    #[should_panic(expected = "unexpected removal of unknown peer")]
    async fn test_remove_unknown_peer_panics() {
        let (t, _rx, _stats) = new_transport(Arc::new(RecordingRoundTripper::new()));
        t.remove_peer(Id(9)).await;
    }

    #[tokio::test]
    async fn test_update_peer_replaces_urls() {
        let rt = Arc::new(RecordingRoundTripper::new());
        let (t, _rx, _stats) = new_transport(rt.clone());
        t.add_peer(Id(2), urls(&["http://10.0.0.2:2380"]));

        t.update_peer(Id(2), urls(&["http://10.0.0.9:2380"]));
        // Unknown and self updates are no-ops.
        t.update_peer(Id(3), urls(&["http://10.0.0.3:2380"]));
        t.update_peer(Id(1), urls(&["http://10.0.0.1:2380"]));

        let mut m = Message::default();
        m.to = 2;
        t.send(vec![m]);
        for _ in 0..500 {
            if rt.count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        {
            let reqs = rt.requests.lock().unwrap();
            assert_eq!(reqs.len(), 1);
            assert_eq!(reqs[0].url.as_str(), "http://10.0.0.9:2380/raft");
        }
        t.stop().await;
    }

    #[tokio::test]
    async fn test_add_cluster_peers_excludes_self() {
        let cluster = Cluster::new_from_string(
            "etcd",
            "n1=http://10.0.0.1:2380,n2=http://10.0.0.2:2380,n3=http://10.0.0.3:2380",
        )
        .unwrap();
        let self_id = cluster.member_by_name("n1").unwrap().id();

        let cfg = TransportConfig::new(self_id, cluster.id());
        let (t, _rx) = Transport::with_round_tripper(
            cfg,
            Arc::new(RecordingRoundTripper::new()),
            Arc::new(FakeRaft::default()),
            Arc::new(ServerStats::new()),
            Arc::new(LeaderStats::new(self_id)),
            test_logger(),
        );
        t.add_cluster_peers(&cluster);
        assert_eq!(t.peer_ids().len(), 2);
        assert!(!t.peer_ids().contains(&self_id));

        t.stop().await;
    }
}
