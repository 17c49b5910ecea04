//! HTTP endpoints the transport exposes to remote peers.
//!
//! `POST /raft` receives serialized raft messages, `GET /version` serves
//! the membership schema version for pre-join compatibility checks, and
//! `GET /members` serves the cluster view for join-time synchronization.

use crate::cluster::{Cluster, STORE_VERSION};
use crate::stats::ServerStats;
use crate::transport::raft::{ProcessError, Raft};
use crate::transport::RAFT_PREFIX;
use crate::types::Id;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use protobuf::Message as PbMessage;
use ::raft::eraftpb::{Message, MessageType};
use serde::Serialize;
use slog::{debug, warn, Logger};
use std::sync::{Arc, RwLock};

pub(crate) const CLUSTER_ID_HEADER: &str = "x-etcd-cluster-id";

/// JSON view of one member, as served on `GET /members`.
#[derive(Debug, Serialize)]
pub struct MemberInfo {
    pub id: String,
    pub name: String,
    #[serde(rename = "peerURLs")]
    pub peer_urls: Vec<String>,
    #[serde(rename = "clientURLs")]
    pub client_urls: Vec<String>,
}

/// Shared state behind the peer-facing endpoints.
#[derive(Clone)]
pub struct PeerHandler {
    raft: Arc<dyn Raft>,
    cluster: Arc<RwLock<Cluster>>,
    cluster_id: Id,
    server_stats: Arc<ServerStats>,
    max_request_bytes: usize,
    logger: Logger,
}

impl PeerHandler {
    pub fn new(
        raft: Arc<dyn Raft>,
        cluster: Arc<RwLock<Cluster>>,
        cluster_id: Id,
        server_stats: Arc<ServerStats>,
        max_request_bytes: usize,
        logger: Logger,
    ) -> PeerHandler {
        PeerHandler {
            raft,
            cluster,
            cluster_id,
            server_stats,
            max_request_bytes,
            logger,
        }
    }

    /// The router serving the peer endpoints. Non-POST requests to the
    /// raft endpoint are answered with 405 by the method router.
    pub fn into_router(self) -> Router {
        let limit = self.max_request_bytes;
        Router::new()
            .route(RAFT_PREFIX, post(handle_raft))
            .route("/version", get(handle_version))
            .route("/members", get(handle_members))
            .layer(DefaultBodyLimit::max(limit))
            .with_state(self)
    }
}

async fn handle_raft(
    State(h): State<PeerHandler>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let remote_cid = headers
        .get(CLUSTER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let local_cid = h.cluster_id.to_string();
    if remote_cid != local_cid {
        warn!(h.logger, "rejecting message from different cluster";
            "remote_cluster_id" => remote_cid,
        );
        return (
            StatusCode::PRECONDITION_FAILED,
            format!("request cluster ID mismatch (expected {})", local_cid),
        )
            .into_response();
    }

    let m = match Message::parse_from_bytes(&body) {
        Ok(m) => m,
        Err(e) => {
            warn!(h.logger, "failed to decode raft message"; "error" => %e);
            return (StatusCode::BAD_REQUEST, "error decoding raft message").into_response();
        }
    };

    if m.get_msg_type() == MessageType::MsgAppend {
        h.server_stats.recv_append_req(body.len());
    }

    // No transport lock is held here: process may block on Raft's own
    // scheduling queue.
    match h.raft.process(m).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(ProcessError::Compacted) | Err(ProcessError::SnapOutOfDate) => {
            StatusCode::CONFLICT.into_response()
        }
        Err(ProcessError::Stopped) => StatusCode::SERVICE_UNAVAILABLE.into_response(),
        Err(e) => {
            debug!(h.logger, "error processing raft message"; "error" => %e);
            (StatusCode::INTERNAL_SERVER_ERROR, "error processing raft message").into_response()
        }
    }
}

async fn handle_version(State(_h): State<PeerHandler>) -> String {
    STORE_VERSION.to_string()
}

async fn handle_members(State(h): State<PeerHandler>) -> Json<Vec<MemberInfo>> {
    let cluster = h.cluster.read().expect("cluster lock poisoned");
    let members = cluster
        .members()
        .into_iter()
        .map(|m| MemberInfo {
            id: m.id().to_string(),
            name: m.name().to_string(),
            peer_urls: m.peer_urls().string_slice(),
            client_urls: m.client_urls().string_slice(),
        })
        .collect();
    Json(members)
}
