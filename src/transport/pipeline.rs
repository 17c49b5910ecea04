//! Short-lived, bounded-queue sender that posts serialized raft messages
//! to one remote peer.
//!
//! A pipeline owns a small inbound queue and a fixed set of workers that
//! drain it concurrently. Back-pressure is absorbed by dropping: Raft must
//! stay live, so `send` never blocks the caller.

use crate::stats::FollowerStats;
use crate::transport::error::TransportError;
use crate::transport::raft::Raft;
use crate::transport::urlpick::UrlPicker;
use crate::transport::RAFT_PREFIX;
use crate::types::urls::url_to_string;
use crate::types::{Id, Urls};
use async_trait::async_trait;
use bytes::Bytes;
use protobuf::Message as PbMessage;
use ::raft::eraftpb::{Message, MessageType};
use ::raft::SnapshotStatus;
use slog::{debug, warn, Logger};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use url::Url;

/// Capacity of a pipeline's inbound message queue.
pub(crate) const PIPELINE_BUF_SIZE: usize = 64;

/// Number of workers concurrently draining one pipeline.
pub(crate) const CONN_PER_PIPELINE: usize = 4;

/// Outbound request as the pipeline hands it to the round-tripper.
///
/// Header names are materialized only by the HTTP implementation; test
/// doubles assert on the typed fields instead.
#[derive(Clone, Debug)]
pub struct PeerRequest {
    pub url: Url,
    pub content_type: &'static str,
    /// Local cluster id in its hex wire form.
    pub cluster_id: String,
    pub server_version: Option<String>,
    pub body: Bytes,
}

/// What the pipeline needs back from one POST attempt.
#[derive(Clone, Debug, Default)]
pub struct PeerResponse {
    pub status: u16,
    pub location: Option<String>,
}

/// A single outbound POST attempt.
#[async_trait]
pub trait RoundTripper: Send + Sync {
    async fn round_trip(&self, req: PeerRequest) -> Result<PeerResponse, TransportError>;
}

/// Production round-tripper over reqwest.
///
/// Redirects are handled by the pipeline itself (one retry on 307), never
/// by the client.
pub struct HttpRoundTripper {
    client: reqwest::Client,
}

impl HttpRoundTripper {
    pub fn new(request_timeout: Duration) -> HttpRoundTripper {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(request_timeout)
            .build()
            .expect("failed to create HTTP client");
        HttpRoundTripper { client }
    }
}

#[async_trait]
impl RoundTripper for HttpRoundTripper {
    async fn round_trip(&self, req: PeerRequest) -> Result<PeerResponse, TransportError> {
        let url = req.url.to_string();
        let mut builder = self
            .client
            .post(req.url)
            .header("Content-Type", req.content_type)
            .header("X-Etcd-Cluster-ID", &req.cluster_id)
            .body(req.body);
        if let Some(v) = &req.server_version {
            builder = builder.header("X-Server-Version", v);
        }
        let resp = builder
            .send()
            .await
            .map_err(|e| TransportError::PostFailed {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        let location = resp
            .headers()
            .get(reqwest::header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        Ok(PeerResponse {
            status: resp.status().as_u16(),
            location,
        })
    }
}

struct PipelineCtx {
    to: Id,
    cid: Id,
    tr: Arc<dyn RoundTripper>,
    picker: Arc<UrlPicker>,
    fs: Arc<FollowerStats>,
    raft: Arc<dyn Raft>,
    errorc: mpsc::Sender<TransportError>,
    server_version: Option<String>,
    logger: Logger,
}

/// Sender for one remote peer.
pub(crate) struct Pipeline {
    ctx: Arc<PipelineCtx>,
    msg_tx: mpsc::Sender<Message>,
    dropped: AtomicU64,
    shutdown_tx: broadcast::Sender<()>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        to: Id,
        cid: Id,
        server_version: Option<String>,
        tr: Arc<dyn RoundTripper>,
        picker: Arc<UrlPicker>,
        fs: Arc<FollowerStats>,
        raft: Arc<dyn Raft>,
        errorc: mpsc::Sender<TransportError>,
        logger: Logger,
    ) -> Pipeline {
        let (msg_tx, msg_rx) = mpsc::channel(PIPELINE_BUF_SIZE);
        let (shutdown_tx, _) = broadcast::channel(1);
        let ctx = Arc::new(PipelineCtx {
            to,
            cid,
            tr,
            picker,
            fs,
            raft,
            errorc,
            server_version,
            logger,
        });

        let msg_rx = Arc::new(Mutex::new(msg_rx));
        let mut workers = Vec::with_capacity(CONN_PER_PIPELINE);
        for _ in 0..CONN_PER_PIPELINE {
            workers.push(tokio::spawn(worker_loop(
                ctx.clone(),
                msg_rx.clone(),
                shutdown_tx.subscribe(),
            )));
        }

        Pipeline {
            ctx,
            msg_tx,
            dropped: AtomicU64::new(0),
            shutdown_tx,
            workers: std::sync::Mutex::new(workers),
        }
    }

    /// Enqueues a message without blocking.
    ///
    /// A full queue drops the message, reports the peer unreachable, and
    /// fails a pending snapshot transfer, so Raft backs off instead of
    /// piling onto a peer that cannot keep up.
    pub fn send(&self, m: Message) {
        if let Err(err) = self.msg_tx.try_send(m) {
            let m = match err {
                mpsc::error::TrySendError::Full(m) => m,
                mpsc::error::TrySendError::Closed(m) => m,
            };
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!(self.ctx.logger, "dropping message to busy peer";
                "to" => %self.ctx.to,
            );
            self.ctx.raft.report_unreachable(m.to);
            if m.get_msg_type() == MessageType::MsgSnapshot {
                self.ctx.raft.report_snapshot(m.to, SnapshotStatus::Failure);
            }
        }
    }

    /// Replaces the peer's advertised URLs; workers keep running.
    pub fn update(&self, urls: Urls) {
        self.ctx.picker.update(urls);
    }

    /// Messages dropped because the queue was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Stops the workers and waits for them to exit. In-flight posts are
    /// abandoned at their next suspension point.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(());
        let handles: Vec<JoinHandle<()>> = {
            let mut workers = self.workers.lock().expect("pipeline lock poisoned");
            workers.drain(..).collect()
        };
        for h in handles {
            let _ = h.await;
        }
        debug!(self.ctx.logger, "pipeline stopped"; "to" => %self.ctx.to);
    }
}

async fn worker_loop(
    ctx: Arc<PipelineCtx>,
    msg_rx: Arc<Mutex<mpsc::Receiver<Message>>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        // Hold the receiver lock only while waiting for a message so the
        // other workers can drain while this one posts.
        let m = {
            let mut rx = msg_rx.lock().await;
            tokio::select! {
                m = rx.recv() => match m {
                    Some(m) => m,
                    None => return,
                },
                _ = shutdown.recv() => return,
            }
        };

        let body = m
            .write_to_bytes()
            .unwrap_or_else(|e| panic!("message marshal should never fail: {}", e));
        let is_snap = m.get_msg_type() == MessageType::MsgSnapshot;

        let start = Instant::now();
        let result = tokio::select! {
            r = post(&ctx, Bytes::from(body)) => r,
            _ = shutdown.recv() => return,
        };

        match result {
            Ok(()) => {
                ctx.fs.succ(start.elapsed());
                if is_snap {
                    ctx.raft.report_snapshot(m.to, SnapshotStatus::Finish);
                }
            }
            Err(err) => {
                debug!(ctx.logger, "failed to post to peer";
                    "to" => %ctx.to,
                    "error" => %err,
                );
                ctx.fs.fail();
                ctx.raft.report_unreachable(m.to);
                if is_snap {
                    ctx.raft.report_snapshot(m.to, SnapshotStatus::Failure);
                }
            }
        }
    }
}

/// One delivery attempt against the currently picked URL, following at
/// most one temporary redirect.
async fn post(ctx: &PipelineCtx, body: Bytes) -> Result<(), TransportError> {
    let picked = ctx.picker.pick();
    let url = raft_endpoint(&picked);

    let resp = match ctx.tr.round_trip(request(ctx, url.clone(), body.clone())).await {
        Ok(r) => r,
        Err(e) => {
            ctx.picker.unreachable(&picked);
            return Err(e);
        }
    };

    match resp.status {
        307 => {
            // Discovery-service convention: retry once to the new home.
            let loc = match resp.location.as_deref().and_then(|l| Url::parse(l).ok()) {
                Some(l) => l,
                None => {
                    ctx.picker.unreachable(&picked);
                    return Err(TransportError::BadRedirect {
                        url: url.to_string(),
                    });
                }
            };
            let retry = match ctx.tr.round_trip(request(ctx, loc, body)).await {
                Ok(r) => r,
                Err(e) => {
                    ctx.picker.unreachable(&picked);
                    return Err(e);
                }
            };
            classify(ctx, &picked, &url, retry.status)
        }
        status => classify(ctx, &picked, &url, status),
    }
}

fn classify(
    ctx: &PipelineCtx,
    picked: &Url,
    url: &Url,
    status: u16,
) -> Result<(), TransportError> {
    match status {
        204 => Ok(()),
        403 => {
            let err = TransportError::MemberRemoved;
            let _ = ctx.errorc.try_send(err.clone());
            Err(err)
        }
        412 => {
            let err = TransportError::ClusterIdMismatch {
                local: ctx.cid,
                url: url.to_string(),
            };
            let _ = ctx.errorc.try_send(err.clone());
            Err(err)
        }
        200 | 201 => {
            // A 2xx the raft endpoint never returns: something else is
            // answering on this URL, so rotate away from it.
            ctx.picker.unreachable(picked);
            Err(TransportError::UnexpectedStatus {
                status,
                url: url.to_string(),
            })
        }
        status => Err(TransportError::UnexpectedStatus {
            status,
            url: url.to_string(),
        }),
    }
}

fn request(ctx: &PipelineCtx, url: Url, body: Bytes) -> PeerRequest {
    PeerRequest {
        url,
        content_type: "application/protobuf",
        cluster_id: ctx.cid.to_string(),
        server_version: ctx.server_version.clone(),
        body,
    }
}

fn raft_endpoint(base: &Url) -> Url {
    let joined = format!("{}{}", url_to_string(base), RAFT_PREFIX);
    Url::parse(&joined).expect("peer URL with raft path is valid")
}
