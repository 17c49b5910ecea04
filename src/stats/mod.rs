//! Send-side statistics for the peer transport.
//!
//! Followers are accounted from the leader's point of view: every outbound
//! post either succeeds (feeding the latency moments) or fails. The server
//! stats track append-request traffic in both directions with a sliding
//! rate window.

use crate::types::Id;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Number of samples the send/recv rate windows keep.
const RATE_QUEUE_LEN: usize = 200;

/// Success/failure counters for one follower.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FollowerCounts {
    pub success: u64,
    pub fail: u64,
}

/// Latency moments (milliseconds) over a follower's successful posts.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct FollowerLatency {
    pub current: f64,
    pub average: f64,
    pub standard_deviation: f64,
    pub minimum: f64,
    pub maximum: f64,
}

#[derive(Default)]
struct FollowerInner {
    counts: FollowerCounts,
    latency: FollowerLatency,
    average_square: f64,
}

/// Counters and latency moments for one follower.
#[derive(Default)]
pub struct FollowerStats {
    inner: Mutex<FollowerInner>,
}

impl FollowerStats {
    pub fn new() -> FollowerStats {
        FollowerStats::default()
    }

    /// Records a successful post that took `d`.
    pub fn succ(&self, d: Duration) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");

        let total = inner.counts.success as f64 * inner.latency.average;
        let total_square = inner.counts.success as f64 * inner.average_square;
        inner.counts.success += 1;

        let current = d.as_secs_f64() * 1000.0;
        inner.latency.current = current;
        if current > inner.latency.maximum {
            inner.latency.maximum = current;
        }
        if current < inner.latency.minimum || inner.counts.success == 1 {
            inner.latency.minimum = current;
        }
        inner.latency.average = (total + current) / inner.counts.success as f64;
        inner.average_square =
            (total_square + current * current) / inner.counts.success as f64;
        inner.latency.standard_deviation =
            (inner.average_square - inner.latency.average * inner.latency.average).sqrt();
    }

    /// Records a failed post.
    pub fn fail(&self) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.counts.fail += 1;
    }

    pub fn counts(&self) -> FollowerCounts {
        self.inner.lock().expect("stats lock poisoned").counts
    }

    pub fn latency(&self) -> FollowerLatency {
        self.inner.lock().expect("stats lock poisoned").latency
    }
}

/// Per-follower statistics kept while this member leads.
pub struct LeaderStats {
    leader: Id,
    followers: Mutex<HashMap<String, Arc<FollowerStats>>>,
}

impl LeaderStats {
    pub fn new(leader: Id) -> LeaderStats {
        LeaderStats {
            leader,
            followers: Mutex::new(HashMap::new()),
        }
    }

    pub fn leader(&self) -> Id {
        self.leader
    }

    /// The stats entry for `id`, created on first use.
    pub fn follower(&self, id: Id) -> Arc<FollowerStats> {
        let mut followers = self.followers.lock().expect("stats lock poisoned");
        followers
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(FollowerStats::new()))
            .clone()
    }

    pub fn remove(&self, id: Id) {
        let mut followers = self.followers.lock().expect("stats lock poisoned");
        followers.remove(&id.to_string());
    }

    pub fn follower_count(&self) -> usize {
        self.followers.lock().expect("stats lock poisoned").len()
    }
}

/// Sliding window over the most recent sampled requests.
struct RateQueue {
    items: VecDeque<(Instant, usize)>,
}

impl RateQueue {
    fn new() -> RateQueue {
        RateQueue {
            items: VecDeque::with_capacity(RATE_QUEUE_LEN),
        }
    }

    fn insert(&mut self, size: usize) {
        if self.items.len() == RATE_QUEUE_LEN {
            self.items.pop_front();
        }
        self.items.push_back((Instant::now(), size));
    }

    /// `(bytes/s, requests/s)` over the window span.
    fn rate(&self) -> (f64, f64) {
        let (front, back) = match (self.items.front(), self.items.back()) {
            (Some(f), Some(b)) if self.items.len() > 1 => (f, b),
            _ => return (0.0, 0.0),
        };
        let span = back.0.duration_since(front.0).as_secs_f64();
        if span <= 0.0 {
            return (0.0, 0.0);
        }
        let bytes: usize = self.items.iter().map(|(_, s)| s).sum();
        (bytes as f64 / span, self.items.len() as f64 / span)
    }
}

#[derive(Default)]
struct TrafficCounts {
    append_count: u64,
    bytes: u64,
}

struct ServerInner {
    send: TrafficCounts,
    send_rate: RateQueue,
    recv: TrafficCounts,
    recv_rate: RateQueue,
}

/// Append-request traffic counters for this server.
pub struct ServerStats {
    inner: Mutex<ServerInner>,
}

impl Default for ServerStats {
    fn default() -> Self {
        ServerStats {
            inner: Mutex::new(ServerInner {
                send: TrafficCounts::default(),
                send_rate: RateQueue::new(),
                recv: TrafficCounts::default(),
                recv_rate: RateQueue::new(),
            }),
        }
    }
}

impl ServerStats {
    pub fn new() -> ServerStats {
        ServerStats::default()
    }

    pub fn send_append_req(&self, size: usize) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.send.append_count += 1;
        inner.send.bytes += size as u64;
        inner.send_rate.insert(size);
    }

    pub fn recv_append_req(&self, size: usize) {
        let mut inner = self.inner.lock().expect("stats lock poisoned");
        inner.recv.append_count += 1;
        inner.recv.bytes += size as u64;
        inner.recv_rate.insert(size);
    }

    pub fn send_append_count(&self) -> u64 {
        self.inner.lock().expect("stats lock poisoned").send.append_count
    }

    pub fn recv_append_count(&self) -> u64 {
        self.inner.lock().expect("stats lock poisoned").recv.append_count
    }

    pub fn send_append_bytes(&self) -> u64 {
        self.inner.lock().expect("stats lock poisoned").send.bytes
    }

    pub fn recv_append_bytes(&self) -> u64 {
        self.inner.lock().expect("stats lock poisoned").recv.bytes
    }

    /// `(bytes/s, requests/s)` over the recent send window.
    pub fn send_rates(&self) -> (f64, f64) {
        self.inner.lock().expect("stats lock poisoned").send_rate.rate()
    }

    /// `(bytes/s, requests/s)` over the recent receive window.
    pub fn recv_rates(&self) -> (f64, f64) {
        self.inner.lock().expect("stats lock poisoned").recv_rate.rate()
    }
}
