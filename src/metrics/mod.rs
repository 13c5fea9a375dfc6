//! Process-durable counters and latency samples.
//!
//! Counters live in one JSON document and every mutation is a
//! read-modify-persist cycle, so the ingest and worker processes can point at
//! the same file and a scrape on either side sees both. The in-process mutex
//! serializes writers inside one process; concurrent writers across processes
//! can lose increments, which a multi-instance deployment must replace with a
//! store that increments natively. Latency rings are in-memory only.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Cap on retained latency samples per ring.
const MAX_LATENCY_SAMPLES: usize = 200;

/// Named monotonic counters exposed at the observability boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    QueuePublished,
    WebhookRequests,
    WebhookUnauthorized,
    WorkerUpdatesReceived,
    WorkerUpdatesProcessed,
    WorkerUpdatesDuplicate,
    WorkerUpdatesMalformed,
    WorkerLockContention,
    WorkerRateLimitDrop,
    WorkerErrors,
    CacheErrors,
}

/// Persisted counter document. Unknown fields from newer builds are dropped;
/// missing fields default to zero so the schema can grow.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct CounterSet {
    pub queue_published: u64,
    pub webhook_requests: u64,
    pub webhook_unauthorized: u64,
    pub worker_updates_received: u64,
    pub worker_updates_processed: u64,
    pub worker_updates_duplicate: u64,
    pub worker_updates_malformed: u64,
    pub worker_lock_contention: u64,
    pub worker_ratelimit_drop: u64,
    pub worker_errors: u64,
    pub cache_errors: u64,
}

impl CounterSet {
    fn bump(&mut self, counter: Counter) {
        let slot = match counter {
            Counter::QueuePublished => &mut self.queue_published,
            Counter::WebhookRequests => &mut self.webhook_requests,
            Counter::WebhookUnauthorized => &mut self.webhook_unauthorized,
            Counter::WorkerUpdatesReceived => &mut self.worker_updates_received,
            Counter::WorkerUpdatesProcessed => &mut self.worker_updates_processed,
            Counter::WorkerUpdatesDuplicate => &mut self.worker_updates_duplicate,
            Counter::WorkerUpdatesMalformed => &mut self.worker_updates_malformed,
            Counter::WorkerLockContention => &mut self.worker_lock_contention,
            Counter::WorkerRateLimitDrop => &mut self.worker_ratelimit_drop,
            Counter::WorkerErrors => &mut self.worker_errors,
            Counter::CacheErrors => &mut self.cache_errors,
        };
        *slot += 1;
    }
}

#[derive(Debug, Default)]
struct LatencyRings {
    webhook_ms: VecDeque<f64>,
    worker_handle_ms: VecDeque<f64>,
}

/// Flat snapshot consumed by the `/metrics` endpoint and tests.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub counters: CounterSet,
    pub webhook_latency_ms_p95: f64,
    pub worker_handle_ms_p95: f64,
}

/// Counter store shared by the ingest endpoint, the worker pipeline, and the
/// cache client. Cheap to clone via `Arc`.
#[derive(Debug)]
pub struct MetricsStore {
    path: PathBuf,
    disk: Mutex<()>,
    rings: Mutex<LatencyRings>,
}

impl MetricsStore {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            disk: Mutex::new(()),
            rings: Mutex::new(LatencyRings::default()),
        }
    }

    /// Increment one counter: reload the document, bump, persist.
    pub fn incr(&self, counter: Counter) {
        let _guard = self.disk.lock();
        let mut counters = read_counters(&self.path);
        counters.bump(counter);
        write_counters(&self.path, &counters);
    }

    pub fn record_webhook_latency(&self, elapsed: Duration) {
        let mut rings = self.rings.lock();
        push_sample(&mut rings.webhook_ms, elapsed);
    }

    pub fn record_worker_handle_latency(&self, elapsed: Duration) {
        let mut rings = self.rings.lock();
        push_sample(&mut rings.worker_handle_ms, elapsed);
    }

    pub fn snapshot(&self) -> Snapshot {
        let counters = {
            let _guard = self.disk.lock();
            read_counters(&self.path)
        };
        let rings = self.rings.lock();
        Snapshot {
            counters,
            webhook_latency_ms_p95: percentile95(&rings.webhook_ms),
            worker_handle_ms_p95: percentile95(&rings.worker_handle_ms),
        }
    }

    /// Flat `name value` exposition lines for pull-based scraping.
    pub fn render_text(&self) -> String {
        let snapshot = self.snapshot();
        let c = &snapshot.counters;
        let lines = [
            format!("queue_published_total {}", c.queue_published),
            format!("webhook_requests_total {}", c.webhook_requests),
            format!("webhook_unauthorized_total {}", c.webhook_unauthorized),
            format!("webhook_latency_ms_p95 {:.2}", snapshot.webhook_latency_ms_p95),
            format!("worker_updates_received_total {}", c.worker_updates_received),
            format!("worker_updates_processed_total {}", c.worker_updates_processed),
            format!("worker_updates_duplicate_total {}", c.worker_updates_duplicate),
            format!("worker_updates_malformed_total {}", c.worker_updates_malformed),
            format!("worker_lock_contention_total {}", c.worker_lock_contention),
            format!("worker_ratelimit_drop_total {}", c.worker_ratelimit_drop),
            format!("worker_errors_total {}", c.worker_errors),
            format!("worker_handle_duration_ms_p95 {:.2}", snapshot.worker_handle_ms_p95),
            format!("cache_errors_total {}", c.cache_errors),
        ];
        lines.join("\n")
    }
}

fn push_sample(ring: &mut VecDeque<f64>, elapsed: Duration) {
    ring.push_back(elapsed.as_secs_f64() * 1_000.0);
    if ring.len() > MAX_LATENCY_SAMPLES {
        ring.pop_front();
    }
}

fn read_counters(path: &Path) -> CounterSet {
    match std::fs::read(path) {
        Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
        Err(_) => CounterSet::default(),
    }
}

fn write_counters(path: &Path, counters: &CounterSet) {
    let raw = match serde_json::to_vec(counters) {
        Ok(raw) => raw,
        Err(err) => {
            tracing::warn!("failed to serialize metrics counters: {err}");
            return;
        }
    };
    if let Err(err) = std::fs::write(path, raw) {
        tracing::warn!("failed to persist metrics to {}: {err}", path.display());
    }
}

fn percentile95(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted: Vec<f64> = samples.iter().copied().collect();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() as f64 * 0.95).ceil() as usize).max(1) - 1;
    (sorted[idx] * 100.0).round() / 100.0
}
