//! Append-only statistics sink.
//!
//! Every cache-relevant action is recorded as one JSON line in
//! `data/events.log`.  The core only appends; dashboards read the log
//! out-of-process.  Alongside the log the sink keeps in-memory aggregates
//! and a per-package memory of the last observed *pre-trim* size, which
//! lets later cache hits be credited with the bandwidth they saved.
//! The raw-size memory is rebuilt from the log on start; losing it skews
//! reported savings but never correctness.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

const EVENT_LOG_FILE: &str = "events.log";

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

/// One entry in the event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum Event {
    Hit {
        package: String,
        served_bytes: u64,
        saved_bytes: u64,
    },
    Miss {
        package: String,
        compressed_bytes: u64,
        elapsed_ms: u64,
    },
    Strip {
        package: String,
        raw_bytes: u64,
        stripped_bytes: u64,
    },
    Sync {
        package: String,
        prev_bytes: u64,
        new_bytes: u64,
    },
    Prefetch {
        package: String,
        raw_bytes: u64,
        stripped_bytes: u64,
    },
    Passthrough {
        path: String,
        elapsed_ms: u64,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LogRecord {
    ts: DateTime<Utc>,
    #[serde(flatten)]
    event: Event,
}

/// Point-in-time aggregates, the query surface consumed by dashboards.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub strips: u64,
    pub syncs: u64,
    pub prefetches: u64,
    pub passthroughs: u64,
    pub total_served: u64,
    pub total_saved: u64,
}

// ---------------------------------------------------------------------------
// StatsSink
// ---------------------------------------------------------------------------

/// Shared handle to the event log.  Cheap to clone; appends are safe from
/// any task.
#[derive(Clone)]
pub struct StatsSink {
    inner: Arc<Inner>,
}

struct Inner {
    log: Mutex<tokio::fs::File>,
    raw_sizes: DashMap<String, u64>,
    hits: AtomicU64,
    misses: AtomicU64,
    strips: AtomicU64,
    syncs: AtomicU64,
    prefetches: AtomicU64,
    passthroughs: AtomicU64,
    total_served: AtomicU64,
    total_saved: AtomicU64,
}

impl StatsSink {
    /// Open the sink rooted at `data_dir`, replaying any existing event
    /// log to rebuild the raw-size memory and aggregates.
    pub async fn open<P: AsRef<Path>>(data_dir: P) -> Result<Self> {
        let data_dir = data_dir.as_ref();
        tokio::fs::create_dir_all(data_dir)
            .await
            .with_context(|| format!("failed to create data dir: {}", data_dir.display()))?;

        let log_path = data_dir.join(EVENT_LOG_FILE);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
            .with_context(|| format!("failed to open event log: {}", log_path.display()))?;

        let sink = Self {
            inner: Arc::new(Inner {
                log: Mutex::new(file),
                raw_sizes: DashMap::new(),
                hits: AtomicU64::new(0),
                misses: AtomicU64::new(0),
                strips: AtomicU64::new(0),
                syncs: AtomicU64::new(0),
                prefetches: AtomicU64::new(0),
                passthroughs: AtomicU64::new(0),
                total_served: AtomicU64::new(0),
                total_saved: AtomicU64::new(0),
            }),
        };

        sink.replay(&log_path).await;
        Ok(sink)
    }

    /// A cached entry was served.  Savings are credited against the last
    /// observed raw size, or zero when none is known.
    pub async fn record_hit(&self, package: &str, served_bytes: u64) {
        let saved_bytes = self
            .inner
            .raw_sizes
            .get(package)
            .map(|raw| raw.saturating_sub(served_bytes))
            .unwrap_or(0);
        self.record(Event::Hit {
            package: package.to_string(),
            served_bytes,
            saved_bytes,
        })
        .await;
    }

    /// A metadata request went to upstream.
    pub async fn record_miss(&self, package: &str, compressed_bytes: u64, elapsed_ms: u64) {
        self.record(Event::Miss {
            package: package.to_string(),
            compressed_bytes,
            elapsed_ms,
        })
        .await;
    }

    /// The strip pipeline produced a cache entry.
    pub async fn record_strip(&self, package: &str, raw_bytes: u64, stripped_bytes: u64) {
        self.record(Event::Strip {
            package: package.to_string(),
            raw_bytes,
            stripped_bytes,
        })
        .await;
    }

    /// The synchronizer refreshed a cache entry.
    pub async fn record_sync(&self, package: &str, prev_bytes: u64, new_bytes: u64) {
        self.record(Event::Sync {
            package: package.to_string(),
            prev_bytes,
            new_bytes,
        })
        .await;
    }

    /// The prefetcher warmed a cache entry.
    pub async fn record_prefetch(&self, package: &str, raw_bytes: u64, stripped_bytes: u64) {
        self.record(Event::Prefetch {
            package: package.to_string(),
            raw_bytes,
            stripped_bytes,
        })
        .await;
    }

    /// A request was forwarded without touching the cache.
    pub async fn record_passthrough(&self, path: &str, elapsed_ms: u64) {
        self.record(Event::Passthrough {
            path: path.to_string(),
            elapsed_ms,
        })
        .await;
    }

    /// Current aggregates.
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = &self.inner;
        StatsSnapshot {
            hits: inner.hits.load(Ordering::Relaxed),
            misses: inner.misses.load(Ordering::Relaxed),
            strips: inner.strips.load(Ordering::Relaxed),
            syncs: inner.syncs.load(Ordering::Relaxed),
            prefetches: inner.prefetches.load(Ordering::Relaxed),
            passthroughs: inner.passthroughs.load(Ordering::Relaxed),
            total_served: inner.total_served.load(Ordering::Relaxed),
            total_saved: inner.total_saved.load(Ordering::Relaxed),
        }
    }

    /// Last observed pre-trim size for `package`, if any.
    pub fn raw_size(&self, package: &str) -> Option<u64> {
        self.inner.raw_sizes.get(package).map(|r| *r)
    }

    async fn record(&self, event: Event) {
        self.apply(&event);
        let record = LogRecord {
            ts: Utc::now(),
            event,
        };
        let mut line = match serde_json::to_vec(&record) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "failed to serialize stats event");
                return;
            }
        };
        line.push(b'\n');

        let mut log = self.inner.log.lock().await;
        if let Err(e) = log.write_all(&line).await {
            // The sink must never break serving; a lost event only skews
            // the dashboard.
            warn!(error = %e, "failed to append stats event");
        }
    }

    /// Fold one event into the aggregates and the raw-size memory.  Used
    /// both for live recording and for start-up replay.
    fn apply(&self, event: &Event) {
        let inner = &self.inner;
        match event {
            Event::Hit {
                served_bytes,
                saved_bytes,
                ..
            } => {
                inner.hits.fetch_add(1, Ordering::Relaxed);
                inner.total_served.fetch_add(*served_bytes, Ordering::Relaxed);
                inner.total_saved.fetch_add(*saved_bytes, Ordering::Relaxed);
            }
            Event::Miss { .. } => {
                inner.misses.fetch_add(1, Ordering::Relaxed);
            }
            Event::Strip {
                package, raw_bytes, ..
            } => {
                inner.strips.fetch_add(1, Ordering::Relaxed);
                inner.raw_sizes.insert(package.clone(), *raw_bytes);
            }
            Event::Sync {
                package,
                prev_bytes,
                ..
            } => {
                inner.syncs.fetch_add(1, Ordering::Relaxed);
                inner.raw_sizes.insert(package.clone(), *prev_bytes);
            }
            Event::Prefetch {
                package, raw_bytes, ..
            } => {
                inner.prefetches.fetch_add(1, Ordering::Relaxed);
                inner.raw_sizes.insert(package.clone(), *raw_bytes);
            }
            Event::Passthrough { .. } => {
                inner.passthroughs.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn replay(&self, log_path: &Path) {
        let contents = match tokio::fs::read_to_string(log_path).await {
            Ok(contents) => contents,
            Err(e) => {
                warn!(error = %e, "could not replay event log; savings start cold");
                return;
            }
        };
        let mut replayed = 0usize;
        for line in contents.lines() {
            if line.is_empty() {
                continue;
            }
            match serde_json::from_str::<LogRecord>(line) {
                Ok(record) => {
                    self.apply(&record.event);
                    replayed += 1;
                }
                Err(e) => {
                    // A torn final line after a crash is expected; skip it.
                    warn!(error = %e, "skipping unparseable event log line");
                }
            }
        }
        if replayed > 0 {
            tracing::info!(events = replayed, "replayed event log");
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn hit_without_raw_size_saves_nothing() {
        let dir = TempDir::new().unwrap();
        let sink = StatsSink::open(dir.path()).await.unwrap();

        sink.record_hit("express", 1_000).await;

        let snap = sink.snapshot();
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.total_served, 1_000);
        assert_eq!(snap.total_saved, 0);
    }

    #[tokio::test]
    async fn strip_then_hit_credits_savings() {
        let dir = TempDir::new().unwrap();
        let sink = StatsSink::open(dir.path()).await.unwrap();

        sink.record_strip("express", 2_800_000, 900_000).await;
        sink.record_hit("express", 900_000).await;

        let snap = sink.snapshot();
        assert_eq!(snap.strips, 1);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.total_served, 900_000);
        assert_eq!(snap.total_saved, 1_900_000);
        assert_eq!(sink.raw_size("express"), Some(2_800_000));
    }

    #[tokio::test]
    async fn savings_never_go_negative() {
        let dir = TempDir::new().unwrap();
        let sink = StatsSink::open(dir.path()).await.unwrap();

        sink.record_strip("tiny", 10, 10).await;
        sink.record_hit("tiny", 50).await;
        assert_eq!(sink.snapshot().total_saved, 0);
    }

    #[tokio::test]
    async fn sync_and_prefetch_update_raw_size_memory() {
        let dir = TempDir::new().unwrap();
        let sink = StatsSink::open(dir.path()).await.unwrap();

        sink.record_sync("a", 500, 400).await;
        assert_eq!(sink.raw_size("a"), Some(500));

        sink.record_prefetch("b", 700, 300).await;
        assert_eq!(sink.raw_size("b"), Some(700));
    }

    #[tokio::test]
    async fn replay_rebuilds_memory_and_counters() {
        let dir = TempDir::new().unwrap();
        {
            let sink = StatsSink::open(dir.path()).await.unwrap();
            sink.record_miss("express", 1_200_000, 350).await;
            sink.record_strip("express", 2_800_000, 900_000).await;
            sink.record_hit("express", 900_000).await;
            sink.record_passthrough("/-/v1/search", 12).await;
        }

        let reopened = StatsSink::open(dir.path()).await.unwrap();
        let snap = reopened.snapshot();
        assert_eq!(snap.misses, 1);
        assert_eq!(snap.strips, 1);
        assert_eq!(snap.hits, 1);
        assert_eq!(snap.passthroughs, 1);
        assert_eq!(snap.total_saved, 1_900_000);
        assert_eq!(reopened.raw_size("express"), Some(2_800_000));
    }

    #[tokio::test]
    async fn replay_skips_torn_lines() {
        let dir = TempDir::new().unwrap();
        {
            let sink = StatsSink::open(dir.path()).await.unwrap();
            sink.record_hit("express", 10).await;
        }
        // Simulate a crash mid-append.
        let log = dir.path().join(EVENT_LOG_FILE);
        let mut contents = std::fs::read(&log).unwrap();
        contents.extend_from_slice(b"{\"ts\":\"2026-01-01T00:00:00Z\",\"event\":\"hi");
        std::fs::write(&log, contents).unwrap();

        let reopened = StatsSink::open(dir.path()).await.unwrap();
        assert_eq!(reopened.snapshot().hits, 1);
    }

    #[test]
    fn event_lines_are_tagged() {
        let event = Event::Strip {
            package: "express".into(),
            raw_bytes: 100,
            stripped_bytes: 40,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "strip");
        assert_eq!(json["raw_bytes"], 100);
    }
}
