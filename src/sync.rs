//! Changes-feed synchronizer.
//!
//! A long-running task that tails the upstream changes feed and keeps
//! already-cached entries current: edits trigger a refetch-and-retrim,
//! deletions remove the cache file.  Progress is tracked by a sequence
//! cursor persisted to `data/.sync-seq`, written only after a batch has
//! been applied, so a crash replays at most one batch (updates are
//! idempotent and deleting an absent file is a no-op).
//!
//! The loop never exits on its own: every failure is converted into a
//! logged backoff sleep.  A 429 from upstream doubles the backoff up to
//! a cap; any success resets it to the poll interval.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::stats::StatsSink;
use crate::store::CacheStore;
use crate::trim::trim;
use crate::upstream::{ChangesPage, UpstreamClient};

const CURSOR_FILE: &str = ".sync-seq";

pub struct ChangeSync {
    upstream: UpstreamClient,
    store: CacheStore,
    stats: StatsSink,
    cursor_path: PathBuf,
    poll_interval: Duration,
    max_backoff: Duration,
    page_limit: usize,
    semaphore: Arc<Semaphore>,
}

impl ChangeSync {
    pub fn new(
        config: &Config,
        upstream: UpstreamClient,
        store: CacheStore,
        stats: StatsSink,
    ) -> Self {
        Self {
            upstream,
            store,
            stats,
            cursor_path: config.storage.data_dir.join(CURSOR_FILE),
            poll_interval: Duration::from_secs(config.sync.poll_interval_secs),
            max_backoff: Duration::from_secs(config.sync.max_backoff_secs),
            page_limit: config.sync.page_limit,
            // Reuses the prefetcher's concurrency bound for batch fetches.
            semaphore: Arc::new(Semaphore::new(config.prefetch.max_concurrent)),
        }
    }

    /// Run until `shutdown` fires.  Cancellation is only observed between
    /// ticks, so an in-flight batch always completes and the cursor only
    /// advances on clean batch completion.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut cursor = self.load_cursor().await;
        let mut backoff = self.poll_interval;
        info!(%cursor, "change synchronizer started");

        loop {
            let sleep_for = self.tick(&mut cursor, &mut backoff).await;
            if sleep_for.is_zero() {
                // Full page: upstream has more, poll again immediately.
                continue;
            }
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("change synchronizer stopping");
                    return;
                }
                () = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    /// One poll of the changes feed.  Returns how long to sleep before
    /// the next poll; zero means the feed has more pages.
    async fn tick(&self, cursor: &mut String, backoff: &mut Duration) -> Duration {
        let resp = match self.upstream.changes(cursor, self.page_limit).await {
            Ok(resp) => resp,
            Err(e) => {
                warn!(error = %e, "changes feed unreachable");
                return *backoff;
            }
        };

        let status = resp.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let sleep_for = *backoff;
            *backoff = (*backoff * 2).min(self.max_backoff);
            warn!(sleep_secs = sleep_for.as_secs(), "changes feed rate-limited");
            return sleep_for;
        }
        if !status.is_success() {
            warn!(%status, "changes feed returned non-success");
            return *backoff;
        }
        *backoff = self.poll_interval;

        let page: ChangesPage = match resp.json().await {
            Ok(page) => page,
            Err(e) => {
                warn!(error = %e, "changes page failed to parse");
                return *backoff;
            }
        };

        let page_len = page.results.len();
        if let Err(e) = self.apply_page(cursor, page).await {
            warn!(error = %e, "failed to apply changes page");
            return *backoff;
        }

        if page_len >= self.page_limit {
            Duration::ZERO
        } else {
            self.poll_interval
        }
    }

    async fn apply_page(&self, cursor: &mut String, page: ChangesPage) -> Result<()> {
        // Walk the page in sequence order, deleting immediately and
        // collecting edits of cached packages for a bounded refetch.
        // Duplicate ids collapse into one refetch of the current upstream
        // state, which is what the later sequence number demands anyway.
        let mut to_fetch: Vec<(String, u64)> = Vec::new();
        for change in &page.results {
            let id = &change.id;
            if *id != id.to_lowercase() {
                // Non-lowercase names would collide with their lowercase
                // twins on case-insensitive filesystems.
                debug!(package = %id, "skipping non-lowercase change");
                continue;
            }
            let prev_size = match self.store.size(id).await {
                Ok(Some(size)) => size,
                Ok(None) => continue,
                Err(e) => {
                    warn!(package = %id, error = %e, "cache probe failed during sync");
                    continue;
                }
            };
            if change.deleted {
                self.store.delete(id).await?;
                info!(package = %id, seq = %seq_to_string(&change.seq), "removed deleted package");
            } else if !to_fetch.iter().any(|(name, _)| name == id) {
                to_fetch.push((id.clone(), prev_size));
            }
        }

        self.refresh_batch(to_fetch).await;

        let last_seq = seq_to_string(&page.last_seq);
        if cursor_advances(cursor, &last_seq) {
            self.persist_cursor(&last_seq).await?;
            *cursor = last_seq;
        }
        Ok(())
    }

    /// Refetch and retrim a batch of edited packages, bounded by the
    /// semaphore.  Entries that fail to fetch or lack the metadata shape
    /// are left untouched.
    async fn refresh_batch(&self, to_fetch: Vec<(String, u64)>) {
        let mut tasks: JoinSet<()> = JoinSet::new();
        for (name, prev_size) in to_fetch {
            let upstream = self.upstream.clone();
            let store = self.store.clone();
            let stats = self.stats.clone();
            let semaphore = Arc::clone(&self.semaphore);
            tasks.spawn(async move {
                let _permit = match semaphore.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if let Err(e) = refresh_one(&upstream, &store, &stats, &name, prev_size).await {
                    warn!(package = %name, error = %e, "sync refresh failed");
                }
            });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "sync refresh task panicked");
            }
        }
    }

    async fn load_cursor(&self) -> String {
        match tokio::fs::read_to_string(&self.cursor_path).await {
            Ok(contents) => {
                let cursor = contents.trim().to_string();
                if cursor.is_empty() {
                    "0".to_string()
                } else {
                    cursor
                }
            }
            Err(_) => "0".to_string(),
        }
    }

    async fn persist_cursor(&self, cursor: &str) -> Result<()> {
        if let Some(parent) = self.cursor_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("failed to create data dir")?;
        }
        let tmp = self.cursor_path.with_extension("tmp");
        tokio::fs::write(&tmp, format!("{cursor}\n"))
            .await
            .context("failed to write cursor temp file")?;
        tokio::fs::rename(&tmp, &self.cursor_path)
            .await
            .context("failed to commit cursor file")?;
        Ok(())
    }
}

async fn refresh_one(
    upstream: &UpstreamClient,
    store: &CacheStore,
    stats: &StatsSink,
    name: &str,
    prev_size: u64,
) -> Result<()> {
    let fetched = upstream.fetch_metadata(name).await?;
    if !is_metadata_doc(&fetched.doc) {
        debug!(package = %name, "sync fetch lacks metadata shape; leaving entry untouched");
        return Ok(());
    }
    let trimmed = trim(&fetched.doc);
    let bytes = serde_json::to_vec(&trimmed).context("failed to serialize trimmed document")?;
    store.put(name, &bytes).await?;
    stats.record_sync(name, prev_size, bytes.len() as u64).await;
    Ok(())
}

fn is_metadata_doc(doc: &Value) -> bool {
    doc.get("versions").is_some_and(Value::is_object)
        && doc.get("dist-tags").is_some_and(Value::is_object)
}

/// Render a feed sequence value as the canonical cursor string.
fn seq_to_string(seq: &Value) -> String {
    match seq {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Whether `candidate` may replace `current`.  Numeric cursors never go
/// backwards; non-numeric cursors advance on any change.
fn cursor_advances(current: &str, candidate: &str) -> bool {
    match (current.parse::<u64>(), candidate.parse::<u64>()) {
        (Ok(current), Ok(candidate)) => candidate > current,
        _ => candidate != current,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn seq_rendering() {
        assert_eq!(seq_to_string(&json!(42)), "42");
        assert_eq!(seq_to_string(&json!("42-abcdef")), "42-abcdef");
    }

    #[test]
    fn numeric_cursor_never_decreases() {
        assert!(cursor_advances("0", "42"));
        assert!(cursor_advances("42", "43"));
        assert!(!cursor_advances("43", "42"));
        assert!(!cursor_advances("42", "42"));
    }

    #[test]
    fn opaque_cursor_advances_on_change() {
        assert!(cursor_advances("0", "42-g1AAAA"));
        assert!(!cursor_advances("42-g1AAAA", "42-g1AAAA"));
    }

    #[test]
    fn metadata_shape_check() {
        assert!(is_metadata_doc(&json!({
            "dist-tags": {"latest": "1.0.0"},
            "versions": {"1.0.0": {}}
        })));
        assert!(!is_metadata_doc(&json!({"error": "Not found"})));
        assert!(!is_metadata_doc(&json!({"dist-tags": {}, "versions": "?"})));
    }
}
