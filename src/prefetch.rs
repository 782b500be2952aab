//! Dependency-tree prefetcher.
//!
//! When a miss brings in a fresh document, the prefetcher walks the
//! dependency graph of its `latest` version breadth-first and warms the
//! cache with everything it finds, bounded by a fetch budget and a
//! concurrency semaphore.  Peer dependencies can form cycles; the
//! per-walk visited set is what guarantees termination, the budget is a
//! guardrail.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, warn};

use crate::stats::StatsSink;
use crate::store::CacheStore;
use crate::trim::trim;
use crate::upstream::UpstreamClient;

/// Dependency kinds unioned into the walk frontier.
const DEPENDENCY_KINDS: &[&str] = &["dependencies", "optionalDependencies", "peerDependencies"];

pub struct Prefetcher {
    upstream: UpstreamClient,
    store: CacheStore,
    stats: StatsSink,
    /// Bounds concurrent upstream fetches across all walks.
    semaphore: Arc<Semaphore>,
    /// Packages currently being fetched by any walk; overlapping walks
    /// must not fetch the same package twice in parallel.
    inflight: Arc<DashMap<String, ()>>,
    max_packages: usize,
}

impl Prefetcher {
    pub fn new(
        upstream: UpstreamClient,
        store: CacheStore,
        stats: StatsSink,
        max_concurrent: usize,
        max_packages: usize,
    ) -> Self {
        Self {
            upstream,
            store,
            stats,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            inflight: Arc::new(DashMap::new()),
            max_packages,
        }
    }

    /// Kick off a best-effort walk rooted at `doc`.  Never blocks the
    /// caller; all failures stay inside the walk.
    pub fn spawn_walk(self: &Arc<Self>, doc: Value) {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.walk(doc).await });
    }

    /// Breadth-first traversal of the dependency graph under `root`.
    pub async fn walk(self: Arc<Self>, root: Value) {
        let mut queue: VecDeque<String> = latest_dependencies(&root).into();
        let mut visited: HashSet<String> = HashSet::new();
        let mut budget = self.max_packages;
        let mut tasks: JoinSet<Vec<String>> = JoinSet::new();

        while !queue.is_empty() || !tasks.is_empty() {
            while budget > 0 {
                let Some(name) = queue.pop_front() else { break };
                if !visited.insert(name.clone()) {
                    continue;
                }
                budget -= 1;
                let this = Arc::clone(&self);
                tasks.spawn(async move { this.fetch_one(name).await });
            }

            match tasks.join_next().await {
                Some(Ok(dependencies)) => queue.extend(dependencies),
                Some(Err(e)) => warn!(error = %e, "prefetch task panicked"),
                None => break,
            }
        }

        debug!(
            fetched = self.max_packages - budget,
            "prefetch walk finished"
        );
    }

    /// Fetch, trim and cache one package, returning the dependency names
    /// to continue the walk with.  Every failure mode confines itself to
    /// this branch.
    async fn fetch_one(&self, name: String) -> Vec<String> {
        if !crate::store::is_valid_name(&name) {
            return Vec::new();
        }

        let Some(_inflight) = InflightGuard::acquire(&self.inflight, &name) else {
            // Another walk is already fetching this package.
            return Vec::new();
        };

        match self.store.contains(&name).await {
            Ok(false) => {}
            Ok(true) => return Vec::new(),
            Err(e) => {
                warn!(package = %name, error = %e, "prefetch cache probe failed");
                return Vec::new();
            }
        }

        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return Vec::new(),
        };

        let fetched = match self.upstream.fetch_metadata(&name).await {
            Ok(fetched) => fetched,
            Err(e) => {
                debug!(package = %name, error = %e, "prefetch fetch failed");
                return Vec::new();
            }
        };

        let trimmed = trim(&fetched.doc);
        let bytes = match serde_json::to_vec(&trimmed) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(package = %name, error = %e, "prefetch serialization failed");
                return Vec::new();
            }
        };

        if let Err(e) = self.store.put(&name, &bytes).await {
            warn!(package = %name, error = %e, "prefetch cache write failed");
            return Vec::new();
        }
        self.stats
            .record_prefetch(&name, fetched.raw_len, bytes.len() as u64)
            .await;

        latest_dependencies(&fetched.doc)
    }
}

/// RAII membership in the process-wide inflight set.
struct InflightGuard {
    set: Arc<DashMap<String, ()>>,
    name: String,
}

impl InflightGuard {
    fn acquire(set: &Arc<DashMap<String, ()>>, name: &str) -> Option<Self> {
        use dashmap::mapref::entry::Entry;
        match set.entry(name.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Some(Self {
                    set: Arc::clone(set),
                    name: name.to_string(),
                })
            }
        }
    }
}

impl Drop for InflightGuard {
    fn drop(&mut self) {
        self.set.remove(&self.name);
    }
}

/// Union of the dependency names declared by the `latest` version of a
/// document, in declaration order, deduplicated.
pub fn latest_dependencies(doc: &Value) -> Vec<String> {
    let Some(version) = doc
        .get("dist-tags")
        .and_then(|tags| tags.get("latest"))
        .and_then(Value::as_str)
    else {
        return Vec::new();
    };
    let Some(entry) = doc.get("versions").and_then(|versions| versions.get(version)) else {
        return Vec::new();
    };

    let mut seen = HashSet::new();
    let mut names = Vec::new();
    for kind in DEPENDENCY_KINDS {
        if let Some(map) = entry.get(*kind).and_then(Value::as_object) {
            for name in map.keys() {
                if seen.insert(name.clone()) {
                    names.push(name.clone());
                }
            }
        }
    }
    names
}
