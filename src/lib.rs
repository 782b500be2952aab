//! regcache — a caching reverse proxy for npm registry metadata.
//!
//! Package managers ask the registry for per-package metadata documents
//! that are dominated by fields irrelevant to dependency resolution.
//! regcache forwards cache misses to the upstream registry, streams the
//! response straight back to the client, and asynchronously stores a
//! trimmed copy that is served for every subsequent request — typically
//! 30-90% smaller than the original.  A background synchronizer tails the
//! registry changes feed so cached entries stay current, and a prefetcher
//! optionally warms the dependency closure of freshly fetched packages.

pub mod config;
pub mod http;
pub mod prefetch;
pub mod stats;
pub mod store;
pub mod strip;
pub mod sync;
pub mod trim;
pub mod upstream;

use std::sync::Arc;

use tokio_util::task::TaskTracker;

/// Global state shared across all request handlers and background tasks.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Config>,
    pub http_client: reqwest::Client,
    pub store: store::CacheStore,
    pub stats: stats::StatsSink,
    pub prefetcher: Arc<prefetch::Prefetcher>,
    /// Tracks in-flight miss/strip tasks so shutdown can grant them a
    /// bounded grace period.
    pub tasks: TaskTracker,
}
