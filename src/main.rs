use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use regcache::config::{self, Config};
use regcache::prefetch::Prefetcher;
use regcache::stats::StatsSink;
use regcache::store::CacheStore;
use regcache::sync::ChangeSync;
use regcache::upstream::UpstreamClient;
use regcache::{http, AppState};

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(name = "regcache", about = "Caching reverse proxy for npm registry metadata")]
struct Cli {
    /// Path to the YAML configuration file.  All settings have defaults;
    /// without this flag the built-in configuration is used.
    #[arg(short, long)]
    config: Option<PathBuf>,
}

// ---------------------------------------------------------------------------
// HTTP server
// ---------------------------------------------------------------------------

async fn run_http_server(state: Arc<AppState>) -> Result<()> {
    let app = http::handler::create_router(Arc::clone(&state));

    let listen_addr: std::net::SocketAddr = state
        .config
        .proxy
        .listen
        .parse()
        .context("invalid listen address")?;

    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    tracing::info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    Ok(())
}

// ---------------------------------------------------------------------------
// Graceful shutdown
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("received SIGINT"),
        () = terminate => tracing::info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // ---- CLI ----
    let cli = Cli::parse();

    // ---- Config ----
    let config: Config = config::load_config(cli.config.as_deref())?;
    let config = Arc::new(config);

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!(
        registry = %config.upstream.registry_url,
        cache_dir = %config.storage.cache_dir.display(),
        "starting regcache"
    );

    // ---- Storage ----
    let store = CacheStore::open(&config.storage.cache_dir)?;
    let stats = StatsSink::open(&config.storage.data_dir).await?;

    // ---- Upstream clients ----
    let http_client = reqwest::Client::builder()
        .user_agent(concat!("regcache/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build reqwest client")?;
    let upstream = UpstreamClient::new(http_client.clone(), &config.upstream);

    // ---- Prefetcher ----
    let prefetcher = Arc::new(Prefetcher::new(
        upstream.clone(),
        store.clone(),
        stats.clone(),
        config.prefetch.max_concurrent,
        config.prefetch.max_packages,
    ));

    // ---- App state ----
    let state = Arc::new(AppState {
        config: Arc::clone(&config),
        http_client,
        store: store.clone(),
        stats: stats.clone(),
        prefetcher,
        tasks: TaskTracker::new(),
    });

    // ---- Change synchronizer ----
    let shutdown = CancellationToken::new();
    let sync_handle = if config.sync.enabled {
        let sync = ChangeSync::new(&config, upstream, store, stats);
        let token = shutdown.clone();
        Some(tokio::spawn(async move { sync.run(token).await }))
    } else {
        tracing::info!("change synchronizer disabled");
        None
    };

    // ---- Serve until a signal arrives ----
    let serve_result = run_http_server(Arc::clone(&state)).await;

    // ---- Wind down background work with a bounded grace period ----
    shutdown.cancel();
    state.tasks.close();
    let grace = Duration::from_secs(config.proxy.shutdown_grace_secs);
    let drain = async {
        state.tasks.wait().await;
        if let Some(handle) = sync_handle {
            let _ = handle.await;
        }
    };
    if tokio::time::timeout(grace, drain).await.is_err() {
        tracing::warn!(
            grace_secs = grace.as_secs(),
            "grace period elapsed with background tasks still running"
        );
    }

    serve_result?;
    tracing::info!("regcache shut down cleanly");
    Ok(())
}
