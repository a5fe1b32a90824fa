mod cache;
mod config;
mod disk;
mod http;
mod metrics;
mod prefetch;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{CommandFactory, Parser};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::cache::CacheLayout;
use crate::config::{Repo, RepoFlags};
use crate::metrics::MetricsRegistry;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser, Debug)]
#[command(
    name = "artifactcache",
    about = "Read-through caching reverse proxy for artifact repositories"
)]
struct Cli {
    /// TCP port for the proxy and the /metrics endpoint.
    #[arg(long = "listen_port", default_value_t = 8080)]
    listen_port: u16,

    /// Repo definition (repeatable).
    /// Example: --upstream_url mynex=https://nexus.example.com/repository/bin
    #[arg(long = "upstream_url", value_name = "REPO=URL")]
    upstream_url: Vec<String>,

    /// Prefetch definition (repeatable), as <repo>=<type>=<base-url> with
    /// type one of generic, nexus.
    /// Example: --prefetch mynex=nexus=https://nexus.example.com/service/rest/v1/assets?repository=bin
    #[arg(long = "prefetch", value_name = "REPO=TYPE=URL")]
    prefetch: Vec<String>,

    /// Prefetch include pattern (repeatable); a file is considered when any
    /// include matches. Example: --prefetch_include mynex=\.jar$
    #[arg(long = "prefetch_include", value_name = "REPO=REGEX")]
    prefetch_include: Vec<String>,

    /// Prefetch exclude pattern (repeatable); a matching file is never
    /// prefetched. Example: --prefetch_exclude mynex=^old_
    #[arg(long = "prefetch_exclude", value_name = "REPO=REGEX")]
    prefetch_exclude: Vec<String>,

    /// Remove cached files older than this age (repeatable, per repo).
    /// Accepts humantime units. Example: --gc_max_age mynex=12h
    #[arg(long = "gc_max_age", value_name = "REPO=DURATION")]
    gc_max_age: Vec<String>,
}

// ---------------------------------------------------------------------------
// Shared application state
// ---------------------------------------------------------------------------

/// Global state shared across all request handlers and background tasks.
/// Immutable after startup; the filesystem is the only mutable surface.
pub struct AppState {
    pub repos: HashMap<String, Repo>,
    pub metrics: MetricsRegistry,
    pub http_client: reqwest::Client,
    pub cache: CacheLayout,
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
        () = ctrl_c => info!("received SIGINT"),
        () = terminate => info!("received SIGTERM"),
    }
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    // Refuse to run unconfigured: a proxy with no repos serves nothing.
    if std::env::args().len() <= 1 {
        Cli::command().print_help().context("failed to print help")?;
        std::process::exit(1);
    }
    let cli = Cli::parse();

    // ---- Tracing ----
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // ---- Repo registry ----
    let repos = config::build_repos(&RepoFlags {
        upstream_url: cli.upstream_url,
        prefetch: cli.prefetch,
        prefetch_include: cli.prefetch_include,
        prefetch_exclude: cli.prefetch_exclude,
        gc_max_age: cli.gc_max_age,
    })?;
    if repos.is_empty() {
        bail!("need at least one repo defined with --upstream_url");
    }
    for repo in repos.values() {
        info!(
            repo = %repo.name,
            upstream = %repo.upstream_base,
            gc_max_age = ?repo.gc_max_age,
            prefetch = ?repo.prefetch,
            includes = repo.include.len(),
            excludes = repo.exclude.len(),
            "repo configured"
        );
    }

    // ---- Cache layout ----
    let cache = CacheLayout::new("cache");
    for name in repos.keys() {
        cache.ensure_repo_dirs(name).await?;
    }

    // ---- Metrics and HTTP client ----
    let metrics = MetricsRegistry::new();
    let http_client = reqwest::Client::builder()
        .user_agent(prefetch::USER_AGENT)
        .build()
        .context("failed to build upstream HTTP client")?;

    // ---- App state ----
    let state = Arc::new(AppState {
        repos,
        metrics,
        http_client,
        cache,
    });

    disk::update_free_disk_space(&state.metrics.metrics, &state.cache.root);

    // ---- Background tasks ----
    let (stop_tx, stop_rx) = watch::channel(false);

    let prefetcher = prefetch::Prefetcher::new(Arc::clone(&state))?;
    let prefetch_handle = tokio::spawn(prefetcher.run(stop_rx.clone()));

    let gc = cache::gc::GcScanner::new(Arc::clone(&state));
    let gc_handle = tokio::spawn(gc.run(stop_rx));

    // ---- HTTP server ----
    let app = http::handler::create_router(Arc::clone(&state));
    let listen_addr = std::net::SocketAddr::from(([0, 0, 0, 0], cli.listen_port));
    let listener = tokio::net::TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {listen_addr}"))?;

    info!(%listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    // Background tasks exit at their next pass boundary.
    let _ = stop_tx.send(true);
    let _ = tokio::try_join!(prefetch_handle, gc_handle);

    info!("artifactcache shut down cleanly");
    Ok(())
}
