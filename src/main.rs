//! # kustomize-atlas server
//!
//! Analyzes Kustomize overlay stacks across GitHub, GitLab and local
//! repositories and serves the resulting dependency graphs over a REST API.
//!
//! ```bash
//! # Listen on the default port 3000
//! kustomize-atlas
//!
//! # Custom port, with on-host repository analysis enabled
//! kustomize-atlas --port 8080 --enable-local
//! ```
//!
//! The port can also come from the `PORT` environment variable; the flag
//! wins when both are set.

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use kustomize_atlas::cacert::{Collector, DEFAULT_TTL};
use kustomize_atlas::server::{router, AppState};
use kustomize_atlas::storage::MemoryStore;

#[derive(Parser)]
#[command(name = "kustomize-atlas")]
#[command(about = "Kustomize overlay dependency graph server", long_about = None)]
#[command(version)]
struct Args {
    /// HTTP listener port (1-65535).
    #[arg(long, env = "PORT", default_value_t = 3000, value_parser = clap::value_parser!(u16).range(1..))]
    port: u16,

    /// Allow analyzing local directories under $HOME (and the browse
    /// endpoint). Off by default: the server then only accepts https URLs.
    #[arg(long)]
    enable_local: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "kustomize_atlas=info".into()),
        )
        .init();

    let args = Args::parse();

    let state = Arc::new(AppState {
        store: MemoryStore::new(),
        ca_collector: Collector::new(DEFAULT_TTL),
        local_enabled: args.enable_local,
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{}", args.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to listen on {addr}"))?;

    info!(addr = %addr, local_enabled = args.enable_local, "server listening");
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}
