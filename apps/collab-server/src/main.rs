//! Collaborative Drawing WebSocket Server
//! Relays element operations between the participants of each document session

mod api;
mod ws;

use axum::{routing::get, Router};
use clap::Parser;
use collaboration::{DocumentRepository, JsonFileRepository, MemoryRepository, Relay};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "collab-server")]
#[command(about = "Real-time collaboration server for shared vector drawings")]
#[command(version)]
struct Args {
    /// Address to listen on
    #[arg(long, env = "COLLAB_ADDR", default_value = "127.0.0.1:4000")]
    addr: SocketAddr,

    /// Directory holding one JSON file per document session
    #[arg(long, env = "COLLAB_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Keep documents in memory only
    #[arg(long)]
    ephemeral: bool,

    /// Tracing filter directives
    #[arg(long, env = "RUST_LOG", default_value = "collab_server=debug,collaboration=debug")]
    log_filter: String,
}

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub relay: Arc<Relay>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws::ws_handler))
        .route("/api/sessions", get(api::list_sessions))
        .route("/api/sessions/:id", get(api::get_session))
        .route("/api/stats", get(api::get_stats))
        // CORS for browser clients on other origins
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&args.log_filter)?)
        .init();

    let repository: Arc<dyn DocumentRepository> = if args.ephemeral {
        info!("Using in-memory document storage");
        Arc::new(MemoryRepository::new())
    } else {
        info!("Document storage at: {}", args.data_dir.display());
        Arc::new(JsonFileRepository::new(&args.data_dir))
    };

    let state = AppState {
        relay: Arc::new(Relay::new(repository)),
    };

    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!("Collaboration server listening on: {}", listener.local_addr()?);
    info!("  GET /ws                - WebSocket endpoint");
    info!("  GET /api/sessions      - List sessions");
    info!("  GET /api/sessions/:id  - Session details");
    info!("  GET /api/stats         - Relay counters");

    axum::serve(listener, router(state)).await?;

    Ok(())
}
