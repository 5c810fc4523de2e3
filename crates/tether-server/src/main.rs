//! tetherd: the terminal session daemon.
//!
//! Serves the session registry over HTTP and terminal attachments over
//! WebSocket. Configuration comes from the environment:
//!
//! - `TETHER_ADDR`  — listen address, default `127.0.0.1:7070`
//! - `TETHER_DB`    — registry path, default `~/.tether/tether.db`
//! - `TETHER_SHELL` — shell to spawn, default the user's login shell
//! - `TETHER_LOG`   — log level filter, default `info`

mod error;
mod routes;
mod state;
mod ws;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use log::{info, LevelFilter};
use simplelog::{ColorChoice, Config, TermLogger, TerminalMode};

use tether_gateway::{Gateway, GatewayConfig};

use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();

    let db_path = std::env::var("TETHER_DB")
        .map(PathBuf::from)
        .unwrap_or_else(|_| default_db_path());
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let db = Arc::new(Mutex::new(tether_db::open(&db_path)?));

    let gateway = Arc::new(Gateway::new(
        Arc::clone(&db),
        GatewayConfig {
            shell: std::env::var("TETHER_SHELL").ok(),
            cwd: None,
        },
    ));

    let app = routes::router(AppState { db, gateway });

    let addr: SocketAddr = std::env::var("TETHER_ADDR")
        .unwrap_or_else(|_| "127.0.0.1:7070".to_string())
        .parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("listening on {addr}, registry at {}", db_path.display());
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_logging() {
    let level = std::env::var("TETHER_LOG")
        .ok()
        .and_then(|s| s.parse::<LevelFilter>().ok())
        .unwrap_or(LevelFilter::Info);
    let _ = TermLogger::init(
        level,
        Config::default(),
        TerminalMode::Mixed,
        ColorChoice::Auto,
    );
}

fn default_db_path() -> PathBuf {
    std::env::var("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("."))
        .join(".tether")
        .join("tether.db")
}
