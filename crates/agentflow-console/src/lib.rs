use anyhow::{Context, Result, bail};
use axum::Router;
use axum::routing::{get, post};
use libagentflow::{EventBus, RunSupervisor};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

mod api;
pub mod config;
mod sse;

pub struct AppState {
    pub supervisor: RunSupervisor,
    pub bus: EventBus,
}

impl AppState {
    pub fn new(supervisor: RunSupervisor) -> Self {
        let bus = supervisor.bus().clone();
        Self { supervisor, bus }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/fire", post(api::fire_start))
        .route("/api/fire/stop", post(api::fire_stop))
        .route("/api/stream", get(sse::stream))
        .route("/api/ping", post(api::ping))
        .layer(TraceLayer::new_for_http())
        .with_state(Arc::new(state))
}

/// Bind a loopback-only listener and return it with its base URL.
///
/// Port 0 picks a free port.
pub async fn listen_local(port: u16) -> Result<(TcpListener, String)> {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(err) if err.kind() == io::ErrorKind::AddrInUse => {
            bail!("port {port} is already in use")
        }
        Err(err) => return Err(err).with_context(|| format!("failed to listen on {addr}")),
    };
    let actual = listener.local_addr()?;
    Ok((listener, format!("http://{}:{}", actual.ip(), actual.port())))
}
