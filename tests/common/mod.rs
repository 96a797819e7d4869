#![allow(dead_code)]

use std::net::SocketAddr;

use axum::Router;
use scan_console_rs::config::{ClientConfig, ServerConfig};
use scan_console_rs::server;
use tokio::net::TcpListener;

/// Serve `app` on an ephemeral local port.
pub async fn spawn_router(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// Run the real backend in mock mode with `step_ms` between lines.
pub async fn spawn_backend(step_ms: u64) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let config = ServerConfig {
        host: "127.0.0.1".into(),
        port: addr.port(),
        nmap_path: "mock".into(),
        mock_step_ms: step_ms,
        ..ServerConfig::default()
    };
    tokio::spawn(server::serve(listener, config, std::future::pending()));
    addr
}

/// An address nothing listens on.
pub async fn closed_port() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

pub fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(format!("http://{addr}").parse().unwrap())
}
