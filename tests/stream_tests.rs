use std::net::SocketAddr;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use reqwest::Url;
use scan_console_rs::stream::{LogStreamClient, StreamEvent};
use tokio::sync::mpsc;
use tokio::time::timeout;

mod common;

async fn send_lines(socket: &mut WebSocket, lines: &[&str]) {
    for line in lines {
        socket.send(Message::Text((*line).into())).await.unwrap();
    }
}

async fn lines_then_close(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        send_lines(&mut socket, &["Starting scan...", "Found port 80 open"]).await;
        let _ = socket.send(Message::Close(None)).await;
    })
}

async fn line_then_drop(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move {
        send_lines(&mut socket, &["partial"]).await;
        drop(socket);
    })
}

async fn hold_open(ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(|mut socket| async move { while let Some(Ok(_)) = socket.recv().await {} })
}

async fn stub_stream() -> SocketAddr {
    let app = Router::new()
        .route("/clean", get(lines_then_close))
        .route("/drop", get(line_then_drop))
        .route("/hold", get(hold_open));
    common::spawn_router(app).await
}

fn ws_url(addr: SocketAddr, path: &str) -> Url {
    format!("ws://{addr}{path}").parse().unwrap()
}

/// Collect events until the connection reports Closed or Errored.
async fn collect_until_end(rx: &mut mpsc::Receiver<StreamEvent>) -> Vec<StreamEvent> {
    let mut events = Vec::new();
    while let Ok(Some(event)) = timeout(Duration::from_secs(5), rx.recv()).await {
        let end = matches!(event, StreamEvent::Closed(_) | StreamEvent::Errored { .. });
        events.push(event);
        if end {
            break;
        }
    }
    events
}

#[tokio::test]
async fn lines_arrive_in_order_then_clean_close() {
    let addr = stub_stream().await;
    let (tx, mut rx) = mpsc::channel(16);
    let mut client = LogStreamClient::new(tx);
    let id = client.open(&ws_url(addr, "/clean"));

    let events = collect_until_end(&mut rx).await;
    assert_eq!(
        events,
        vec![
            StreamEvent::Opened(id),
            StreamEvent::Line { id, text: "Starting scan...".into() },
            StreamEvent::Line { id, text: "Found port 80 open".into() },
            StreamEvent::Closed(id),
        ]
    );
}

#[tokio::test]
async fn drop_without_close_frame_is_an_error() {
    let addr = stub_stream().await;
    let (tx, mut rx) = mpsc::channel(16);
    let mut client = LogStreamClient::new(tx);
    let id = client.open(&ws_url(addr, "/drop"));

    let events = collect_until_end(&mut rx).await;
    assert_eq!(events[0], StreamEvent::Opened(id));
    assert_eq!(events[1], StreamEvent::Line { id, text: "partial".into() });
    assert!(matches!(events.last(), Some(StreamEvent::Errored { id: e, .. }) if *e == id));
}

#[tokio::test]
async fn connect_failure_is_reported_once() {
    let addr = common::closed_port().await;
    let (tx, mut rx) = mpsc::channel(16);
    let mut client = LogStreamClient::new(tx);
    let id = client.open(&ws_url(addr, "/ws/logs"));

    let events = collect_until_end(&mut rx).await;
    assert_eq!(events.len(), 1);
    assert!(matches!(&events[0], StreamEvent::Errored { id: e, .. } if *e == id));
}

#[tokio::test]
async fn open_is_a_no_op_while_active_and_close_is_idempotent() {
    let addr = stub_stream().await;
    let (tx, mut rx) = mpsc::channel(16);
    let mut client = LogStreamClient::new(tx);
    let url = ws_url(addr, "/hold");

    let id = client.open(&url);
    assert_eq!(
        timeout(Duration::from_secs(5), rx.recv()).await.unwrap(),
        Some(StreamEvent::Opened(id))
    );
    assert_eq!(client.open(&url), id);

    assert_eq!(client.close(), Some(id));
    assert_eq!(client.close(), None);
    assert_eq!(client.current(), None);

    // A deliberate close produces no further events for that connection.
    assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());

    let next = client.open(&url);
    assert_ne!(next, id);
}

#[tokio::test]
async fn close_during_handshake_is_safe() {
    let addr = stub_stream().await;
    let (tx, mut rx) = mpsc::channel(16);
    let mut client = LogStreamClient::new(tx);
    client.open(&ws_url(addr, "/hold"));
    client.close();
    client.close();

    // At most the Opened event can slip through; never a line or an error.
    while let Ok(Some(event)) = timeout(Duration::from_millis(200), rx.recv()).await {
        assert!(matches!(event, StreamEvent::Opened(_)), "{event:?}");
    }
}
