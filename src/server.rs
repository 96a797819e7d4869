use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::{broadcast::error::RecvError, RwLock};
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::{
    config::ServerConfig,
    engine::{self, ScanMode},
    hub::LogHub,
    types::{
        validate_target, ErrorBody, HealthReport, ScanTask, StartScanRequest, StartScanResponse,
        TaskId, TaskStatus,
    },
};

#[derive(Clone)]
pub struct AppState {
    inner: Arc<RwLock<ServerState>>, // task registry and the running scan
    hub: LogHub,
    config: Arc<ServerConfig>,
}

#[derive(Debug, Default)]
struct ServerState {
    tasks: Vec<ScanTask>,
    active: Option<ActiveScan>,
}

#[derive(Debug)]
struct ActiveScan {
    task_id: TaskId,
    cancel: CancellationToken,
}

impl AppState {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(ServerState::default())),
            hub: LogHub::new(config.log_history),
            config: Arc::new(config),
        }
    }

    async fn set_status(&self, id: &TaskId, status: TaskStatus) {
        let mut s = self.inner.write().await;
        if let Some(task) = s.tasks.iter_mut().find(|t| &t.id == id) {
            if task.status.can_transition_to(status) {
                task.status = status;
            }
        }
    }

    async fn run_task(self, id: TaskId, target: String, mode: ScanMode, cancel: CancellationToken) {
        if cancel.is_cancelled() {
            debug!(task = %id, "scan replaced before it started");
            self.set_status(&id, TaskStatus::Failed).await;
            return;
        }
        self.set_status(&id, TaskStatus::Running).await;
        let outcome = engine::run_scan(&target, &mode, &self.hub, cancel.clone()).await;
        let status = match outcome {
            Ok(()) => {
                info!(task = %id, scan_target = %target, "scan completed");
                TaskStatus::Completed
            }
            Err(e) => {
                warn!(task = %id, scan_target = %target, error = %e, "scan failed");
                // A cancelled scan was replaced; its error must not leak into the new feed.
                if !cancel.is_cancelled() {
                    self.hub.publish(format!("Scan failed: {e:#}")).await;
                }
                TaskStatus::Failed
            }
        };
        self.set_status(&id, status).await;

        let mut s = self.inner.write().await;
        if s.active.as_ref().is_some_and(|a| a.task_id == id) {
            s.active = None;
        }
    }
}

/// All API routes, with CORS for the dashboard origin and request tracing.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.frontend_url);
    Router::new()
        .route("/health", get(health_check))
        .route("/scan/start", post(start_scan))
        .route("/scan/tasks", get(list_tasks))
        .route("/scan/tasks/{id}", get(get_task))
        .route("/ws/logs", get(ws_logs))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn cors_layer(origin: &str) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    match HeaderValue::from_str(origin.trim_end_matches('/')) {
        Ok(value) => layer.allow_origin(AllowOrigin::exact(value)),
        Err(_) => {
            warn!(origin, "unusable frontend origin, allowing any");
            layer.allow_origin(Any)
        }
    }
}

/// Bind `config.bind_addr()` and serve until Ctrl+C.
pub async fn spawn_server(config: ServerConfig) -> Result<()> {
    let bind = config.bind_addr();
    let listener = TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    serve(listener, config, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await
}

/// Serve the API on an already bound listener until `shutdown` resolves.
pub async fn serve(
    listener: TcpListener,
    config: ServerConfig,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr = listener.local_addr()?;
    let tool = config.tool_status();
    info!(%addr, nmap = ?tool, "scan API listening");
    if !tool.is_usable() {
        warn!(path = %config.nmap_path, "nmap not found; scans will be rejected");
    }
    let app = router(AppState::new(config));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .context("server error")?;
    Ok(())
}

fn error_response(status: StatusCode, detail: impl Into<String>) -> Response {
    (status, Json(ErrorBody { detail: detail.into() })).into_response()
}

async fn health_check(State(app): State<AppState>) -> Json<HealthReport> {
    let mut tools = BTreeMap::new();
    tools.insert("nmap".to_string(), app.config.tool_status());
    Json(HealthReport {
        status: "healthy".into(),
        tools,
    })
}

async fn start_scan(State(app): State<AppState>, Json(req): Json<StartScanRequest>) -> Response {
    let target = match validate_target(&req.target) {
        Ok(t) => t,
        Err(e) => return error_response(StatusCode::BAD_REQUEST, e.to_string()),
    };
    if !app.config.tool_status().is_usable() {
        return error_response(StatusCode::BAD_REQUEST, "nmap is not available");
    }

    let task = ScanTask::queued(TaskId::generate(), target.clone());
    let cancel = CancellationToken::new();
    {
        let mut s = app.inner.write().await;
        // One scan at a time: the new one replaces whatever is running.
        if let Some(prev) = s.active.take() {
            info!(task = %prev.task_id, "cancelling previous scan");
            prev.cancel.cancel();
        }
        s.tasks.push(task.clone());
        s.active = Some(ActiveScan {
            task_id: task.id.clone(),
            cancel: cancel.clone(),
        });
    }
    // Cleared before responding so a subscriber connecting after the
    // response never sees the previous scan's backlog.
    app.hub.reset().await;

    info!(task = %task.id, scan_target = %target, "scan accepted");
    let mode = app.config.scan_mode();
    tokio::spawn(app.clone().run_task(task.id.clone(), target.clone(), mode, cancel));

    (
        StatusCode::ACCEPTED,
        Json(StartScanResponse {
            task_id: task.id,
            target,
            message: "scan started".into(),
        }),
    )
        .into_response()
}

async fn list_tasks(State(app): State<AppState>) -> Json<Vec<ScanTask>> {
    Json(app.inner.read().await.tasks.clone())
}

async fn get_task(State(app): State<AppState>, Path(id): Path<String>) -> Response {
    let s = app.inner.read().await;
    match s.tasks.iter().find(|t| t.id.as_str() == id) {
        Some(task) => (StatusCode::OK, Json(task.clone())).into_response(),
        None => error_response(StatusCode::NOT_FOUND, format!("unknown task: {id}")),
    }
}

async fn ws_logs(ws: WebSocketUpgrade, State(app): State<AppState>) -> impl IntoResponse {
    let hub = app.hub.clone();
    ws.on_upgrade(move |socket| stream_logs(socket, hub))
}

/// Push the current backlog, then every new line, one text message per line.
async fn stream_logs(socket: WebSocket, hub: LogHub) {
    let (backlog, mut lines) = hub.subscribe().await;
    let (mut sink, mut incoming) = socket.split();
    debug!(backlog = backlog.len(), "log subscriber connected");

    for line in backlog {
        if sink.send(Message::Text(line.into())).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            line = lines.recv() => {
                let text = match line {
                    Ok(text) => text,
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "log subscriber lagged");
                        format!("[{skipped} log lines skipped]")
                    }
                    Err(RecvError::Closed) => break,
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            frame = incoming.next() => match frame {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("log subscriber disconnected");
}
