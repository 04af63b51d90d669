use crate::core::CoreEvent;
use axum::{
    extract::{Path, State},
    http::{Method, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use mixify_proto::protocol::WatchCommand;
use mixify_proto::state::{StatusBoard, WatchStatus};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    board: StatusBoard,
    event_tx: mpsc::Sender<CoreEvent>,
}

pub fn router(board: StatusBoard, event_tx: mpsc::Sender<CoreEvent>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST]);

    Router::new()
        .route("/api/state", get(get_state))
        .route("/api/watch/start/:event_id", post(start_watch))
        .route("/api/watch/stop", post(stop_watch))
        .route("/api/watch/switch", post(switch_session))
        .layer(cors)
        .with_state(HttpState { board, event_tx })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    board: StatusBoard,
    event_tx: mpsc::Sender<CoreEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(board, event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("Control API listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_state(State(state): State<HttpState>) -> Json<WatchStatus> {
    Json(state.board.get().await)
}

async fn start_watch(
    State(state): State<HttpState>,
    Path(event_id): Path<String>,
) -> StatusCode {
    info!("HTTP API: start watching {}", event_id);
    forward(&state, WatchCommand::Start { event_id }).await
}

async fn stop_watch(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: stop");
    forward(&state, WatchCommand::Stop).await
}

async fn switch_session(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: switch session");
    forward(&state, WatchCommand::Switch).await
}

async fn forward(state: &HttpState, cmd: WatchCommand) -> StatusCode {
    if state.event_tx.send(CoreEvent::Command(cmd)).await.is_err() {
        error!("Failed to forward command: core loop gone");
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::ACCEPTED
}
