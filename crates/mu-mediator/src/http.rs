use crate::core::{ConsumerStatus, MediatorEvent};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use mu_proto::protocol::Command;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

#[derive(Clone)]
struct HttpState {
    event_tx: mpsc::Sender<MediatorEvent>,
}

pub fn router(event_tx: mpsc::Sender<MediatorEvent>) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/process", post(process))
        .route("/api/preload/:count", post(preload))
        .layer(CorsLayer::permissive())
        .with_state(HttpState { event_tx })
}

pub fn start_server(
    bind_address: String,
    port: u16,
    event_tx: mpsc::Sender<MediatorEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = router(event_tx);

        let addr = format!("{}:{}", bind_address, port);
        let listener = match TcpListener::bind(&addr).await {
            Ok(l) => l,
            Err(e) => {
                error!("Failed to bind HTTP server to {}: {}", addr, e);
                return;
            }
        };

        info!("HTTP API server listening on http://{}", addr);

        if let Err(e) = axum::serve(listener, app).await {
            error!("HTTP server error: {}", e);
        }
    })
}

async fn get_status(
    State(state): State<HttpState>,
) -> Result<Json<Vec<ConsumerStatus>>, StatusCode> {
    let (tx, rx) = oneshot::channel();
    if state
        .event_tx
        .send(MediatorEvent::QueryStatus(tx))
        .await
        .is_err()
    {
        error!("Failed to query status");
        return Err(StatusCode::INTERNAL_SERVER_ERROR);
    }
    rx.await
        .map(Json)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn process(State(state): State<HttpState>) -> StatusCode {
    info!("HTTP API: Process current item");
    forward(&state, Command::ProcessCurrentVisible).await
}

async fn preload(State(state): State<HttpState>, Path(count): Path<usize>) -> StatusCode {
    info!("HTTP API: Run with preload of {}", count);
    forward(&state, Command::RunWithPreload { count }).await
}

async fn forward(state: &HttpState, cmd: Command) -> StatusCode {
    if state
        .event_tx
        .send(MediatorEvent::ForActive(cmd))
        .await
        .is_err()
    {
        error!("Failed to forward command");
        return StatusCode::INTERNAL_SERVER_ERROR;
    }
    StatusCode::ACCEPTED
}
