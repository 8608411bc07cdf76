//! In-process stand-in for the enhancement backend.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use tokio::net::TcpListener;

pub const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

/// What the fake saw, for assertions.
#[derive(Default)]
pub struct Seen {
    pub gets: Vec<HashMap<String, String>>,
    /// (content type, body length) per POST.
    pub posts: Vec<(String, usize)>,
    pub configs: Vec<serde_json::Value>,
    pub downloads: Vec<serde_json::Value>,
    pub cache_clears: usize,
    pub shutdowns: usize,
}

pub type Shared = Arc<Mutex<Seen>>;

/// Behaviour is keyed on the `url` parameter:
/// `soft` answers 200 with an error header, `boom` answers 500,
/// `missing` answers 404, `empty` answers an empty body.
async fn enhance_get(
    State(seen): State<Shared>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    let url = q.get("url").cloned().unwrap_or_default();
    seen.lock().unwrap().gets.push(q);
    if url.contains("soft") {
        return (
            [("content-type", "image/jpeg"), ("x-mu-host-error", "model crashed")],
            PNG,
        )
            .into_response();
    }
    if url.contains("boom") {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    if url.contains("missing") {
        return StatusCode::NOT_FOUND.into_response();
    }
    if url.contains("empty") {
        return ([("content-type", "image/png")], Bytes::new()).into_response();
    }
    (
        [("content-type", "image/png; charset=binary"), ("x-mu-model", "esrgan-x2")],
        PNG,
    )
        .into_response()
}

async fn enhance_post(State(seen): State<Shared>, headers: HeaderMap, body: Bytes) -> Response {
    let ct = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    seen.lock().unwrap().posts.push((ct, body.len()));
    ([("content-type", "image/png"), ("x-mu-model", "esrgan-x2")], PNG).into_response()
}

async fn config(State(seen): State<Shared>, Json(v): Json<serde_json::Value>) -> StatusCode {
    seen.lock().unwrap().configs.push(v);
    StatusCode::OK
}

async fn download(State(seen): State<Shared>, Json(v): Json<serde_json::Value>) -> StatusCode {
    seen.lock().unwrap().downloads.push(v);
    StatusCode::ACCEPTED
}

async fn clear(State(seen): State<Shared>) -> StatusCode {
    seen.lock().unwrap().cache_clears += 1;
    StatusCode::OK
}

async fn shutdown(State(seen): State<Shared>) -> StatusCode {
    seen.lock().unwrap().shutdowns += 1;
    StatusCode::OK
}

/// Serve the fake on an ephemeral port.  Returns its base URL.
pub async fn spawn() -> (String, Shared) {
    let seen: Shared = Arc::default();
    let app = Router::new()
        .route("/enhance", get(enhance_get).post(enhance_post))
        .route("/health", get(|| async { StatusCode::OK }))
        .route("/config", post(config))
        .route("/models/download", post(download))
        .route("/cache/clear", post(clear))
        .route("/shutdown", post(shutdown))
        .with_state(seen.clone());
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake backend");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{}", addr), seen)
}

/// A base URL nothing listens on.
pub async fn dead_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind probe port");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{}", addr)
}
