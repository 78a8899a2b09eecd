//! In-process fake ComfyUI server for integration tests.
//!
//! Serves the REST endpoints and the WebSocket the client talks to, records
//! what it received, and replays a scripted list of WebSocket frames to
//! every connecting client.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use nodeflow_comfyui::config::ClientConfig;
use serde_json::{json, Value};

/// One multipart upload as the server saw it.
#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub filename: String,
    pub content_type: Option<String>,
    pub kind: String,
    pub overwrite: String,
    pub bytes: Vec<u8>,
}

/// Scripted behaviour plus everything the server received.
#[derive(Default)]
pub struct FakeState {
    /// Fixed `/prompt` reply. Generates `{"prompt_id": "P<n>"}` when `None`.
    pub prompt_reply: Mutex<Option<Value>>,
    /// Status returned by `/prompt`.
    pub prompt_status: Mutex<Option<StatusCode>>,
    /// Raw `/prompt` request bodies.
    pub submitted: Mutex<Vec<Bytes>>,
    /// Whole `/history/{id}` document.
    pub history: Mutex<Value>,
    /// filename -> bytes served by `/view`. Unknown names get a 404.
    pub views: Mutex<HashMap<String, Vec<u8>>>,
    pub uploads: Mutex<Vec<UploadRecord>>,
    /// Frames sent to every WebSocket client right after the upgrade.
    pub ws_script: Mutex<Vec<Message>>,
    /// Keep the socket open after the script until the client closes it.
    pub ws_hold_open: Mutex<bool>,
    pub ws_client_ids: Mutex<Vec<String>>,
    pub queue_requests: Mutex<Vec<Value>>,
    pub interrupts: AtomicUsize,
    next_id: AtomicUsize,
}

impl FakeState {
    pub fn script_text(&self, frames: &[&str]) {
        let mut script = self.ws_script.lock().unwrap();
        script.extend(frames.iter().map(|frame| Message::Text((*frame).into())));
    }

    pub fn serve_view(&self, filename: &str, bytes: Vec<u8>) {
        self.views.lock().unwrap().insert(filename.to_string(), bytes);
    }
}

/// Start a fake server on an ephemeral port.
pub async fn spawn_server() -> (ClientConfig, Arc<FakeState>) {
    let state = Arc::new(FakeState::default());
    let app = Router::new()
        .route("/prompt", post(prompt))
        .route("/history/{prompt_id}", get(history))
        .route("/view", get(view))
        .route("/upload/image", post(upload))
        .route("/system_stats", get(system_stats))
        .route("/interrupt", post(interrupt))
        .route("/queue", post(queue))
        .route("/ws", get(ws))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (ClientConfig::new(format!("http://{addr}")), state)
}

/// Config pointing at a port nothing listens on.
pub async fn unreachable_config() -> ClientConfig {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    ClientConfig::new(format!("http://{addr}"))
}

/// A small valid PNG.
pub fn png_bytes() -> Vec<u8> {
    let image = image::DynamicImage::new_rgb8(2, 2);
    let mut out = std::io::Cursor::new(Vec::new());
    image.write_to(&mut out, image::ImageFormat::Png).unwrap();
    out.into_inner()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn prompt(State(state): State<Arc<FakeState>>, body: Bytes) -> Response {
    state.submitted.lock().unwrap().push(body);

    if let Some(status) = *state.prompt_status.lock().unwrap() {
        return (status, "queue full").into_response();
    }
    let reply = state.prompt_reply.lock().unwrap().clone();
    let reply = reply.unwrap_or_else(|| {
        let n = state.next_id.fetch_add(1, Ordering::SeqCst);
        json!({ "prompt_id": format!("P{n}"), "number": n, "node_errors": {} })
    });
    Json(reply).into_response()
}

async fn history(
    State(state): State<Arc<FakeState>>,
    Path(_prompt_id): Path<String>,
) -> Json<Value> {
    Json(state.history.lock().unwrap().clone())
}

async fn view(
    State(state): State<Arc<FakeState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let filename = params.get("filename").cloned().unwrap_or_default();
    match state.views.lock().unwrap().get(&filename) {
        Some(bytes) => bytes.clone().into_response(),
        None => (StatusCode::NOT_FOUND, "no such file").into_response(),
    }
}

async fn upload(State(state): State<Arc<FakeState>>, mut multipart: Multipart) -> Json<Value> {
    let mut record = UploadRecord {
        filename: String::new(),
        content_type: None,
        kind: String::new(),
        overwrite: String::new(),
        bytes: Vec::new(),
    };
    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                record.filename = field.file_name().unwrap_or_default().to_string();
                record.content_type = field.content_type().map(str::to_string);
                record.bytes = field.bytes().await.unwrap().to_vec();
            }
            "type" => record.kind = field.text().await.unwrap(),
            "overwrite" => record.overwrite = field.text().await.unwrap(),
            _ => {}
        }
    }
    let reply = json!({ "name": record.filename, "subfolder": "", "type": record.kind });
    state.uploads.lock().unwrap().push(record);
    Json(reply)
}

async fn system_stats() -> Json<Value> {
    Json(json!({ "system": { "os": "posix" }, "devices": [] }))
}

async fn interrupt(State(state): State<Arc<FakeState>>) -> StatusCode {
    state.interrupts.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

async fn queue(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> StatusCode {
    state.queue_requests.lock().unwrap().push(body);
    StatusCode::OK
}

async fn ws(
    ws: WebSocketUpgrade,
    State(state): State<Arc<FakeState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if let Some(client_id) = params.get("clientId") {
        state.ws_client_ids.lock().unwrap().push(client_id.clone());
    }
    ws.on_upgrade(move |socket| replay(socket, state))
}

async fn replay(mut socket: WebSocket, state: Arc<FakeState>) {
    let script = state.ws_script.lock().unwrap().clone();
    let hold_open = *state.ws_hold_open.lock().unwrap();

    for frame in script {
        if socket.send(frame).await.is_err() {
            return;
        }
    }

    if hold_open {
        while let Some(Ok(msg)) = socket.recv().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    } else {
        let _ = socket.send(Message::Close(None)).await;
    }
}
