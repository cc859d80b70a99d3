#![allow(dead_code)]

//! In-process mock renderer and hosted API for integration tests.
//!
//! The renderer speaks enough of the ComfyUI surface for the execution
//! client: `/prompt`, `/history/{id}`, `/view`, `/upload/image`, `/queue`,
//! `/system_stats` and the `/ws` event stream. Both servers bind to
//! `127.0.0.1:0` and record what they were asked to do.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use genroute_comfyui::api::ComfyUIApi;
use genroute_comfyui::client::ComfyUIClient;
use genroute_comfyui::executor::{ExecutionClient, ExecutorConfig};
use genroute_comfyui::reconnect::ReconnectConfig;
use genroute_comfyui::session::StreamSession;
use genroute_pipeline::config::{EngineConfig, RetryPolicy};
use tokio_util::sync::CancellationToken;

/// 1x1 transparent PNG.
pub const PNG_1X1: &[u8] = &[
    0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x00, 0x00, 0x0D, 0x49, 0x48, 0x44,
    0x52, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x01, 0x08, 0x06, 0x00, 0x00, 0x00, 0x1F,
    0x15, 0xC4, 0x89, 0x00, 0x00, 0x00, 0x0A, 0x49, 0x44, 0x41, 0x54, 0x78, 0x9C, 0x63, 0x00,
    0x01, 0x00, 0x00, 0x05, 0x00, 0x01, 0x0D, 0x0A, 0x2D, 0xB4, 0x00, 0x00, 0x00, 0x00, 0x49,
    0x45, 0x4E, 0x44, 0xAE, 0x42, 0x60, 0x82,
];

// ---------------------------------------------------------------------------
// Graph templates
// ---------------------------------------------------------------------------

pub fn t2i_template() -> Value {
    json!({
        "3": {
            "class_type": "KSampler",
            "inputs": {
                "seed": 1, "steps": 20, "cfg": 8.0, "denoise": 1.0,
                "model": ["4", 0], "positive": ["6", 0],
                "negative": ["7", 0], "latent_image": ["5", 0]
            }
        },
        "4": { "class_type": "CheckpointLoaderSimple", "inputs": { "ckpt_name": "flux.safetensors" } },
        "5": { "class_type": "EmptyLatentImage", "inputs": { "width": 1024, "height": 1024, "batch_size": 1 } },
        "6": { "class_type": "CLIPTextEncode", "inputs": { "text": "", "clip": ["4", 1] } },
        "7": { "class_type": "CLIPTextEncode", "inputs": { "text": "blurry", "clip": ["4", 1] } },
        "8": { "class_type": "VAEDecode", "inputs": { "samples": ["3", 0], "vae": ["4", 2] } },
        "9": { "class_type": "SaveImage", "inputs": { "images": ["8", 0], "filename_prefix": "genroute" } }
    })
}

pub fn i2i_template() -> Value {
    let mut graph = t2i_template();
    graph["3"]["inputs"]["latent_image"] = json!(["11", 0]);
    graph["10"] = json!({ "class_type": "LoadImage", "inputs": { "image": "example.png" } });
    graph["11"] = json!({ "class_type": "VAEEncode", "inputs": { "pixels": ["10", 0], "vae": ["4", 2] } });
    graph
}

/// Write the text-to-image and image-to-image templates under their
/// default names.
pub fn write_templates(dir: &Path) {
    std::fs::write(dir.join("t2i_flux.json"), t2i_template().to_string()).unwrap();
    std::fs::write(dir.join("i2i_flux.json"), i2i_template().to_string()).unwrap();
}

// ---------------------------------------------------------------------------
// Mock renderer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum Completion {
    Success,
    Error(String),
    Never,
}

#[derive(Debug, Clone)]
pub struct RendererBehavior {
    pub websocket: bool,
    pub view_fails: bool,
    pub completion: Completion,
    pub delay: Duration,
}

impl Default for RendererBehavior {
    fn default() -> Self {
        Self {
            websocket: true,
            view_fails: false,
            completion: Completion::Success,
            delay: Duration::from_millis(50),
        }
    }
}

#[derive(Default)]
struct Recorded {
    prompts: Vec<Value>,
    uploads: Vec<(String, usize)>,
    deleted: Vec<String>,
    views: usize,
}

struct RendererState {
    behavior: RendererBehavior,
    counter: AtomicU64,
    recorded: Mutex<Recorded>,
    history: Mutex<HashMap<String, Value>>,
    sockets: Mutex<HashMap<String, mpsc::UnboundedSender<String>>>,
}

impl RendererState {
    fn push(&self, client_id: &str, message: Value) {
        let sender = self.sockets.lock().unwrap().get(client_id).cloned();
        if let Some(sender) = sender {
            let _ = sender.send(message.to_string());
        }
    }

    async fn finish(&self, prompt_id: String, client_id: String) {
        tokio::time::sleep(self.behavior.delay).await;

        let msg = |kind: &str, data: Value| json!({ "type": kind, "data": data });
        self.push(&client_id, msg("execution_start", json!({ "prompt_id": prompt_id })));
        self.push(
            &client_id,
            msg("executing", json!({ "node": "3", "prompt_id": prompt_id })),
        );
        self.push(
            &client_id,
            msg("progress", json!({ "value": 1, "max": 2, "prompt_id": prompt_id, "node": "3" })),
        );

        match &self.behavior.completion {
            Completion::Never => {}
            Completion::Success => {
                let image = json!({
                    "filename": format!("{prompt_id}_00001_.png"),
                    "subfolder": "",
                    "type": "output"
                });
                self.history.lock().unwrap().insert(
                    prompt_id.clone(),
                    json!({
                        "outputs": { "9": { "images": [image.clone()] } },
                        "status": { "status_str": "success", "completed": true, "messages": [] }
                    }),
                );
                self.push(
                    &client_id,
                    msg(
                        "executed",
                        json!({ "node": "9", "output": { "images": [image] }, "prompt_id": prompt_id }),
                    ),
                );
                self.push(
                    &client_id,
                    msg("executing", json!({ "node": null, "prompt_id": prompt_id })),
                );
            }
            Completion::Error(message) => {
                let data = json!({
                    "prompt_id": prompt_id,
                    "node_id": "3",
                    "exception_message": message,
                    "exception_type": "RuntimeError"
                });
                self.history.lock().unwrap().insert(
                    prompt_id.clone(),
                    json!({
                        "outputs": {},
                        "status": {
                            "status_str": "error",
                            "completed": false,
                            "messages": [["execution_error", data.clone()]]
                        }
                    }),
                );
                self.push(&client_id, msg("execution_error", data));
            }
        }
    }
}

pub struct MockRenderer {
    pub addr: SocketAddr,
    state: Arc<RendererState>,
}

impl MockRenderer {
    pub async fn spawn(behavior: RendererBehavior) -> Self {
        let state = Arc::new(RendererState {
            behavior,
            counter: AtomicU64::new(0),
            recorded: Mutex::new(Recorded::default()),
            history: Mutex::new(HashMap::new()),
            sockets: Mutex::new(HashMap::new()),
        });

        let app = Router::new()
            .route("/prompt", post(submit_prompt))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/upload/image", post(upload_image))
            .route("/queue", post(queue))
            .route("/system_stats", get(system_stats))
            .route("/ws", get(ws_handler))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn prompts(&self) -> Vec<Value> {
        self.state.recorded.lock().unwrap().prompts.clone()
    }

    pub fn uploads(&self) -> Vec<(String, usize)> {
        self.state.recorded.lock().unwrap().uploads.clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.state.recorded.lock().unwrap().deleted.clone()
    }

    pub fn views(&self) -> usize {
        self.state.recorded.lock().unwrap().views
    }

    /// Wait until an event-stream client is registered.
    pub async fn wait_for_socket(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.state.sockets.lock().unwrap().is_empty() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("event stream never connected");
    }

    /// Engine configuration pointing at this renderer with test timings.
    pub fn engine_config(&self, template_dir: &Path, staging_dir: &Path) -> EngineConfig {
        EngineConfig {
            comfyui_url: self.http_url(),
            comfyui_ws_url: Some(self.ws_url()),
            reconnect: fast_reconnect(),
            template_dir: template_dir.to_path_buf(),
            staging_dir: staging_dir.to_path_buf(),
            poll_interval: Duration::from_millis(50),
            job_timeout: Duration::from_secs(5),
            retry: RetryPolicy {
                max_retries: 1,
                delay: Duration::from_millis(10),
            },
            ..EngineConfig::default()
        }
    }

    /// A stand-alone session and execution client against this renderer.
    pub fn executor(
        &self,
        config: ExecutorConfig,
        cancel: &CancellationToken,
    ) -> (Arc<StreamSession>, ExecutionClient) {
        let client = ComfyUIClient::with_random_id(self.ws_url());
        let session = StreamSession::start(client, fast_reconnect(), cancel);
        let executor = ExecutionClient::new(
            ComfyUIApi::new(self.http_url()),
            Arc::clone(&session),
            config,
        );
        (session, executor)
    }
}

pub fn fast_reconnect() -> ReconnectConfig {
    ReconnectConfig {
        initial_delay: Duration::from_millis(50),
        max_delay: Duration::from_millis(200),
        multiplier: 2.0,
    }
}

async fn submit_prompt(
    State(state): State<Arc<RendererState>>,
    Json(body): Json<Value>,
) -> Json<Value> {
    let number = state.counter.fetch_add(1, Ordering::SeqCst) + 1;
    let prompt_id = format!("prompt-{number}");
    let client_id = body["client_id"].as_str().unwrap_or_default().to_string();
    state.recorded.lock().unwrap().prompts.push(body["prompt"].clone());

    let task_state = Arc::clone(&state);
    let task_id = prompt_id.clone();
    tokio::spawn(async move { task_state.finish(task_id, client_id).await });

    Json(json!({ "prompt_id": prompt_id, "number": number, "node_errors": {} }))
}

async fn history(
    State(state): State<Arc<RendererState>>,
    UrlPath(prompt_id): UrlPath<String>,
) -> Json<Value> {
    let mut payload = serde_json::Map::new();
    if let Some(entry) = state.history.lock().unwrap().get(&prompt_id).cloned() {
        payload.insert(prompt_id, entry);
    }
    Json(Value::Object(payload))
}

async fn view(
    State(state): State<Arc<RendererState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    state.recorded.lock().unwrap().views += 1;
    if state.behavior.view_fails || !params.contains_key("filename") {
        return (StatusCode::INTERNAL_SERVER_ERROR, "storage offline").into_response();
    }
    ([(header::CONTENT_TYPE, "image/png")], PNG_1X1).into_response()
}

async fn upload_image(
    State(state): State<Arc<RendererState>>,
    mut multipart: Multipart,
) -> Result<Json<Value>, StatusCode> {
    let mut stored = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|_| StatusCode::BAD_REQUEST)?
    {
        if field.name() == Some("image") {
            let name = field.file_name().unwrap_or("upload.png").to_string();
            let bytes = field.bytes().await.map_err(|_| StatusCode::BAD_REQUEST)?;
            state
                .recorded
                .lock()
                .unwrap()
                .uploads
                .push((name.clone(), bytes.len()));
            stored = Some(name);
        }
    }
    let name = stored.ok_or(StatusCode::BAD_REQUEST)?;
    Ok(Json(json!({ "name": name, "subfolder": "", "type": "input" })))
}

async fn queue(State(state): State<Arc<RendererState>>, Json(body): Json<Value>) -> StatusCode {
    let ids = body["delete"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
        .map(str::to_string);
    state.recorded.lock().unwrap().deleted.extend(ids);
    StatusCode::OK
}

async fn system_stats() -> Json<Value> {
    Json(json!({ "system": { "os": "posix", "comfyui_version": "mock" }, "devices": [] }))
}

async fn ws_handler(
    State(state): State<Arc<RendererState>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.behavior.websocket {
        return StatusCode::NOT_FOUND.into_response();
    }
    let client_id = params.get("clientId").cloned().unwrap_or_default();
    ws.on_upgrade(move |socket| serve_socket(socket, state, client_id))
}

async fn serve_socket(mut socket: WebSocket, state: Arc<RendererState>, client_id: String) {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    state.sockets.lock().unwrap().insert(client_id.clone(), tx);

    let hello = json!({
        "type": "status",
        "data": { "status": { "exec_info": { "queue_remaining": 0 } }, "sid": client_id }
    });
    let mut open = socket.send(Message::Text(hello.to_string().into())).await.is_ok();

    while open {
        tokio::select! {
            outgoing = rx.recv() => match outgoing {
                Some(text) => open = socket.send(Message::Text(text.into())).await.is_ok(),
                None => open = false,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => open = false,
                Some(Ok(_)) => {}
            },
        }
    }

    state.sockets.lock().unwrap().remove(&client_id);
}

// ---------------------------------------------------------------------------
// Mock hosted API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub enum HostedBehavior {
    Status(u16),
    ImageBody,
    Urls(Vec<String>),
}

struct HostedState {
    behavior: HostedBehavior,
    calls: AtomicU64,
    bodies: Mutex<Vec<(Option<String>, Value)>>,
}

pub struct MockHosted {
    pub addr: SocketAddr,
    state: Arc<HostedState>,
}

impl MockHosted {
    pub async fn spawn(behavior: HostedBehavior) -> Self {
        let state = Arc::new(HostedState {
            behavior,
            calls: AtomicU64::new(0),
            bodies: Mutex::new(Vec::new()),
        });
        let app = Router::new()
            .route("/generate", post(hosted_generate))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self { addr, state }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}/generate", self.addr)
    }

    pub fn calls(&self) -> u64 {
        self.state.calls.load(Ordering::SeqCst)
    }

    /// Authorization header and JSON body of every call.
    pub fn bodies(&self) -> Vec<(Option<String>, Value)> {
        self.state.bodies.lock().unwrap().clone()
    }
}

async fn hosted_generate(
    State(state): State<Arc<HostedState>>,
    headers: axum::http::HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.calls.fetch_add(1, Ordering::SeqCst);
    let auth = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    state.bodies.lock().unwrap().push((auth, body));

    match &state.behavior {
        HostedBehavior::Status(code) => {
            let status = StatusCode::from_u16(*code).unwrap();
            (status, Json(json!({ "error": "mock failure" }))).into_response()
        }
        HostedBehavior::ImageBody => {
            ([(header::CONTENT_TYPE, "image/png")], PNG_1X1).into_response()
        }
        HostedBehavior::Urls(urls) => {
            let images: Vec<Value> = urls.iter().map(|u| json!({ "url": u })).collect();
            Json(json!({ "images": images })).into_response()
        }
    }
}
