#![allow(dead_code)]

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use nxsync_client::config::{Config, ServerConfig};
use nxsync_client::{
    Credentials, ProgressReporter, ProxyMode, RateLimit, TransferClient, TransferDirection,
    TransferError, TransferSession, WorkerContext, WorkerId,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

pub const USER: &str = "alice";
pub const PASSWORD: &str = "secret";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitBehavior {
    Modern,
    NotFound,
    TypeNotFound,
}

#[derive(Debug, Clone)]
pub struct Recorded {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Recorded {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.body).unwrap_or(Value::Null)
    }
}

/// In-process stand-in for the content server, mounted under `/nuxeo/`.
pub struct MockServer {
    pub init: Mutex<InitBehavior>,
    pub unknown_batch: AtomicBool,
    pub reject_auth: AtomicBool,
    pub token: Mutex<Option<String>>,
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub requests: Mutex<Vec<Recorded>>,
}

impl Default for MockServer {
    fn default() -> Self {
        Self {
            init: Mutex::new(InitBehavior::Modern),
            unknown_batch: AtomicBool::new(false),
            reject_auth: AtomicBool::new(false),
            token: Mutex::new(None),
            files: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
        }
    }
}

impl MockServer {
    pub fn requests_to(&self, path: &str) -> Vec<Recorded> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.requests_to(path).len()
    }

    pub fn add_file(&self, name: &str, content: Vec<u8>) {
        self.files.lock().insert(name.to_string(), content);
    }
}

pub fn catalog() -> Value {
    json!({
        "operations": [
            {
                "id": "Document.Create",
                "aliases": ["Document.CreateDocument"],
                "params": [
                    {"name": "type", "required": true, "type": "string"},
                    {"name": "name", "required": false, "type": "string"},
                    {"name": "properties", "required": false, "type": "properties"}
                ]
            },
            {"id": "FileManager.Import", "params": [{"name": "context", "required": false}]},
            {"id": "NuxeoDrive.GetRoots"},
            {"id": "NuxeoDrive.WaitForAsyncCompletion"},
            {
                "id": "NuxeoDrive.GetChangeSummary",
                "params": [{"name": "lowerBound", "required": false, "type": "long"}]
            }
        ]
    })
}

fn json_reply(status: StatusCode, body: Value) -> Response {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

fn operation_reply(mock: &MockServer) -> Response {
    if mock.unknown_batch.load(Ordering::SeqCst) {
        return json_reply(
            StatusCode::INTERNAL_SERVER_ERROR,
            json!({"error": "Unable to find batch associated with id batch-1"}),
        );
    }
    json_reply(
        StatusCode::OK,
        json!({"entity-type": "document", "uid": "doc-1", "title": "hello.txt"}),
    )
}

async fn handle(
    State(mock): State<Arc<MockServer>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    mock.requests.lock().push(Recorded {
        method: method.clone(),
        path: uri.path().to_string(),
        query: uri.query().map(str::to_string),
        headers: headers.clone(),
        body: body.clone(),
    });
    if mock.reject_auth.load(Ordering::SeqCst) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let Some(path) = uri.path().strip_prefix("/nuxeo/") else {
        return StatusCode::NOT_FOUND.into_response();
    };
    let segments: Vec<&str> = path.trim_end_matches('/').split('/').collect();
    match (method.as_str(), segments.as_slice()) {
        ("GET", ["site", "automation"]) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/json"),
                (header::SET_COOKIE, "JSESSIONID=session-1; Path=/nuxeo; HttpOnly"),
            ],
            catalog().to_string(),
        )
            .into_response(),
        ("GET", ["authentication", "token"]) => match mock.token.lock().clone() {
            Some(token) => (StatusCode::OK, token).into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        ("GET", ["files", name]) => match mock.files.lock().get(*name).cloned() {
            Some(content) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, "application/octet-stream")],
                content,
            )
                .into_response(),
            None => json_reply(StatusCode::NOT_FOUND, json!({"message": "no such blob"})),
        },
        ("POST", ["api", "v1", "upload"]) => match *mock.init.lock() {
            InitBehavior::Modern => json_reply(StatusCode::CREATED, json!({"batchId": "batch-1"})),
            InitBehavior::NotFound => StatusCode::NOT_FOUND.into_response(),
            InitBehavior::TypeNotFound => json_reply(
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({
                    "entity-type": "exception",
                    "code": "org.nuxeo.ecm.webengine.model.TypeNotFoundException",
                    "message": "Type not found: upload"
                }),
            ),
        },
        ("POST", ["api", "v1", "upload", batch, idx]) => json_reply(
            StatusCode::CREATED,
            json!({
                "batchId": batch,
                "fileIdx": idx,
                "uploaded": "true",
                "uploadedSize": body.len().to_string()
            }),
        ),
        ("POST", ["api", "v1", "upload", _, _, "execute", _]) => operation_reply(&mock),
        ("POST", ["site", "automation", "batch", "upload"]) => {
            let batch = headers
                .get("X-Batch-Id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string();
            json_reply(StatusCode::OK, json!({"batchId": batch, "uploaded": "true"}))
        }
        ("POST", ["site", "automation", "batch", "execute"]) => operation_reply(&mock),
        ("POST", ["site", "automation", _]) => operation_reply(&mock),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Serves `mock` on an ephemeral port and returns the server URL.
pub async fn spawn(mock: Arc<MockServer>) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = Router::new().fallback(handle).with_state(mock);
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/nuxeo/")
}

pub fn config(server_url: &str, tmp: &Path) -> Config {
    let mut config = Config {
        server: ServerConfig {
            url: server_url.to_string(),
            user: USER.to_string(),
            device_id: "device-1".to_string(),
            client_version: "5.2.0".to_string(),
            upload_tmp_dir: Some(tmp.to_path_buf()),
            ..ServerConfig::default()
        },
        ..Config::default()
    };
    config.proxy.mode = ProxyMode::None;
    config
}

pub async fn connect(config: &Config) -> Result<TransferClient, TransferError> {
    let session = Arc::new(TransferSession::from_config(config)?);
    TransferClient::connect(config, Credentials::Password(PASSWORD.into()), session).await
}

/// Mock server plus a connected client.
pub async fn setup(tmp: &Path) -> (Arc<MockServer>, TransferClient) {
    nxsync_otel::init();
    let mock = Arc::new(MockServer::default());
    let url = spawn(mock.clone()).await;
    let client = connect(&config(&url, tmp)).await.unwrap();
    (mock, client)
}

pub fn worker(client: &TransferClient) -> WorkerContext {
    WorkerContext::new(client.session().acquire_worker())
}

#[derive(Debug, Default)]
pub struct CountingReporter {
    pub begun: AtomicU64,
    pub bytes: AtomicU64,
    pub finished: AtomicU64,
}

impl ProgressReporter for CountingReporter {
    fn begin(&self, _worker: WorkerId, _action: &str, _label: &str, _total: Option<u64>) {
        self.begun.fetch_add(1, Ordering::SeqCst);
    }

    fn advance(&self, _worker: WorkerId, bytes: u64) {
        self.bytes.fetch_add(bytes, Ordering::SeqCst);
    }

    fn finish(&self, _worker: WorkerId) {
        self.finished.fetch_add(1, Ordering::SeqCst);
    }
}

/// Records every chunk size and installs `limit` once the first chunk went out.
pub struct LimitAfterFirstChunk {
    session: Arc<TransferSession>,
    direction: TransferDirection,
    limit: RateLimit,
    pub sizes: Mutex<Vec<u64>>,
}

impl LimitAfterFirstChunk {
    pub fn new(session: Arc<TransferSession>, direction: TransferDirection, limit: RateLimit) -> Self {
        Self {
            session,
            direction,
            limit,
            sizes: Mutex::new(Vec::new()),
        }
    }
}

impl ProgressReporter for LimitAfterFirstChunk {
    fn advance(&self, _worker: WorkerId, bytes: u64) {
        let mut sizes = self.sizes.lock();
        sizes.push(bytes);
        if sizes.len() == 1 {
            let installed = match self.direction {
                TransferDirection::Upload => self.session.set_upload_rate_limit(self.limit),
                TransferDirection::Download => self.session.set_download_rate_limit(self.limit),
            };
            installed.unwrap();
        }
    }
}
