use crate::catalog::OperationCatalog;
use crate::config::{Config, DEFAULT_REPOSITORY};
use crate::context::WorkerContext;
use crate::error::RemoteError;
use crate::lock::PathUnlock;
use crate::proxy::ProxyResolution;
use crate::session::TransferSession;
use crate::util::with_trailing_slash;
use crate::{Availability, TransferError};
use parking_lot::RwLock;
use reqwest::header::{HeaderMap, CONTENT_TYPE};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde_json::{Map, Value};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

pub const APPLICATION_NAME: &str = "Nuxeo Drive";
pub const TOKEN_PERMISSION: &str = "ReadWrite";
/// Audit entries are stored with a one second date resolution.
pub const AUDIT_CHANGE_FINDER_TIME_RESOLUTION: Duration = Duration::from_secs(1);
pub const TMP_UPLOAD_SUFFIX: &str = "-nxdrive-file-to-upload";

const NXREQUEST: &str = "application/json+nxrequest";

#[cfg(target_os = "linux")]
const DEVICE_DESCRIPTION: Option<&str> = Some("Linux Desktop");
#[cfg(target_os = "macos")]
const DEVICE_DESCRIPTION: Option<&str> = Some("Mac OSX Desktop");
#[cfg(target_os = "windows")]
const DEVICE_DESCRIPTION: Option<&str> = Some("Windows Desktop");
#[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
const DEVICE_DESCRIPTION: Option<&str> = None;

#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Password(String),
    Token(String),
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::Password(_) => f.write_str("Credentials::Password(***)"),
            Credentials::Token(_) => f.write_str("Credentials::Token(***)"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    /// Target URL instead of the operation endpoint.
    pub url: Option<String>,
    pub input: Option<Value>,
    /// Control timeout when unset.
    pub timeout: Option<Duration>,
    pub check_params: bool,
    pub void_op: bool,
    pub extra_headers: Vec<(String, String)>,
    /// Stream the response body into this file.
    pub file_out: Option<PathBuf>,
}

impl Default for ExecuteOptions {
    fn default() -> Self {
        Self {
            url: None,
            input: None,
            timeout: None,
            check_params: true,
            void_op: false,
            extra_headers: Vec::new(),
            file_out: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecuteOutput {
    Json(Value),
    Bytes(bytes::Bytes),
    File(PathBuf),
    Empty,
}

impl ExecuteOutput {
    pub fn into_json(self) -> Option<Value> {
        match self {
            ExecuteOutput::Json(v) => Some(v),
            _ => None,
        }
    }
}

/// Client for the server's automation API.
///
/// Discovery runs once in [`connect`](Self::connect); the catalog it
/// fetches validates every later call.
pub struct TransferClient {
    pub(crate) server_url: String,
    pub(crate) automation_url: String,
    pub(crate) rest_api_url: String,
    pub(crate) user_id: String,
    pub(crate) device_id: String,
    pub(crate) client_version: String,
    pub(crate) repository: String,
    pub(crate) timeout: Duration,
    pub(crate) blob_timeout: Duration,
    pub(crate) upload_tmp_dir: PathBuf,
    pub(crate) is_proxy: bool,
    pub(crate) http: reqwest::Client,
    pub(crate) session: Arc<TransferSession>,
    auth: RwLock<Credentials>,
    proxy: ProxyResolution,
    catalog: OperationCatalog,
}

impl TransferClient {
    pub async fn connect(
        config: &Config,
        credentials: Credentials,
        session: Arc<TransferSession>,
    ) -> Result<Self, TransferError> {
        let server = &config.server;
        let server_url = with_trailing_slash(server.url.trim());
        url::Url::parse(&server_url)
            .map_err(|e| TransferError::Config(format!("server url '{server_url}': {e}")))?;
        let proxy = config.proxy.resolve(&server_url)?;
        let is_proxy = proxy.is_active();
        tracing::trace!(config = proxy.label(), effective = ?proxy, "proxy configuration");
        let user_agent = format!("{APPLICATION_NAME}/{}", server.client_version);
        let http = crate::http::client(&user_agent, &proxy, session.jar().clone())?;

        let mut client = Self {
            automation_url: format!("{server_url}site/automation/"),
            rest_api_url: format!("{server_url}api/v1/"),
            server_url,
            user_id: server.user.clone(),
            device_id: server.device_id.clone(),
            client_version: server.client_version.clone(),
            repository: server.repository.clone(),
            timeout: server.timeout(),
            blob_timeout: server.blob_timeout(),
            upload_tmp_dir: session.upload_tmp_dir().to_path_buf(),
            is_proxy,
            http,
            session,
            auth: RwLock::new(credentials),
            proxy,
            catalog: OperationCatalog::empty(&server.url, &server.client_version),
        };
        client.catalog = client.fetch_api().await?;
        tracing::debug!(
            server = %client.server_url,
            operations = client.catalog.len(),
            event_log_id = client.catalog.is_event_log_id(),
            "operation catalog loaded"
        );
        Ok(client)
    }

    async fn fetch_api(&self) -> Result<OperationCatalog, TransferError> {
        let base = format!("Failed to connect to Nuxeo server {}", self.server_url);
        let url = self.automation_url.clone();
        tracing::trace!(%url, "fetching operation catalog");
        let request = self.common(self.http.get(&url)).timeout(self.timeout);
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                return Err(TransferError::Connectivity {
                    message: format!("{base}: {}{}", root_cause(&err), self.connection_hint()),
                })
            }
        };
        let status = response.status();
        if !status.is_success() {
            if is_auth_failure(status) {
                return Err(self.unauthorized(status));
            }
            let body = response.text().await.unwrap_or_default();
            let remote = RemoteError::parse(status.as_u16(), &body);
            log_remote(&remote);
            let mut message = format!("{base}\nHTTP error {}", status.as_u16());
            if let Some(reason) = status.canonical_reason() {
                message.push_str(": ");
                message.push_str(reason);
            }
            return Err(TransferError::Connectivity { message });
        }
        let document: Value = response.json().await.map_err(|e| TransferError::Connectivity {
            message: format!("{base}: {}", root_cause(&e)),
        })?;
        OperationCatalog::from_document(document, &self.server_url, &self.client_version)
    }

    fn connection_hint(&self) -> &'static str {
        if self.is_proxy {
            "\nPlease check your Internet connection, make sure the Nuxeo server URL is valid and check the proxy settings."
        } else {
            "\nPlease check your Internet connection and make sure the Nuxeo server URL is valid."
        }
    }

    pub(crate) fn unauthorized(&self, status: StatusCode) -> TransferError {
        TransferError::Unauthorized {
            server: self.server_url.clone(),
            user: self.user_id.clone(),
            code: status.as_u16(),
        }
    }

    /// Maps connection-level failures to a diagnostic; anything else stays
    /// a transport error.
    pub(crate) fn transport_error(&self, err: reqwest::Error) -> TransferError {
        if err.is_connect() || err.is_timeout() {
            TransferError::Connectivity {
                message: format!(
                    "Failed to connect to Nuxeo server {} with user {}: {}{}",
                    self.server_url,
                    self.user_id,
                    root_cause(&err),
                    self.connection_hint()
                ),
            }
        } else {
            TransferError::Transport(err)
        }
    }

    /// Turns a failing status into an error, reading the remote error body.
    pub(crate) async fn check_status(&self, response: Response) -> Result<Response, TransferError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        if is_auth_failure(status) {
            return Err(self.unauthorized(status));
        }
        let url = response.url().to_string();
        let body = response.text().await.unwrap_or_default();
        let remote = RemoteError::parse(status.as_u16(), &body);
        log_remote(&remote);
        if remote.is_unknown_batch() {
            tracing::warn!(%url, "invalid batch");
            return Err(TransferError::InvalidBatch { remote });
        }
        Err(TransferError::Http {
            status: status.as_u16(),
            url,
            remote,
        })
    }

    /// Headers sent with every request.
    pub(crate) fn common(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header("X-User-Id", &self.user_id)
            .header("X-Device-Id", &self.device_id)
            .header("X-Client-Version", &self.client_version)
            .header(
                reqwest::header::USER_AGENT,
                format!("{APPLICATION_NAME}/{}", self.client_version),
            )
            .header("X-Application-Name", APPLICATION_NAME)
            .header(reqwest::header::CACHE_CONTROL, "no-cache");
        match &*self.auth.read() {
            Credentials::Token(token) => request.header("X-Authentication-Token", token),
            Credentials::Password(password) => request.basic_auth(&self.user_id, Some(password)),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn session(&self) -> &Arc<TransferSession> {
        &self.session
    }

    pub fn catalog(&self) -> &OperationCatalog {
        &self.catalog
    }

    pub fn proxy(&self) -> &ProxyResolution {
        &self.proxy
    }

    pub fn is_proxy(&self) -> bool {
        self.is_proxy
    }

    pub fn is_addon_installed(&self) -> bool {
        self.catalog.contains("NuxeoDrive.GetRoots")
    }

    pub fn is_event_log_id_available(&self) -> bool {
        self.catalog.is_event_log_id()
    }

    pub fn is_elasticsearch_audit(&self) -> bool {
        self.catalog.contains("NuxeoDrive.WaitForElasticsearchCompletion")
    }

    pub fn is_attach_blob_available(&self) -> bool {
        self.catalog.contains("NuxeoDrive.AttachBlob")
    }

    pub fn is_new_upload_api_available(&self) -> bool {
        self.session.is_new_upload_api_available()
    }

    /// Runs an automation operation.
    pub async fn execute(
        &self,
        operation: &str,
        params: Map<String, Value>,
        options: ExecuteOptions,
    ) -> Result<ExecuteOutput, TransferError> {
        self.run_operation(operation, params, options, None).await
    }

    /// Same as [`execute`](Self::execute) with suspension checks and
    /// progress while streaming `file_out`.
    pub async fn execute_for(
        &self,
        operation: &str,
        params: Map<String, Value>,
        options: ExecuteOptions,
        ctx: &WorkerContext,
    ) -> Result<ExecuteOutput, TransferError> {
        self.run_operation(operation, params, options, Some(ctx)).await
    }

    async fn run_operation(
        &self,
        operation: &str,
        params: Map<String, Value>,
        options: ExecuteOptions,
        ctx: Option<&WorkerContext>,
    ) -> Result<ExecuteOutput, TransferError> {
        if options.check_params {
            self.catalog.check_params(operation, &params)?;
        }
        let url = options
            .url
            .clone()
            .unwrap_or_else(|| format!("{}{operation}", self.automation_url));
        self.execute_at(&url, params, options, ctx).await
    }

    pub(crate) async fn execute_at(
        &self,
        url: &str,
        params: Map<String, Value>,
        options: ExecuteOptions,
        ctx: Option<&WorkerContext>,
    ) -> Result<ExecuteOutput, TransferError> {
        let body = request_envelope(params, options.input);
        let mut request = self
            .http
            .post(url)
            .header(CONTENT_TYPE, NXREQUEST)
            .header(reqwest::header::ACCEPT, "application/json+nxentity, */*")
            .header("X-NXproperties", "*")
            .header("X-NXDocumentProperties", "*");
        if options.void_op {
            request = request.header("X-NXVoidOperation", "true");
        }
        if self.repository != DEFAULT_REPOSITORY {
            request = request.header("X-NXRepository", &self.repository);
        }
        for (name, value) in &options.extra_headers {
            request = request.header(name.as_str(), value.as_str());
        }
        let payload = serde_json::to_vec(&body)?;
        tracing::trace!(%url, payload = %String::from_utf8_lossy(&payload), "calling operation");
        let request = self
            .common(request)
            .timeout(options.timeout.unwrap_or(self.timeout))
            .body(payload);
        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let response = self.check_status(response).await?;
        match options.file_out {
            Some(path) => self.write_response(response, &path, ctx).await,
            None => read_response(response).await,
        }
    }

    async fn write_response(
        &self,
        mut response: Response,
        path: &Path,
        ctx: Option<&WorkerContext>,
    ) -> Result<ExecuteOutput, TransferError> {
        let label = format!("File download: {}", path.display());
        let guard = PathUnlock::acquire(path)?;
        let mut file = tokio::fs::File::create(path).await?;
        loop {
            if let Some(ctx) = ctx {
                ctx.checkpoint(&label).await?;
            }
            let Some(chunk) = response.chunk().await.map_err(|e| self.transport_error(e))? else {
                break;
            };
            if let Some(ctx) = ctx {
                ctx.reporter.advance(ctx.id, chunk.len() as u64);
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        drop(file);
        guard.restore()?;
        Ok(ExecuteOutput::File(path.to_path_buf()))
    }

    /// Asks the server for a token bound to this device.
    ///
    /// `Absent` means the server does not support token authentication.
    pub async fn request_token(&self, revoke: bool) -> Result<Availability<String>, TransferError> {
        let mut url = url::Url::parse(&format!("{}authentication/token", self.server_url))
            .map_err(|e| TransferError::Config(e.to_string()))?;
        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("deviceId", &self.device_id)
                .append_pair("applicationName", APPLICATION_NAME)
                .append_pair("permission", TOKEN_PERMISSION)
                .append_pair("revoke", if revoke { "true" } else { "false" });
            if let Some(description) = DEVICE_DESCRIPTION {
                query.append_pair("deviceDescription", description);
            }
        }
        tracing::trace!(%url, "requesting token");
        let response = self
            .common(self.http.get(url))
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        if response.status() == StatusCode::NOT_FOUND {
            tracing::debug!(server = %self.server_url, "token authentication is not supported");
            return Ok(Availability::Absent);
        }
        let response = self.check_status(response).await?;
        let token = response.text().await?.trim().to_string();
        if !revoke {
            *self.auth.write() = Credentials::Token(token.clone());
        }
        Ok(Availability::Available(token))
    }

    pub async fn revoke_token(&self) -> Result<(), TransferError> {
        self.request_token(true).await.map(|_| ())
    }

    /// Blocks until the server has indexed pending changes.
    pub async fn wait_for_server(&self) -> Result<(), TransferError> {
        if self.is_elasticsearch_audit() {
            self.execute(
                "NuxeoDrive.WaitForElasticsearchCompletion",
                Map::new(),
                ExecuteOptions::default(),
            )
            .await?;
        } else {
            if !self.is_event_log_id_available() {
                tokio::time::sleep(AUDIT_CHANGE_FINDER_TIME_RESOLUTION).await;
            }
            self.execute(
                "NuxeoDrive.WaitForAsyncCompletion",
                Map::new(),
                ExecuteOptions::default(),
            )
            .await?;
        }
        Ok(())
    }

    /// Writes `content` to a fresh file in the upload temp dir. The caller
    /// removes it once uploaded.
    pub fn make_tmp_file(&self, content: &[u8]) -> Result<PathBuf, TransferError> {
        let mut tmp = tempfile::Builder::new()
            .suffix(TMP_UPLOAD_SUFFIX)
            .tempfile_in(&self.upload_tmp_dir)?;
        tmp.as_file_mut().write_all(content)?;
        tmp.as_file_mut().flush()?;
        let path = tmp.into_temp_path().keep().map_err(|e| e.error)?;
        Ok(path)
    }
}

impl std::fmt::Debug for TransferClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferClient")
            .field("server_url", &self.server_url)
            .field("user_id", &self.user_id)
            .field("repository", &self.repository)
            .field("proxy", &self.proxy.label())
            .finish()
    }
}

pub(crate) fn is_auth_failure(status: StatusCode) -> bool {
    status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN
}

fn log_remote(remote: &RemoteError) {
    if let Some(message) = &remote.message {
        tracing::debug!(status = ?remote.status, code = ?remote.code, %message, "remote exception");
    } else {
        tracing::debug!(status = ?remote.status, details = ?remote, "remote exception details");
    }
}

/// Innermost error message, which names the actual socket failure.
pub(crate) fn root_cause(err: &(dyn std::error::Error + 'static)) -> String {
    let mut current = err;
    while let Some(source) = current.source() {
        current = source;
    }
    current.to_string()
}

/// `{params, input?}` body; null params are dropped and `properties`
/// maps are flattened to `key=value` lines.
pub(crate) fn request_envelope(params: Map<String, Value>, input: Option<Value>) -> Value {
    let mut out = Map::new();
    for (key, value) in params {
        match value {
            Value::Null => continue,
            Value::Object(props) if key == "properties" => {
                let lines: Vec<String> = props
                    .iter()
                    .map(|(name, v)| match v {
                        Value::String(s) => format!("{name}={s}"),
                        other => format!("{name}={other}"),
                    })
                    .collect();
                out.insert(key, Value::String(lines.join("\n").trim().to_string()));
            }
            other => {
                out.insert(key, other);
            }
        }
    }
    let mut body = Map::new();
    body.insert("params".into(), Value::Object(out));
    if let Some(input) = input.filter(|i| !i.is_null()) {
        body.insert("input".into(), input);
    }
    Value::Object(body)
}

pub(crate) async fn read_response(response: Response) -> Result<ExecuteOutput, TransferError> {
    let is_json = content_type(response.headers()).starts_with("application/json");
    let status = response.status();
    let url = response.url().to_string();
    let body = response.bytes().await?;
    tracing::trace!(%url, status = status.as_u16(), bytes = body.len(), json = is_json, "response");
    if body.is_empty() {
        return Ok(ExecuteOutput::Empty);
    }
    if is_json {
        Ok(ExecuteOutput::Json(serde_json::from_slice(&body)?))
    } else {
        Ok(ExecuteOutput::Bytes(body))
    }
}

fn content_type(headers: &HeaderMap) -> &str {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}
