//! Batch upload: modern resumable API with a sticky legacy fallback.

use crate::client::{read_response, ExecuteOptions, ExecuteOutput, TransferClient};
use crate::context::WorkerContext;
use crate::error::RemoteError;
use crate::session::TransferSession;
use crate::{Availability, TransferError};
use bytes::Bytes;
use nxsync_ratelimit::tokens_for;
use parking_lot::Mutex;
use rand::Rng;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tokio::io::AsyncReadExt;

/// Lower bound for the server transaction running a batch execute.
pub const DEFAULT_TX_TIMEOUT: Duration = Duration::from_secs(300);

const BATCH_UPLOAD_PATH: &str = "upload";
const LEGACY_BATCH_UPLOAD: &str = "batch/upload";
const LEGACY_BATCH_EXECUTE: &str = "batch/execute";

/// Server exceptions meaning the upload resource does not exist.
const NOT_FOUND_EXCEPTIONS: [&str; 2] = [
    "com.sun.jersey.api.NotFoundException",
    "org.nuxeo.ecm.webengine.model.TypeNotFoundException",
];

/// `max(300s, 2 × upload duration)`, in whole seconds.
pub fn transaction_timeout(upload_duration: Duration) -> Duration {
    let doubled = Duration::from_secs(upload_duration.as_secs().saturating_mul(2));
    doubled.max(DEFAULT_TX_TIMEOUT)
}

/// Locally generated batch id for the legacy API.
pub fn generate_batch_id() -> String {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default();
    let suffix: u32 = rand::rng().random_range(0..=1_000_000_000);
    format!("{now}_{suffix}")
}

/// Replaces characters that are invalid in file names.
pub fn safe_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | '*' | ':' | '|' | '"' | '<' | '>' | '?' => '-',
            other => other,
        })
        .collect()
}

/// State shared between the request body stream and the caller.
#[derive(Default)]
struct StreamOutcome {
    abort: Mutex<Option<TransferError>>,
    finished: AtomicBool,
}

struct UploadStream {
    file: tokio::fs::File,
    session: Arc<TransferSession>,
    ctx: WorkerContext,
    label: String,
    outcome: Arc<StreamOutcome>,
}

impl UploadStream {
    async fn next_chunk(&mut self) -> Result<Option<Bytes>, TransferError> {
        self.ctx.checkpoint(&self.label).await?;
        let mut buf = vec![0u8; self.session.upload_buffer_size()];
        let mut filled = 0;
        while filled < buf.len() {
            let read = self.file.read(&mut buf[filled..]).await?;
            if read == 0 {
                break;
            }
            filled += read;
        }
        let lane = self.session.upload();
        if filled == 0 {
            lane.stats().end(self.ctx.id);
            self.outcome.finished.store(true, Ordering::SeqCst);
            return Ok(None);
        }
        buf.truncate(filled);
        let waited = lane.bucket().acquire(self.ctx.id, tokens_for(filled)).await;
        if !waited.is_zero() {
            tracing::trace!(
                target: "nxsync.transfer",
                worker = %self.ctx.id,
                waited_ms = waited.as_millis() as u64,
                "waited to upload"
            );
        }
        lane.stats().update(self.ctx.id, filled as u64);
        self.ctx.reporter.advance(self.ctx.id, filled as u64);
        Ok(Some(Bytes::from(buf)))
    }
}

fn body_stream(
    stream: UploadStream,
) -> impl futures_util::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static {
    futures_util::stream::unfold(Some(stream), |state| async move {
        let mut stream = state?;
        match stream.next_chunk().await {
            Ok(Some(chunk)) => Some((Ok(chunk), Some(stream))),
            Ok(None) => None,
            Err(err) => {
                let message = err.to_string();
                *stream.outcome.abort.lock() = Some(err);
                Some((Err(std::io::Error::other(message)), None))
            }
        }
    })
}

impl TransferClient {
    /// Uploads `file` into a batch and runs `operation` against it.
    ///
    /// An unknown batch clears the session cookies before the error is
    /// returned so the caller's next attempt gets a fresh server session.
    pub async fn execute_with_blob_streaming(
        &self,
        operation: &str,
        file: &Path,
        filename: Option<&str>,
        mime_type: Option<&str>,
        params: Map<String, Value>,
        ctx: &WorkerContext,
    ) -> Result<ExecuteOutput, TransferError> {
        let label = filename
            .map(str::to_string)
            .or_else(|| file.file_name().map(|n| n.to_string_lossy().into_owned()))
            .unwrap_or_default();
        let size = tokio::fs::metadata(file).await?.len();
        ctx.reporter.begin(ctx.id, "Upload", &label, Some(size));
        let result = self
            .blob_streaming(operation, file, filename, mime_type, params, ctx)
            .await;
        ctx.reporter.finish(ctx.id);
        if let Err(TransferError::InvalidBatch { .. }) = &result {
            let cleared = self.session.jar().clear_session_cookies();
            tracing::debug!(cleared, "session cookies cleared after invalid batch");
        }
        result
    }

    async fn blob_streaming(
        &self,
        operation: &str,
        file: &Path,
        filename: Option<&str>,
        mime_type: Option<&str>,
        params: Map<String, Value>,
        ctx: &WorkerContext,
    ) -> Result<ExecuteOutput, TransferError> {
        let tick = Instant::now();
        let mut batch_id = None;
        if self.session.is_new_upload_api_available() {
            match self.init_upload().await? {
                Availability::Available(id) => {
                    self.session.mark_modern();
                    batch_id = Some(id);
                }
                Availability::Absent => {
                    tracing::debug!(server = %self.server_url, "new upload API is not available");
                    self.session.mark_legacy();
                }
            }
        }
        let batch_id = batch_id.unwrap_or_else(generate_batch_id);
        let uploaded = self
            .upload(&batch_id, file, filename, 0, mime_type, ctx)
            .await?;
        let duration = tick.elapsed();
        let tx_timeout = transaction_timeout(duration);
        tracing::trace!(
            tx_timeout_secs = tx_timeout.as_secs(),
            upload_secs = duration.as_secs(),
            operation,
            file = %file.display(),
            "batch execution transaction timeout"
        );
        let bad_response = || {
            TransferError::BadResponse(format!(
                "Bad response from batch upload with id '{batch_id}' and file path '{}'",
                file.display()
            ))
        };
        let Some(result) = uploaded.as_object() else {
            tracing::debug!(response = %uploaded, "invalid batch upload response format");
            return Err(bad_response());
        };
        if result.get("uploaded").is_none() {
            self.session.mark_legacy();
        }
        if result.get("batchId").is_none() {
            return Err(bad_response());
        }
        self.execute_batch(operation, &batch_id, "0", tx_timeout, params)
            .await
    }

    /// Opens a server-side batch.
    ///
    /// `Absent` when the server has no resumable upload API.
    pub async fn init_upload(&self) -> Result<Availability<String>, TransferError> {
        let url = format!("{}{BATCH_UPLOAD_PATH}", self.rest_api_url);
        let response = self
            .common(self.http.post(&url))
            .header(CONTENT_LENGTH, "0")
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Availability::Absent);
        }
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            let body = response.text().await.unwrap_or_default();
            let remote = RemoteError::parse(status.as_u16(), &body);
            if NOT_FOUND_EXCEPTIONS.iter().any(|e| remote.names(e)) {
                return Ok(Availability::Absent);
            }
            return Err(TransferError::Http {
                status: status.as_u16(),
                url,
                remote,
            });
        }
        let response = self.check_status(response).await?;
        let body: Value = response.json().await?;
        match body.get("batchId") {
            Some(Value::String(id)) => Ok(Availability::Available(id.clone())),
            Some(Value::Number(id)) => Ok(Availability::Available(id.to_string())),
            _ => Err(TransferError::BadResponse(format!(
                "batch init without batchId: {body}"
            ))),
        }
    }

    /// Streams one file into `batch_id` at `file_index`, throttled through
    /// the upload bucket.
    pub async fn upload(
        &self,
        batch_id: &str,
        file: &Path,
        filename: Option<&str>,
        file_index: u32,
        mime_type: Option<&str>,
        ctx: &WorkerContext,
    ) -> Result<Value, TransferError> {
        let modern = self.session.is_new_upload_api_available();
        let url = if modern {
            format!("{}{BATCH_UPLOAD_PATH}/{batch_id}/{file_index}", self.rest_api_url)
        } else {
            format!("{}{LEGACY_BATCH_UPLOAD}", self.automation_url)
        };
        let filename = match filename {
            Some(name) => name.to_string(),
            None => file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
        };
        let mime = mime_type
            .map(str::to_string)
            .unwrap_or_else(|| mime_guess::from_path(&filename).first_or_octet_stream().to_string());
        let handle = tokio::fs::File::open(file).await?;
        let size = handle.metadata().await?.len();
        let quoted = urlencoding::encode(&safe_filename(&filename)).into_owned();

        let mut request = self
            .http
            .post(&url)
            .header("X-File-Name", quoted)
            .header("X-File-Size", size.to_string())
            .header("X-File-Type", mime)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(CONTENT_LENGTH, size.to_string());
        if !modern {
            request = request
                .header("X-Batch-Id", batch_id)
                .header("X-File-Idx", file_index.to_string());
        }

        let outcome = Arc::new(StreamOutcome::default());
        self.session.upload().stats().start(ctx.id, size, &filename);
        let stream = UploadStream {
            file: handle,
            session: self.session.clone(),
            ctx: ctx.clone(),
            label: format!("File upload: {}", file.display()),
            outcome: outcome.clone(),
        };
        tracing::trace!(%url, file = %file.display(), modern, "uploading");
        let sent = self
            .common(request)
            .timeout(self.blob_timeout)
            .body(reqwest::Body::wrap_stream(body_stream(stream)))
            .send()
            .await;
        if !outcome.finished.load(Ordering::SeqCst) {
            self.session.upload().stats().end(ctx.id);
        }
        if let Some(err) = outcome.abort.lock().take() {
            return Err(err);
        }
        let response = sent.map_err(|e| self.transport_error(e))?;
        let response = self.check_status(response).await?;
        tracing::trace!(file = %file.display(), "upload completed");
        match read_response(response).await? {
            ExecuteOutput::Json(value) => Ok(value),
            ExecuteOutput::Bytes(raw) => Ok(Value::String(String::from_utf8_lossy(&raw).into_owned())),
            _ => Ok(Value::Null),
        }
    }

    /// Runs `operation` against an uploaded batch file.
    pub async fn execute_batch(
        &self,
        operation: &str,
        batch_id: &str,
        file_idx: &str,
        tx_timeout: Duration,
        params: Map<String, Value>,
    ) -> Result<ExecuteOutput, TransferError> {
        let options = ExecuteOptions {
            timeout: Some(tx_timeout),
            check_params: false,
            extra_headers: vec![(
                "Nuxeo-Transaction-Timeout".to_string(),
                tx_timeout.as_secs().to_string(),
            )],
            ..ExecuteOptions::default()
        };
        if self.session.is_new_upload_api_available() {
            let url = format!(
                "{}{BATCH_UPLOAD_PATH}/{batch_id}/{file_idx}/execute/{operation}",
                self.rest_api_url
            );
            self.execute_at(&url, params, options, None).await
        } else {
            let mut batch_params = params;
            batch_params.insert("operationId".into(), Value::String(operation.to_string()));
            batch_params.insert("batchId".into(), Value::String(batch_id.to_string()));
            batch_params.insert("fileIdx".into(), Value::String(file_idx.to_string()));
            let url = format!("{}{LEGACY_BATCH_EXECUTE}", self.automation_url);
            self.execute_at(&url, batch_params, options, None).await
        }
    }
}
