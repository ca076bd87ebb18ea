use crate::client::TransferClient;
use crate::context::WorkerContext;
use crate::digest::{DigestAlgorithm, ExpectedDigest, Hasher};
use crate::lock::PathUnlock;
use crate::TransferError;
use bytes::{Bytes, BytesMut};
use nxsync_ratelimit::tokens_for;
use reqwest::header::CONTENT_LENGTH;
use reqwest::Response;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadTarget {
    Memory,
    File(PathBuf),
}

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutput {
    Bytes(Bytes),
    File(PathBuf),
}

enum Sink {
    Memory(BytesMut),
    File(tokio::fs::File),
}

impl Sink {
    async fn write(&mut self, chunk: &[u8]) -> std::io::Result<()> {
        match self {
            Sink::Memory(buf) => {
                buf.extend_from_slice(chunk);
                Ok(())
            }
            Sink::File(file) => file.write_all(chunk).await,
        }
    }

    async fn close(self) -> std::io::Result<Option<Bytes>> {
        match self {
            Sink::Memory(buf) => Ok(Some(buf.freeze())),
            Sink::File(mut file) => {
                file.flush().await?;
                Ok(None)
            }
        }
    }
}

impl TransferClient {
    /// Downloads `url`, throttled through the download bucket.
    ///
    /// With a digest the content is verified; a mismatch deletes the written
    /// file and returns [`TransferError::CorruptedFile`]. Any failure after
    /// the file was created removes it.
    pub async fn do_get(
        &self,
        url: &str,
        target: DownloadTarget,
        digest: Option<&str>,
        algorithm: Option<DigestAlgorithm>,
        ctx: &WorkerContext,
    ) -> Result<DownloadOutput, TransferError> {
        tracing::trace!(%url, ?target, ?digest, ?algorithm, "downloading");
        let expected = digest
            .map(|d| ExpectedDigest::new(d, algorithm))
            .transpose()?;
        let response = self
            .common(self.http.get(url))
            .timeout(self.blob_timeout)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;
        let response = self.check_status(response).await?;
        let total = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        match target {
            DownloadTarget::Memory => {
                ctx.reporter.begin(ctx.id, "Download", url, Some(total));
                let sink = Sink::Memory(BytesMut::new());
                let result = self
                    .stream_body(response, sink, url, total, expected.as_ref(), None, ctx)
                    .await;
                ctx.reporter.finish(ctx.id);
                match result? {
                    Some(bytes) => Ok(DownloadOutput::Bytes(bytes)),
                    None => Ok(DownloadOutput::Bytes(Bytes::new())),
                }
            }
            DownloadTarget::File(path) => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                ctx.reporter.begin(ctx.id, "Download", &name, Some(total));
                let result = self
                    .download_to_file(response, &path, &name, total, expected.as_ref(), ctx)
                    .await;
                ctx.reporter.finish(ctx.id);
                result.map(|_| DownloadOutput::File(path))
            }
        }
    }

    async fn download_to_file(
        &self,
        response: Response,
        path: &Path,
        name: &str,
        total: u64,
        expected: Option<&ExpectedDigest>,
        ctx: &WorkerContext,
    ) -> Result<(), TransferError> {
        let guard = PathUnlock::acquire(path)?;
        let result = async {
            let file = tokio::fs::File::create(path).await?;
            self.stream_body(response, Sink::File(file), name, total, expected, Some(path), ctx)
                .await
        }
        .await;
        if let Err(err) = &result {
            match tokio::fs::remove_file(path).await {
                Ok(()) => tracing::debug!(path = %path.display(), error = %err, "removed partial download"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove partial download"),
            }
        }
        drop(guard);
        result.map(|_| ())
    }

    #[allow(clippy::too_many_arguments)]
    async fn stream_body(
        &self,
        mut response: Response,
        mut sink: Sink,
        name: &str,
        total: u64,
        expected: Option<&ExpectedDigest>,
        path: Option<&Path>,
        ctx: &WorkerContext,
    ) -> Result<Option<Bytes>, TransferError> {
        let lane = self.session.download();
        let label = format!(
            "File download: {}",
            path.map(|p| p.display().to_string()).unwrap_or_else(|| name.to_string())
        );
        let mut hasher: Option<Hasher> = expected.map(|e| e.algorithm.hasher());
        let mut pending = BytesMut::new();
        lane.stats().start(ctx.id, total, name);

        let streamed: Result<(), TransferError> = async {
            let mut eof = false;
            while !eof {
                ctx.checkpoint(&label).await?;
                // follows limit changes made mid-transfer
                let buffer = self.session.download_buffer_size();
                while pending.len() < buffer {
                    match response.chunk().await.map_err(|e| self.transport_error(e))? {
                        Some(chunk) => pending.extend_from_slice(&chunk),
                        None => {
                            eof = true;
                            break;
                        }
                    }
                }
                loop {
                    let buffer = self.session.download_buffer_size();
                    if pending.is_empty() || (!eof && pending.len() < buffer) {
                        break;
                    }
                    let take = pending.len().min(buffer);
                    let piece = pending.split_to(take);
                    let waited = lane.bucket().acquire(ctx.id, tokens_for(piece.len())).await;
                    if !waited.is_zero() {
                        tracing::trace!(
                            target: "nxsync.transfer",
                            worker = %ctx.id,
                            waited_ms = waited.as_millis() as u64,
                            "waited to download"
                        );
                    }
                    sink.write(&piece).await?;
                    if let Some(h) = hasher.as_mut() {
                        h.update(&piece);
                    }
                    lane.stats().update(ctx.id, piece.len() as u64);
                    ctx.reporter.advance(ctx.id, piece.len() as u64);
                }
            }
            Ok(())
        }
        .await;
        let average = lane.stats().end(ctx.id);
        tracing::trace!(target: "nxsync.transfer", worker = %ctx.id, average_kbps = average, "download finished");
        streamed?;
        let bytes = sink.close().await?;

        if let (Some(expected), Some(hasher)) = (expected, hasher) {
            let actual = hasher.finalize_hex();
            if !expected.matches(&actual) {
                return Err(TransferError::CorruptedFile {
                    path: path.map(Path::to_path_buf),
                    expected: expected.value.clone(),
                    actual,
                });
            }
        }
        Ok(bytes)
    }
}
