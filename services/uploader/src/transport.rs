use crate::config::UploadConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};
use reqwest::multipart::{Form, Part};
use reqwest::{Body, Client};
use std::path::Path;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, trace, warn};
use uuid::Uuid;

/// Multipart field carrying the image bytes
pub const IMAGE_FIELD: &str = "image";

/// A single upload handed to the transport
#[derive(Debug, Clone)]
pub struct UploadRequest {
    /// Correlation key for progress and result
    pub id: Uuid,
    /// Original file name sent with the part
    pub file_name: String,
    /// Image bytes, possibly empty
    pub payload: Bytes,
}

/// Terminal result of one transport request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportOutcome {
    /// The endpoint answered with this HTTP status
    Success(u16),
    /// The request never produced a response
    TransportError(String),
}

/// Incremental progress reported by a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub bytes_sent: u64,
    pub bytes_total: u64,
}

/// Handle a transport uses to report progress for one request
#[derive(Debug, Clone)]
pub struct ProgressSink {
    id: Uuid,
    tx: mpsc::UnboundedSender<TransferProgress>,
}

impl ProgressSink {
    pub fn new(id: Uuid, tx: mpsc::UnboundedSender<TransferProgress>) -> Self {
        Self { id, tx }
    }

    /// Sink that discards everything
    #[cfg(test)]
    pub fn detached(id: Uuid) -> Self {
        let (tx, _) = mpsc::unbounded_channel();
        Self { id, tx }
    }

    pub fn report(&self, bytes_sent: u64, bytes_total: u64) {
        trace!(id = %self.id, bytes_sent, bytes_total, "Upload progress");
        // Receiver gone means the attempt already finished
        let _ = self.tx.send(TransferProgress {
            bytes_sent,
            bytes_total,
        });
    }
}

/// Sends image payloads to the remote endpoint.
///
/// The returned future resolves exactly once per request. Implementations
/// must report every failure, including failure to dispatch at all, as
/// [`TransportOutcome::TransportError`] so no request is left without a
/// terminal outcome.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait UploadTransport: Send + Sync {
    async fn send(&self, request: UploadRequest, progress: ProgressSink) -> TransportOutcome;
}

/// Multipart HTTP transport
pub struct HttpUploadTransport {
    client: Client,
    endpoint_url: String,
    chunk_size: usize,
}

impl HttpUploadTransport {
    pub fn new(config: &UploadConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout())
            .user_agent(concat!("upload-service/", env!("CARGO_PKG_VERSION")));

        if let Some(timeout) = config.request_timeout() {
            builder = builder.timeout(timeout);
        }

        let client = builder.build().context("Failed to build HTTP client")?;

        info!(
            endpoint = %config.endpoint_url,
            chunk_size = config.chunk_size_bytes,
            "HTTP upload transport initialized"
        );

        Ok(Self {
            client,
            endpoint_url: config.endpoint_url.clone(),
            chunk_size: config.chunk_size_bytes.max(1),
        })
    }

    fn build_form(&self, request: UploadRequest, progress: ProgressSink) -> reqwest::Result<Form> {
        let total = request.payload.len() as u64;
        let content_type = get_content_type(&request.file_name);
        let body = progress_body(request.payload, self.chunk_size, progress);

        let part = Part::stream_with_length(body, total)
            .file_name(request.file_name)
            .mime_str(content_type)?;

        Ok(Form::new().part(IMAGE_FIELD, part))
    }
}

#[async_trait]
impl UploadTransport for HttpUploadTransport {
    #[instrument(
        skip(self, request, progress),
        fields(id = %request.id, size_bytes = request.payload.len())
    )]
    async fn send(&self, request: UploadRequest, progress: ProgressSink) -> TransportOutcome {
        progress.report(0, request.payload.len() as u64);

        let form = match self.build_form(request, progress) {
            Ok(form) => form,
            Err(e) => return TransportOutcome::TransportError(e.to_string()),
        };

        match self.client.post(&self.endpoint_url).multipart(form).send().await {
            Ok(response) => {
                let status = response.status();
                debug!(status = status.as_u16(), "Upload response received");
                TransportOutcome::Success(status.as_u16())
            }
            Err(e) => {
                warn!(error = %e, "Upload request failed");
                TransportOutcome::TransportError(e.to_string())
            }
        }
    }
}

/// Request body that reports progress as each chunk is pulled by the client
fn progress_body(payload: Bytes, chunk_size: usize, progress: ProgressSink) -> Body {
    let total = payload.len() as u64;
    let chunks: Vec<Bytes> = (0..payload.len())
        .step_by(chunk_size)
        .map(|start| payload.slice(start..(start + chunk_size).min(payload.len())))
        .collect();

    let mut sent = 0u64;
    let stream = stream::iter(chunks).map(move |chunk| {
        sent += chunk.len() as u64;
        progress.report(sent, total);
        Ok::<_, std::io::Error>(chunk)
    });

    Body::wrap_stream(stream)
}

/// Get content type from the file extension
fn get_content_type(file_name: &str) -> &'static str {
    let extension = Path::new(file_name)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default()
        .to_lowercase();

    match extension.as_str() {
        "jpeg" | "jpg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "gif" => "image/gif",
        _ => "application/octet-stream",
    }
}
