use crate::config::CaptureConfig;
use crate::image_store::{ImageStore, StoreError};
use crate::record::ImageRecord;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Errors that can occur while capturing or saving an image
#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("capture unavailable: {0}")]
    Unavailable(String),

    #[error("failed to write image: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Raw image produced by a capture device
#[derive(Debug, Clone)]
pub struct CapturedImage {
    pub bytes: Bytes,
    pub captured_at: DateTime<Utc>,
}

/// Source of raw image bytes
#[async_trait]
pub trait CaptureAdapter: Send + Sync {
    async fn capture(&self) -> Result<CapturedImage, CaptureError>;
}

/// Adapter used when no capture device is configured
pub struct UnavailableCapture;

#[async_trait]
impl CaptureAdapter for UnavailableCapture {
    async fn capture(&self) -> Result<CapturedImage, CaptureError> {
        Err(CaptureError::Unavailable(
            "no capture command configured".to_string(),
        ))
    }
}

/// Captures by running a program that writes one image to stdout
pub struct CommandCapture {
    program: String,
    args: Vec<String>,
}

impl CommandCapture {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }
}

#[async_trait]
impl CaptureAdapter for CommandCapture {
    #[instrument(skip(self), fields(program = %self.program))]
    async fn capture(&self) -> Result<CapturedImage, CaptureError> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| {
                CaptureError::Unavailable(format!("failed to run {}: {e}", self.program))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(CaptureError::Unavailable(format!(
                "{} exited with {}: {}",
                self.program,
                output.status,
                stderr.trim()
            )));
        }

        if output.stdout.is_empty() {
            return Err(CaptureError::Unavailable(format!(
                "{} produced no image data",
                self.program
            )));
        }

        debug!(size_bytes = output.stdout.len(), "Image captured");

        Ok(CapturedImage {
            bytes: Bytes::from(output.stdout),
            captured_at: Utc::now(),
        })
    }
}

/// Build the adapter described by the capture config
pub fn adapter_from_config(config: &CaptureConfig) -> Arc<dyn CaptureAdapter> {
    match &config.command {
        Some(program) => {
            info!(program = %program, args = ?config.args, "Using command capture");
            Arc::new(CommandCapture::new(program.clone(), config.args.clone()))
        }
        None => {
            warn!("No capture command configured; capture requests will be rejected");
            Arc::new(UnavailableCapture)
        }
    }
}

/// Persists captured images and registers them as pending uploads
pub struct CaptureController {
    store: ImageStore,
    adapter: Arc<dyn CaptureAdapter>,
    image_dir: PathBuf,
}

impl CaptureController {
    pub fn new(
        store: ImageStore,
        adapter: Arc<dyn CaptureAdapter>,
        image_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            adapter,
            image_dir: image_dir.into(),
        }
    }

    /// Capture from the device and save the result
    pub async fn capture(&self) -> Result<ImageRecord, CaptureError> {
        let image = self.adapter.capture().await?;
        self.save(image.bytes, image.captured_at).await
    }

    /// Write the bytes to the image directory and insert a Pending record
    #[instrument(skip(self, bytes), fields(size_bytes = bytes.len()))]
    pub async fn save(
        &self,
        bytes: Bytes,
        captured_at: DateTime<Utc>,
    ) -> Result<ImageRecord, CaptureError> {
        tokio::fs::create_dir_all(&self.image_dir).await?;

        let id = Uuid::new_v4();
        let display_name = format!("{id}.jpg");
        let local_path = self.image_dir.join(&display_name);

        tokio::fs::write(&local_path, &bytes).await?;

        let record = ImageRecord::new_pending(id, &local_path, display_name, captured_at);
        if let Err(e) = self.store.insert(&record).await {
            if let Err(cleanup) = tokio::fs::remove_file(&local_path).await {
                warn!(
                    error = %cleanup,
                    path = %local_path.display(),
                    "Failed to remove orphaned image"
                );
            }
            return Err(e.into());
        }

        metrics::counter!("uploader.images.captured").increment(1);
        info!(id = %id, path = %local_path.display(), "Image saved");

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image_store::tests::test_store;
    use crate::record::ImageStatus;

    struct FixedCapture(&'static [u8]);

    #[async_trait]
    impl CaptureAdapter for FixedCapture {
        async fn capture(&self) -> Result<CapturedImage, CaptureError> {
            Ok(CapturedImage {
                bytes: Bytes::from_static(self.0),
                captured_at: Utc::now(),
            })
        }
    }

    #[tokio::test]
    async fn test_capture_writes_file_and_pending_record() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let controller = CaptureController::new(
            store.clone(),
            Arc::new(FixedCapture(b"\xff\xd8jpeg")),
            dir.path().join("images"),
        );

        let record = controller.capture().await.unwrap();

        assert_eq!(record.status, ImageStatus::Pending);
        assert_eq!(record.display_name, format!("{}.jpg", record.id));
        assert_eq!(std::fs::read(&record.local_path).unwrap(), b"\xff\xd8jpeg");
        let stored = store.get_by_id(record.id).await.unwrap();
        assert_eq!(stored.local_path, record.local_path);
        assert_eq!(stored.status, ImageStatus::Pending);
    }

    #[tokio::test]
    async fn test_unavailable_capture_inserts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir).await;
        let controller = CaptureController::new(
            store.clone(),
            Arc::new(UnavailableCapture),
            dir.path().join("images"),
        );

        let err = controller.capture().await.unwrap_err();

        assert!(matches!(err, CaptureError::Unavailable(_)));
        assert!(store.get_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_adapter_from_config() {
        let unconfigured = adapter_from_config(&CaptureConfig::default());
        let err = tokio_test::assert_err!(tokio_test::block_on(unconfigured.capture()));
        assert!(matches!(err, CaptureError::Unavailable(_)));

        #[cfg(unix)]
        {
            let configured = adapter_from_config(&CaptureConfig {
                command: Some("sh".to_string()),
                args: vec!["-c".into(), "printf frame".into()],
                ..Default::default()
            });
            let image = tokio_test::assert_ok!(tokio_test::block_on(configured.capture()));
            assert_eq!(image.bytes, Bytes::from_static(b"frame"));
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let capture = CommandCapture::new("definitely-not-a-camera-binary", vec![]);
        assert!(matches!(capture.capture().await, Err(CaptureError::Unavailable(_))));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_capture_reads_stdout() {
        let capture = CommandCapture::new("sh", vec!["-c".into(), "printf jpegdata".into()]);
        let image = capture.capture().await.unwrap();
        assert_eq!(image.bytes, Bytes::from_static(b"jpegdata"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_failure_or_empty_output_is_unavailable() {
        let failing =
            CommandCapture::new("sh", vec!["-c".into(), "echo no camera >&2; exit 3".into()]);
        match failing.capture().await {
            Err(CaptureError::Unavailable(reason)) => assert!(reason.contains("no camera")),
            other => panic!("Expected Unavailable, got {other:?}"),
        }

        let silent = CommandCapture::new("true", vec![]);
        assert!(matches!(silent.capture().await, Err(CaptureError::Unavailable(_))));
    }
}
