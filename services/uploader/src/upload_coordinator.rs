//! Upload state machine.
//!
//! The coordinator is the only writer of image status after capture. Every
//! transition goes through [`ImageStore::compare_and_set_status`], so racing
//! triggers (initial upload, bulk retry, a manual retry) resolve in the
//! database: exactly one caller moves a record to `Uploading` and dispatches
//! the transfer, the others are rejected.

use crate::image_store::{ImageStore, StoreError};
use crate::progress_bus::ProgressBus;
use crate::record::{ImageRecord, ImageStatus};
use crate::transport::{ProgressSink, TransportOutcome, UploadRequest, UploadTransport};
use bytes::Bytes;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::ErrorKind;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Errors returned when an upload cannot be started
#[derive(Debug, Error)]
pub enum UploadError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("upload already in flight for image {0}")]
    AlreadyInFlight(Uuid),

    #[error("image {id} is {status} and cannot be uploaded")]
    NotEligible { id: Uuid, status: ImageStatus },
}

/// What `request_upload` did with the record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadDispatch {
    /// Record moved to `Uploading`, transfer spawned
    Started,
    /// Local file was gone; record moved to `FileMissing`
    FileMissing,
}

/// Result of a bulk trigger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub started: usize,
    pub file_missing: usize,
    pub rejected: usize,
}

/// Result of the startup consistency scan
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    pub file_missing: usize,
    pub interrupted: usize,
}

/// Status a terminal transport outcome maps to
fn resulting_status(outcome: &TransportOutcome) -> ImageStatus {
    match outcome {
        TransportOutcome::Success(200) => ImageStatus::Completed,
        TransportOutcome::Success(_) | TransportOutcome::TransportError(_) => ImageStatus::Failed,
    }
}

/// An upload attempt running in this process
#[derive(Debug, Clone, Copy)]
struct Attempt {
    generation: u64,
    /// Last published progress
    progress: f32,
}

fn rejection(id: Uuid, status: ImageStatus) -> UploadError {
    match status {
        ImageStatus::Uploading => UploadError::AlreadyInFlight(id),
        status => UploadError::NotEligible { id, status },
    }
}

/// Drives images through the upload state machine
#[derive(Clone)]
pub struct UploadCoordinator {
    store: ImageStore,
    transport: Arc<dyn UploadTransport>,
    bus: ProgressBus,
    /// In-flight attempts, reserved before the record moves to `Uploading`
    attempts: Arc<Mutex<HashMap<Uuid, Attempt>>>,
    generations: Arc<AtomicU64>,
    upload_slots: Arc<Semaphore>,
    tasks: TaskTracker,
}

impl UploadCoordinator {
    pub fn new(
        store: ImageStore,
        transport: Arc<dyn UploadTransport>,
        bus: ProgressBus,
        upload_concurrency: usize,
    ) -> Self {
        Self {
            store,
            transport,
            bus,
            attempts: Arc::new(Mutex::new(HashMap::new())),
            generations: Arc::new(AtomicU64::new(0)),
            upload_slots: Arc::new(Semaphore::new(upload_concurrency.max(1))),
            tasks: TaskTracker::new(),
        }
    }

    /// Start uploading one image.
    ///
    /// Returns once the status write is done; the transfer itself runs on a
    /// spawned task and reports back through `on_transport_progress` and
    /// `on_transport_result`.
    #[instrument(skip(self))]
    pub async fn request_upload(&self, id: Uuid) -> Result<UploadDispatch, UploadError> {
        let record = self.store.get_by_id(id).await?;
        if !record.status.is_uploadable() {
            return Err(rejection(id, record.status));
        }

        if !record.file_exists().await {
            if self.mark_file_missing(id, None, &ImageStatus::UPLOADABLE).await? {
                return Ok(UploadDispatch::FileMissing);
            }
            return self.lost_race(id).await;
        }

        let generation = self
            .reserve_attempt(id)
            .ok_or(UploadError::AlreadyInFlight(id))?;

        let moved = self
            .store
            .compare_and_set_status(id, &ImageStatus::UPLOADABLE, ImageStatus::Uploading)
            .await;
        match moved {
            Ok(true) => {}
            Ok(false) => {
                self.release_attempt(id, generation);
                return self.lost_race(id).await;
            }
            Err(e) => {
                self.release_attempt(id, generation);
                return Err(e.into());
            }
        }

        self.bus.publish_status(id, ImageStatus::Uploading);
        metrics::counter!("uploader.uploads.started").increment(1);
        info!(id = %id, from = %record.status, generation, "Upload dispatched");

        let this = self.clone();
        self.tasks
            .spawn(async move { this.run_upload(record, generation).await });

        Ok(UploadDispatch::Started)
    }

    /// User-initiated retry of a single image
    pub async fn retry_one(&self, id: Uuid) -> Result<UploadDispatch, UploadError> {
        self.request_upload(id).await
    }

    /// Request upload of every `Failed` image
    pub async fn retry_all(&self) -> Result<BatchSummary, UploadError> {
        self.request_all(ImageStatus::Failed).await
    }

    /// Request upload of every `Pending` image
    pub async fn upload_pending(&self) -> Result<BatchSummary, UploadError> {
        self.request_all(ImageStatus::Pending).await
    }

    #[instrument(skip(self))]
    async fn request_all(&self, status: ImageStatus) -> Result<BatchSummary, UploadError> {
        let records = self.store.get_by_status(status).await?;
        let mut summary = BatchSummary::default();

        for record in records {
            match self.request_upload(record.id).await {
                Ok(UploadDispatch::Started) => summary.started += 1,
                Ok(UploadDispatch::FileMissing) => summary.file_missing += 1,
                Err(e) => {
                    warn!(id = %record.id, error = %e, "Skipping image in bulk upload");
                    summary.rejected += 1;
                }
            }
        }

        info!(
            status = %status,
            started = summary.started,
            file_missing = summary.file_missing,
            rejected = summary.rejected,
            "Bulk upload requested"
        );

        Ok(summary)
    }

    /// Publish transfer progress for an in-flight attempt.
    ///
    /// Values lower than the last one published for the attempt are dropped,
    /// as is progress for images that are not in flight.
    pub fn on_transport_progress(&self, id: Uuid, bytes_sent: u64, bytes_total: u64) {
        let progress = if bytes_total > 0 {
            (bytes_sent as f64 / bytes_total as f64).clamp(0.0, 1.0) as f32
        } else {
            0.0
        };

        let mut attempts = self.attempts.lock();
        let Some(attempt) = attempts.get_mut(&id) else {
            debug!(id = %id, "Progress for image not in flight ignored");
            return;
        };
        if progress < attempt.progress {
            return;
        }

        attempt.progress = progress;
        self.bus.publish_progress(id, progress);
    }

    /// Persist the terminal outcome of a transfer and publish the new status.
    ///
    /// Delivering the same outcome again leaves the record as it is and
    /// publishes nothing. While a transfer for the image runs in this
    /// process only that transfer's own outcome is applied; results
    /// delivered here are ignored until it finishes.
    pub async fn on_transport_result(
        &self,
        id: Uuid,
        outcome: TransportOutcome,
    ) -> Result<ImageStatus, UploadError> {
        self.apply_result(id, None, outcome).await
    }

    #[instrument(skip(self))]
    async fn apply_result(
        &self,
        id: Uuid,
        generation: Option<u64>,
        outcome: TransportOutcome,
    ) -> Result<ImageStatus, UploadError> {
        let live = self.attempts.lock().get(&id).map(|a| a.generation);
        if live.is_some() && live != generation {
            warn!(id = %id, live = ?live, "Result for another upload attempt ignored");
            return Ok(self.store.get_by_id(id).await?.status);
        }

        let target = resulting_status(&outcome);
        let current = self.store.get_by_id(id).await?.status;

        if current == target {
            debug!(id = %id, status = %current, "Duplicate transport result ignored");
            return Ok(current);
        }
        if current != ImageStatus::Uploading {
            warn!(
                id = %id,
                status = %current,
                "Transport result for image not in flight ignored"
            );
            return Ok(current);
        }

        if !self
            .store
            .compare_and_set_status(id, &[ImageStatus::Uploading], target)
            .await?
        {
            return Ok(self.store.get_by_id(id).await?.status);
        }

        self.finish_attempt(id, generation, target);

        match &outcome {
            TransportOutcome::Success(200) => {
                metrics::counter!("uploader.uploads.completed").increment(1);
                info!(id = %id, "Upload completed");
            }
            TransportOutcome::Success(code) => {
                metrics::counter!("uploader.uploads.failed", "reason" => "status").increment(1);
                warn!(id = %id, status_code = code, "Upload rejected by endpoint");
            }
            TransportOutcome::TransportError(reason) => {
                metrics::counter!("uploader.uploads.failed", "reason" => "transport").increment(1);
                warn!(id = %id, reason = %reason, "Upload failed");
            }
        }

        Ok(target)
    }

    /// Repair state left behind by a previous process.
    ///
    /// Records whose file vanished become `FileMissing`; `Uploading` records
    /// with no transfer running in this process become `Failed`. Meant to run
    /// once at startup, before triggers are accepted; attempts started by
    /// this coordinator are skipped.
    #[instrument(skip(self))]
    pub async fn reconcile(&self) -> Result<ReconcileSummary, UploadError> {
        let mut summary = ReconcileSummary::default();

        for record in self.store.get_all().await? {
            let from = record.status;
            let live = self.attempts.lock().contains_key(&record.id);
            let repairable = matches!(
                from,
                ImageStatus::Pending | ImageStatus::Uploading | ImageStatus::Failed
            );
            if live || !repairable {
                continue;
            }

            if !record.file_exists().await {
                if self.mark_file_missing(record.id, None, &[from]).await? {
                    summary.file_missing += 1;
                }
            } else if from == ImageStatus::Uploading
                && self
                    .store
                    .compare_and_set_status(
                        record.id,
                        &[ImageStatus::Uploading],
                        ImageStatus::Failed,
                    )
                    .await?
            {
                warn!(id = %record.id, "Interrupted upload marked failed");
                self.bus.publish_status(record.id, ImageStatus::Failed);
                summary.interrupted += 1;
            }
        }

        info!(
            file_missing = summary.file_missing,
            interrupted = summary.interrupted,
            "Image catalog reconciled"
        );

        Ok(summary)
    }

    /// Wait for every spawned transfer to finish
    pub async fn wait_idle(&self) {
        self.tasks.close();
        self.tasks.wait().await;
        self.tasks.reopen();
    }

    /// Number of transfer tasks still running
    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    async fn run_upload(self, record: ImageRecord, generation: u64) {
        let id = record.id;

        // The semaphore is never closed, so this only waits for a free slot
        let _slot = self.upload_slots.acquire().await;

        let payload = match tokio::fs::read(&record.local_path).await {
            Ok(bytes) => Bytes::from(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                let missing = self
                    .mark_file_missing(id, Some(generation), &[ImageStatus::Uploading])
                    .await;
                if let Err(e) = missing {
                    error!(id = %id, error = %e, "Failed to record missing file");
                }
                return;
            }
            Err(e) => {
                let reason = format!("failed to read {}: {e}", record.local_path.display());
                self.deliver(id, generation, TransportOutcome::TransportError(reason))
                    .await;
                return;
            }
        };

        let request = UploadRequest {
            id,
            file_name: record.display_name,
            payload,
        };

        let started = Instant::now();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let send = self.transport.send(request, ProgressSink::new(id, tx));
        tokio::pin!(send);

        let outcome = loop {
            tokio::select! {
                outcome = &mut send => break outcome,
                Some(progress) = rx.recv() => {
                    self.on_transport_progress(id, progress.bytes_sent, progress.bytes_total);
                }
            }
        };

        // Progress reported right before completion still precedes the result
        while let Ok(progress) = rx.try_recv() {
            self.on_transport_progress(id, progress.bytes_sent, progress.bytes_total);
        }

        metrics::histogram!("uploader.upload.duration_seconds")
            .record(started.elapsed().as_secs_f64());

        self.deliver(id, generation, outcome).await;
    }

    async fn deliver(&self, id: Uuid, generation: u64, outcome: TransportOutcome) {
        if let Err(e) = self.apply_result(id, Some(generation), outcome).await {
            error!(id = %id, error = %e, "Failed to record upload outcome");
        }
    }

    /// Move to `FileMissing` from one of `from`; returns whether it applied
    async fn mark_file_missing(
        &self,
        id: Uuid,
        generation: Option<u64>,
        from: &[ImageStatus],
    ) -> Result<bool, StoreError> {
        if !self
            .store
            .compare_and_set_status(id, from, ImageStatus::FileMissing)
            .await?
        {
            return Ok(false);
        }

        self.finish_attempt(id, generation, ImageStatus::FileMissing);
        metrics::counter!("uploader.images.file_missing").increment(1);
        warn!(id = %id, "Image file missing");

        Ok(true)
    }

    /// Claim the attempt slot for `id`; `None` if an attempt is already live
    fn reserve_attempt(&self, id: Uuid) -> Option<u64> {
        let mut attempts = self.attempts.lock();
        if attempts.contains_key(&id) {
            return None;
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        attempts.insert(
            id,
            Attempt {
                generation,
                progress: 0.0,
            },
        );
        Some(generation)
    }

    fn release_attempt(&self, id: Uuid, generation: u64) {
        let mut attempts = self.attempts.lock();
        if attempts.get(&id).is_some_and(|a| a.generation == generation) {
            attempts.remove(&id);
        }
    }

    /// Publish the final status of `id`, ending attempt `generation` if it is
    /// the live one. No progress for that attempt is published after this.
    fn finish_attempt(&self, id: Uuid, generation: Option<u64>, status: ImageStatus) {
        let mut attempts = self.attempts.lock();
        if let Some(generation) = generation {
            if attempts.get(&id).is_some_and(|a| a.generation == generation) {
                attempts.remove(&id);
            }
        }
        self.bus.publish_status(id, status);
    }

    async fn lost_race(&self, id: Uuid) -> Result<UploadDispatch, UploadError> {
        match self.store.get_by_id(id).await?.status {
            ImageStatus::FileMissing => Ok(UploadDispatch::FileMissing),
            status => Err(rejection(id, status)),
        }
    }
}
