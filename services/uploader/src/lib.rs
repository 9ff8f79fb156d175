//! Image Upload Service
//!
//! Captures images to local storage, keeps a durable catalog of every image
//! and its upload status in SQLite, and uploads images to a remote endpoint
//! as multipart POST requests. Progress and status changes are fanned out to
//! any number of observers.
//!
//! ## Features
//!
//! - **Durable Status**: every status change is persisted before it is
//!   published; a restart resumes from the catalog
//! - **Single Dispatch**: concurrent triggers for the same image result in one
//!   transfer, decided by a compare-and-set in the store
//! - **Missing File Detection**: images whose file vanished are marked
//!   `FileMissing` instead of being sent
//! - **Live Progress**: per-image progress in `[0, 1]` and status changes over
//!   an in-process bus and a server-sent event stream
//!
//! ## Architecture
//!
//! ```text
//! Capture Device             SQLite                      Upload Endpoint
//! ┌──────────────┐           ┌──────────────┐           ┌──────────────┐
//! │ Capture      │           │ images       │           │ POST         │
//! │ Adapter      │           │  (status)    │           │  multipart   │
//! └──────────────┘           └──────────────┘           └──────────────┘
//!        │                     ▲        ▲                      ▲
//!        ▼                     │        │                      │
//! ┌──────────────┐             │  ┌──────────────┐     ┌──────────────┐
//! │ Capture      │─────────────┘  │ Upload       │────▶│ Upload       │
//! │ Controller   │                │ Coordinator  │◀────│ Transport    │
//! └──────────────┘                └──────────────┘     └──────────────┘
//!                                        │
//!                                        ▼
//!                                 ┌──────────────┐     ┌──────────────┐
//!                                 │ Progress     │────▶│ HTTP API     │
//!                                 │ Bus          │     │  + SSE       │
//!                                 └──────────────┘     └──────────────┘
//! ```

pub mod api;
pub mod capture;
pub mod config;
pub mod image_store;
pub mod progress_bus;
pub mod record;
pub mod transport;
pub mod upload_coordinator;

pub use api::{start_api_server, AppState};
pub use capture::{CaptureAdapter, CaptureController, CaptureError};
pub use config::Config;
pub use image_store::{ImageStore, StatusCounts, StoreError};
pub use progress_bus::{BusEvent, ProgressBus, Subscription};
pub use record::{ImageRecord, ImageStatus};
pub use transport::{HttpUploadTransport, TransportOutcome, UploadTransport};
pub use upload_coordinator::{
    BatchSummary, ReconcileSummary, UploadCoordinator, UploadDispatch, UploadError,
};
