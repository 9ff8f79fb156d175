//! Image records and the upload status state machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Upload status of a captured image
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ImageStatus {
    /// Captured, never sent
    Pending,
    /// A transport request is in flight
    Uploading,
    /// Remote endpoint answered 200
    Completed,
    /// Transport error or non-200 response; retryable
    Failed,
    /// Local file disappeared; terminal
    FileMissing,
}

impl ImageStatus {
    pub const ALL: [ImageStatus; 5] = [
        ImageStatus::Pending,
        ImageStatus::Uploading,
        ImageStatus::Completed,
        ImageStatus::Failed,
        ImageStatus::FileMissing,
    ];

    /// States from which an upload may be started
    pub const UPLOADABLE: [ImageStatus; 2] = [ImageStatus::Pending, ImageStatus::Failed];

    pub fn as_str(&self) -> &'static str {
        match self {
            ImageStatus::Pending => "Pending",
            ImageStatus::Uploading => "Uploading",
            ImageStatus::Completed => "Completed",
            ImageStatus::Failed => "Failed",
            ImageStatus::FileMissing => "FileMissing",
        }
    }

    /// Whether `self -> next` is an edge of the upload state machine
    pub fn can_transition_to(self, next: ImageStatus) -> bool {
        use ImageStatus::*;

        matches!(
            (self, next),
            (Pending, Uploading)
                | (Failed, Uploading)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Pending, FileMissing)
                | (Uploading, FileMissing)
                | (Failed, FileMissing)
        )
    }

    pub fn is_uploadable(self) -> bool {
        Self::UPLOADABLE.contains(&self)
    }
}

impl fmt::Display for ImageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown image status: {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for ImageStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ImageStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

/// A captured image tracked through upload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    /// Unique image ID, also the transport correlation key
    pub id: Uuid,
    /// Where the image bytes live on disk
    pub local_path: PathBuf,
    /// File name sent with the upload
    pub display_name: String,
    /// Capture timestamp
    pub captured_at: DateTime<Utc>,
    /// Current upload status
    pub status: ImageStatus,
}

impl ImageRecord {
    /// A freshly captured image, not yet uploaded
    pub fn new_pending(
        id: Uuid,
        local_path: impl Into<PathBuf>,
        display_name: impl Into<String>,
        captured_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            local_path: local_path.into(),
            display_name: display_name.into(),
            captured_at,
            status: ImageStatus::Pending,
        }
    }

    /// Whether the backing file currently exists
    pub async fn file_exists(&self) -> bool {
        tokio::fs::metadata(&self.local_path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false)
    }
}
