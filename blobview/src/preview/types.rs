// ABOUTME: Core data model for the preview pipeline
// ABOUTME: Image formats and sizes, preview results, download state, and statistics

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::preview::cache::CacheEntry;

/// Image formats the pipeline can decode and render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    WebP,
    Bmp,
    Tiff,
}

impl ImageFormat {
    /// Every format the pipeline can decode.
    pub const ALL: [Self; 6] = [
        Self::Jpeg,
        Self::Png,
        Self::Gif,
        Self::WebP,
        Self::Bmp,
        Self::Tiff,
    ];

    /// Infer a format from a file extension (without the leading dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            "gif" => Some(Self::Gif),
            "webp" => Some(Self::WebP),
            "bmp" => Some(Self::Bmp),
            "tif" | "tiff" => Some(Self::Tiff),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
            Self::Gif => "image/gif",
            Self::WebP => "image/webp",
            Self::Bmp => "image/bmp",
            Self::Tiff => "image/tiff",
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Jpeg => "jpeg",
            Self::Png => "png",
            Self::Gif => "gif",
            Self::WebP => "webp",
            Self::Bmp => "bmp",
            Self::Tiff => "tiff",
        }
    }
}

/// Pixel dimensions of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

impl ImageSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl std::fmt::Display for ImageSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// A rendered preview, owned by the caller and never mutated after return.
#[derive(Debug, Clone)]
pub struct ImagePreview {
    pub file_key: String,
    pub file_path: PathBuf,
    pub original_size: ImageSize,
    pub display_size: ImageSize,
    pub format: ImageFormat,
    /// Escape sequences (or half-block text) ready to emit to the terminal.
    pub rendered_data: String,
    /// Terminal cell footprint the payload occupies.
    pub render_cols: u16,
    pub render_rows: u16,
    pub cache_hit: bool,
    pub load_time: Duration,
    pub create_time: DateTime<Utc>,
}

/// Point-in-time telemetry for an in-flight fetch.
#[derive(Debug, Clone)]
pub struct DownloadProgress {
    pub file_key: String,
    pub downloaded: u64,
    /// Expected total bytes; zero when the store did not report a length.
    pub total: u64,
    pub percentage: f64,
    /// Instantaneous speed in bytes per second; zero before the first chunk.
    pub speed: u64,
    pub eta: Duration,
    pub start_time: DateTime<Utc>,
    pub current_time: DateTime<Utc>,
}

impl DownloadProgress {
    pub fn new(file_key: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            file_key: file_key.into(),
            downloaded: 0,
            total: 0,
            percentage: 0.0,
            speed: 0,
            eta: Duration::ZERO,
            start_time: now,
            current_time: now,
        }
    }
}

/// Lifecycle of a single fetch. Terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Started,
    Downloading,
    Completed,
    Failed,
    Cancelled,
}

/// One in-flight or just-finished fetch. Discarded once consumed; the
/// downloader keeps no history.
#[derive(Debug, Clone)]
pub struct DownloadState {
    pub file_key: String,
    pub status: DownloadStatus,
    pub progress: DownloadProgress,
    pub error: Option<String>,
    pub start_time: DateTime<Utc>,
    pub completed_time: Option<DateTime<Utc>>,
    pub temp_path: Option<PathBuf>,
}

impl DownloadState {
    pub fn new(file_key: impl Into<String>) -> Self {
        let file_key = file_key.into();
        Self {
            progress: DownloadProgress::new(file_key.clone()),
            file_key,
            status: DownloadStatus::Pending,
            error: None,
            start_time: Utc::now(),
            completed_time: None,
            temp_path: None,
        }
    }

    pub fn is_active(&self) -> bool {
        matches!(
            self.status,
            DownloadStatus::Pending | DownloadStatus::Started | DownloadStatus::Downloading
        )
    }

    pub fn is_completed(&self) -> bool {
        self.status == DownloadStatus::Completed
    }

    pub fn is_failed(&self) -> bool {
        matches!(
            self.status,
            DownloadStatus::Failed | DownloadStatus::Cancelled
        )
    }

    /// Wall-clock duration of the fetch so far (or until completion).
    pub fn duration(&self) -> Duration {
        let end = self.completed_time.unwrap_or_else(Utc::now);
        (end - self.start_time).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Aggregate cache statistics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_files: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub usage_percent: f64,
    pub oldest_entry: Option<CacheEntry>,
    pub newest_entry: Option<CacheEntry>,
}

/// Extended cache metrics for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct CacheMetrics {
    pub total_files: usize,
    pub total_size: u64,
    pub max_size: u64,
    pub usage_percent: f64,
    pub average_file_size: f64,
    pub oldest_entry: Option<CacheEntry>,
    pub newest_entry: Option<CacheEntry>,
    pub last_cleanup: DateTime<Utc>,
}

/// Orchestrator counters plus a snapshot of the underlying cache.
#[derive(Debug, Clone, Serialize)]
pub struct ManagerStats {
    pub total_previews: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub cache_stats: CacheStats,
    pub terminal: String,
    pub supports_graphics: bool,
}
