// ABOUTME: Shared constants for the preview pipeline
// ABOUTME: Render dimension limits, terminal cell geometry, and cache defaults

use std::time::Duration;

/// Default render bounds in pixels when the caller passes none.
pub const DEFAULT_MAX_WIDTH: u32 = 120 * CELL_PIXEL_WIDTH;
pub const DEFAULT_MAX_HEIGHT: u32 = 48 * CELL_PIXEL_HEIGHT;

/// Hard ceiling on render dimensions regardless of configuration.
pub const MAX_IMAGE_WIDTH: u32 = 8192;
pub const MAX_IMAGE_HEIGHT: u32 = 4320;

/// Approximate terminal cell size in pixels, used for cell-footprint math.
pub const CELL_PIXEL_WIDTH: u32 = 8;
pub const CELL_PIXEL_HEIGHT: u32 = 16;

/// Terminal characters are roughly twice as tall as they are wide.
pub const CHAR_ASPECT_RATIO: f64 = 2.0;

/// Kitty protocol payload chunk size (must be a multiple of 4 for base64).
pub const KITTY_CHUNK_SIZE: usize = 4096;

/// Default half-block grid when no cell size has been configured.
pub const DEFAULT_TEXT_COLS: u16 = 40;
pub const DEFAULT_TEXT_ROWS: u16 = 12;

/// Sidecar index file written into the cache directory.
pub const INDEX_FILE_NAME: &str = ".cache_index.json";

/// Cadence of the background cleanup and orphan sweep.
pub const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Backoff bounds for retried fetches.
pub const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
pub const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

/// Fallback pixel dimensions when an image header cannot be decoded.
pub const FALLBACK_IMAGE_WIDTH: u32 = 800;
pub const FALLBACK_IMAGE_HEIGHT: u32 = 600;
