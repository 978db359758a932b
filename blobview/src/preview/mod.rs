// ABOUTME: Terminal image preview pipeline for remote blobs
// ABOUTME: Cache, downloader, terminal detection, renderer, and orchestrator

pub mod cache;
pub mod detection;
pub mod downloader;
pub mod manager;
pub mod renderer;
pub mod types;

pub use cache::{CacheEntry, DiskCache, EvictionPolicy};
pub use detection::{GraphicsProtocol, TerminalCapabilities};
pub use downloader::{ObjectDownloader, ProgressCallback};
pub use manager::{is_image_file, supported_formats, PreviewManager};
pub use renderer::{Rendered, TerminalRenderer};
pub use types::{DownloadState, DownloadStatus, ImageFormat, ImagePreview, ImageSize};
