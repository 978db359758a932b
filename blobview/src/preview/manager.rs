// ABOUTME: Preview orchestrator tying cache, downloader, and renderer together
// ABOUTME: Content-type gating, hit/miss accounting, and current-preview tracking

use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crate::config::PreviewConfig;
use crate::constants::{FALLBACK_IMAGE_HEIGHT, FALLBACK_IMAGE_WIDTH};
use crate::error::PreviewError;
use crate::preview::cache::DiskCache;
use crate::preview::detection::TerminalCapabilities;
use crate::preview::downloader::ObjectDownloader;
use crate::preview::renderer::TerminalRenderer;
use crate::preview::types::{
    CacheMetrics, CacheStats, DownloadState, ImagePreview, ImageFormat, ImageSize, ManagerStats,
};
use crate::store::{FileItem, ObjectStore};

/// Decides up front whether an object is worth fetching: image content
/// type (SVG excluded, nothing can rasterize it here) or a recognized
/// image extension. Anything else is rejected before any I/O.
pub fn is_image_file(item: &FileItem) -> bool {
    let content_type = item.content_type.to_lowercase();
    if !content_type.is_empty() && content_type != "application/octet-stream" {
        return content_type.starts_with("image/") && !content_type.contains("svg");
    }

    Path::new(&item.key)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(ImageFormat::from_extension)
        .is_some()
}

/// MIME types the preview gate accepts.
pub fn supported_formats() -> Vec<&'static str> {
    ImageFormat::ALL.iter().map(|f| f.mime_type()).collect()
}

/// Pixel dimensions read from the image header, with a conventional
/// fallback when the header cannot be parsed.
pub fn probe_dimensions(path: &Path) -> ImageSize {
    match image::image_dimensions(path) {
        Ok((w, h)) => ImageSize::new(w, h),
        Err(_) => ImageSize::new(FALLBACK_IMAGE_WIDTH, FALLBACK_IMAGE_HEIGHT),
    }
}

/// Where a cell-budgeted preview goes on screen.
#[derive(Debug, Clone, Copy)]
struct CellPlacement {
    cols: u16,
    rows: u16,
    start_col: u16,
    start_row: u16,
}

/// Front door of the preview pipeline: fetches through the cache, renders
/// for the detected terminal, and tracks the preview currently on screen.
pub struct PreviewManager {
    cache: Arc<DiskCache>,
    downloader: ObjectDownloader,
    renderer: Mutex<TerminalRenderer>,
    current: Mutex<Option<ImagePreview>>,
    total_previews: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
}

impl PreviewManager {
    pub fn new(store: Arc<dyn ObjectStore>, config: &PreviewConfig) -> Result<Self, PreviewError> {
        Self::with_capabilities(store, config, TerminalCapabilities::detect())
    }

    /// Constructor with explicit capabilities, for callers that already
    /// detected the terminal (or tests that must not read the environment).
    pub fn with_capabilities(
        store: Arc<dyn ObjectStore>,
        config: &PreviewConfig,
        capabilities: TerminalCapabilities,
    ) -> Result<Self, PreviewError> {
        let cache = Arc::new(DiskCache::new(
            &config.cache_dir,
            config.max_cache_size,
            config.eviction_policy,
            config.age_threshold,
        )?);

        Ok(Self {
            cache,
            downloader: ObjectDownloader::new(store, config.max_retries),
            renderer: Mutex::new(TerminalRenderer::new(capabilities, config.text_mode)),
            current: Mutex::new(None),
            total_previews: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
        })
    }

    /// Preview `item`, serving from cache when possible.
    pub async fn preview(&self, item: &FileItem) -> Result<ImagePreview, PreviewError> {
        self.preview_inner(item, None, false).await
    }

    /// Preview `item`, discarding any cached copy first.
    pub async fn preview_forced(&self, item: &FileItem) -> Result<ImagePreview, PreviewError> {
        self.preview_inner(item, None, true).await
    }

    /// Preview sized to fit an explicit cell rectangle, placed at an
    /// absolute terminal position (1-based column and row).
    pub async fn preview_at(
        &self,
        item: &FileItem,
        cols: u16,
        rows: u16,
        start_col: u16,
        start_row: u16,
    ) -> Result<ImagePreview, PreviewError> {
        let placement = CellPlacement {
            cols,
            rows,
            start_col,
            start_row,
        };
        self.preview_inner(item, Some(placement), false).await
    }

    pub async fn preview_at_forced(
        &self,
        item: &FileItem,
        cols: u16,
        rows: u16,
        start_col: u16,
        start_row: u16,
    ) -> Result<ImagePreview, PreviewError> {
        let placement = CellPlacement {
            cols,
            rows,
            start_col,
            start_row,
        };
        self.preview_inner(item, Some(placement), true).await
    }

    async fn preview_inner(
        &self,
        item: &FileItem,
        cells: Option<CellPlacement>,
        force: bool,
    ) -> Result<ImagePreview, PreviewError> {
        if !is_image_file(item) {
            return Err(PreviewError::Format {
                format: item.content_type.clone(),
                path: item.key.clone(),
                reason: "not a previewable image".to_string(),
            });
        }

        let started = Instant::now();
        let (path, cache_hit) = self.materialize(item, force).await?;

        let rendered = {
            let renderer = self.renderer.lock().unwrap();
            match cells {
                Some(p) => renderer.render_at_cells(
                    &path,
                    &item.key,
                    p.cols,
                    p.rows,
                    p.start_col,
                    p.start_row,
                )?,
                None => renderer.render_file(&path, &item.key)?,
            }
        };

        let preview = ImagePreview {
            file_key: item.key.clone(),
            file_path: path,
            original_size: rendered.original_size,
            display_size: rendered.display_size,
            format: rendered.format,
            rendered_data: rendered.data,
            render_cols: rendered.cols,
            render_rows: rendered.rows,
            cache_hit,
            load_time: started.elapsed(),
            create_time: Utc::now(),
        };

        self.total_previews.fetch_add(1, Ordering::Relaxed);
        *self.current.lock().unwrap() = Some(preview.clone());
        Ok(preview)
    }

    /// Produces a local file for the item: cache hit, or download then
    /// cache. A failed cache insert degrades to serving the temp file
    /// directly rather than failing the preview.
    async fn materialize(
        &self,
        item: &FileItem,
        force: bool,
    ) -> Result<(std::path::PathBuf, bool), PreviewError> {
        if force {
            self.cache.delete(&item.key)?;
        } else if let Some(path) = self.cache.get(&item.key)? {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            log::debug!("cache hit for {}", item.key);
            return Ok((path, true));
        }

        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        // Make room before the bytes arrive, best effort.
        let expected = if item.size > 0 {
            item.size
        } else {
            self.downloader.estimate_size(&item.key).await.unwrap_or(0)
        };
        if expected > 0 {
            if let Err(e) = self.cache.preallocate_space(expected) {
                log::warn!("could not preallocate {expected} bytes: {e}");
            }
        }

        let temp = self.downloader.fetch(&item.key).await?;
        let path = match self.cache.put(&item.key, &temp) {
            Ok(cached) => {
                let _ = std::fs::remove_file(&temp);
                cached
            }
            Err(e) => {
                log::warn!("caching {} failed, serving temp file: {e}", item.key);
                temp
            }
        };

        Ok((path, false))
    }

    /// Emits the protocol's clear sequence (when one exists) and forgets
    /// the current preview.
    pub fn clear_preview(&self) -> Option<String> {
        *self.current.lock().unwrap() = None;
        self.renderer.lock().unwrap().clear_sequence()
    }

    pub fn current_preview(&self) -> Option<ImagePreview> {
        self.current.lock().unwrap().clone()
    }

    pub fn cancel_download(&self, key: &str) {
        self.downloader.cancel(key);
    }

    pub fn download_state(&self, key: &str) -> Option<DownloadState> {
        self.downloader.state(key)
    }

    pub fn active_downloads(&self) -> Vec<DownloadState> {
        self.downloader.active_downloads()
    }

    pub fn set_display_size(&self, width: u32, height: u32) {
        self.renderer.lock().unwrap().set_display_size(width, height);
    }

    pub fn set_cell_size(&self, width: u32, height: u32) {
        self.renderer.lock().unwrap().set_cell_size(width, height);
    }

    pub fn set_text_mode(&self, text_mode: bool) {
        self.renderer.lock().unwrap().set_text_mode(text_mode);
    }

    pub fn set_max_cache_size(&self, max_size: u64) {
        self.cache.set_max_size(max_size);
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub fn cache_metrics(&self) -> CacheMetrics {
        self.cache.metrics()
    }

    pub fn verify_cached(&self, key: &str) -> Result<bool, PreviewError> {
        self.cache.verify_checksum(key)
    }

    pub fn cleanup_cache(&self) -> Result<(), PreviewError> {
        self.cache.cleanup()
    }

    pub fn compact_cache(&self) -> Result<(), PreviewError> {
        self.cache.compact()
    }

    pub fn get_stats(&self) -> ManagerStats {
        let hits = self.cache_hits.load(Ordering::Relaxed);
        let misses = self.cache_misses.load(Ordering::Relaxed);
        let looked_up = hits + misses;
        let renderer = self.renderer.lock().unwrap();

        ManagerStats {
            total_previews: self.total_previews.load(Ordering::Relaxed),
            cache_hits: hits,
            cache_misses: misses,
            cache_hit_rate: if looked_up > 0 {
                hits as f64 / looked_up as f64
            } else {
                0.0
            },
            cache_stats: self.cache.stats(),
            terminal: renderer.capabilities().terminal_name.clone(),
            supports_graphics: renderer.supports_graphics(),
        }
    }

    /// Cancels in-flight downloads and stops background cache work. The
    /// manager remains usable afterwards; previews simply lose their
    /// background maintenance.
    pub fn close(&self) {
        self.downloader.cancel_all();
        self.cache.stop_maintenance();
    }
}
