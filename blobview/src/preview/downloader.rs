// ABOUTME: Retrying, cancellable blob downloader over the ObjectStore trait
// ABOUTME: Streams to temp files with progress snapshots and exponential backoff

use chrono::Utc;
use futures_util::StreamExt;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::Notify;

use crate::constants::{RETRY_BASE_DELAY, RETRY_MAX_DELAY};
use crate::error::PreviewError;
use crate::preview::types::{DownloadState, DownloadStatus};
use crate::store::ObjectStore;

/// Per-chunk observer for [`ObjectDownloader::fetch_with_progress`]:
/// called with the bytes written so far and the expected total (zero when
/// the store did not report a length).
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

struct DownloadHandle {
    cancelled: AtomicBool,
    cancel_notify: Notify,
    state: Mutex<DownloadState>,
}

impl DownloadHandle {
    fn new(key: &str) -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            cancel_notify: Notify::new(),
            state: Mutex::new(DownloadState::new(key)),
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
        self.cancel_notify.notify_one();
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    fn update<F: FnOnce(&mut DownloadState)>(&self, f: F) {
        let mut state = self.state.lock().unwrap();
        f(&mut state);
    }
}

/// Fetches blobs from an [`ObjectStore`] into temp files, retrying
/// transient failures with exponential backoff. Each key gets at most one
/// tracked download at a time; state snapshots are available to observers
/// while a fetch is in flight.
pub struct ObjectDownloader {
    store: Arc<dyn ObjectStore>,
    max_retries: u32,
    active: Mutex<HashMap<String, Arc<DownloadHandle>>>,
    temp_seq: AtomicU64,
}

impl ObjectDownloader {
    pub fn new(store: Arc<dyn ObjectStore>, max_retries: u32) -> Self {
        Self {
            store,
            max_retries,
            active: Mutex::new(HashMap::new()),
            temp_seq: AtomicU64::new(0),
        }
    }

    /// Downloads `key` to a fresh temp file, retrying transient failures up
    /// to the configured budget. The returned path is owned by the caller;
    /// on failure or cancellation any partial temp file is removed.
    pub async fn fetch(&self, key: &str) -> Result<PathBuf, PreviewError> {
        self.fetch_inner(key, None).await
    }

    /// Like [`fetch`](Self::fetch), invoking `callback` after every chunk
    /// written, unthrottled.
    pub async fn fetch_with_progress(
        &self,
        key: &str,
        callback: ProgressCallback,
    ) -> Result<PathBuf, PreviewError> {
        self.fetch_inner(key, Some(callback)).await
    }

    async fn fetch_inner(
        &self,
        key: &str,
        callback: Option<ProgressCallback>,
    ) -> Result<PathBuf, PreviewError> {
        let handle = Arc::new(DownloadHandle::new(key));
        self.active
            .lock()
            .unwrap()
            .insert(key.to_string(), Arc::clone(&handle));

        let result = self.fetch_with_retry(key, &handle, callback.as_ref()).await;
        self.active.lock().unwrap().remove(key);

        result
    }

    async fn fetch_with_retry(
        &self,
        key: &str,
        handle: &DownloadHandle,
        callback: Option<&ProgressCallback>,
    ) -> Result<PathBuf, PreviewError> {
        let attempts = self.max_retries + 1;
        let mut last_error: Option<PreviewError> = None;

        for attempt in 1..=attempts {
            if attempt > 1 && !handle.is_cancelled() {
                let delay = retry_delay(attempt - 1);
                log::debug!("retrying download of {key} in {delay:?} (attempt {attempt}/{attempts})");
                // Cancellation must cut the backoff wait short, not just
                // the chunk loop.
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = handle.cancel_notify.notified() => {}
                }
            }

            if handle.is_cancelled() {
                handle.update(|s| {
                    s.status = DownloadStatus::Cancelled;
                    s.completed_time = Some(Utc::now());
                });
                return Err(PreviewError::Cancelled(key.to_string()));
            }

            match self.attempt_download(key, handle, callback).await {
                Ok(path) => {
                    handle.update(|s| {
                        s.status = DownloadStatus::Completed;
                        s.completed_time = Some(Utc::now());
                        s.temp_path = Some(path.clone());
                    });
                    return Ok(path);
                }
                Err(e @ PreviewError::Cancelled(_)) => {
                    handle.update(|s| {
                        s.status = DownloadStatus::Cancelled;
                        s.completed_time = Some(Utc::now());
                    });
                    return Err(e);
                }
                Err(e) if e.is_retryable() => {
                    log::warn!("download attempt {attempt} for {key} failed: {e}");
                    last_error = Some(e);
                }
                Err(e) => {
                    handle.update(|s| {
                        s.status = DownloadStatus::Failed;
                        s.error = Some(e.to_string());
                        s.completed_time = Some(Utc::now());
                    });
                    return Err(e);
                }
            }
        }

        let last = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown error".to_string());
        let wrapped = PreviewError::network(
            "fetch",
            None,
            format!("download failed after {attempts} attempts: {last}"),
        );
        handle.update(|s| {
            s.status = DownloadStatus::Failed;
            s.error = Some(wrapped.to_string());
            s.completed_time = Some(Utc::now());
        });
        Err(wrapped)
    }

    async fn attempt_download(
        &self,
        key: &str,
        handle: &DownloadHandle,
        callback: Option<&ProgressCallback>,
    ) -> Result<PathBuf, PreviewError> {
        handle.update(|s| s.status = DownloadStatus::Started);

        let mut body = self.store.get_object(key).await?;
        let total = body.content_length.unwrap_or(0);

        let temp_path = self.temp_path_for(key);
        let mut file = tokio::fs::File::create(&temp_path)
            .await
            .map_err(|e| PreviewError::cache("create_temp", &temp_path, e))?;

        handle.update(|s| {
            s.status = DownloadStatus::Downloading;
            s.progress.total = total;
            s.temp_path = Some(temp_path.clone());
        });

        let start = Utc::now();
        let mut downloaded = 0u64;

        while let Some(chunk) = body.stream.next().await {
            if handle.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(PreviewError::Cancelled(key.to_string()));
            }

            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(e) => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return Err(e);
                }
            };

            if let Err(e) = file.write_all(&chunk).await {
                drop(file);
                let _ = tokio::fs::remove_file(&temp_path).await;
                return Err(PreviewError::cache("write_temp", &temp_path, e));
            }

            downloaded += chunk.len() as u64;
            let now = Utc::now();
            let elapsed_ms = (now - start).num_milliseconds().max(1) as u64;
            let speed = downloaded * 1000 / elapsed_ms;

            handle.update(|s| {
                s.progress.downloaded = downloaded;
                s.progress.percentage = if total > 0 {
                    downloaded as f64 / total as f64 * 100.0
                } else {
                    0.0
                };
                s.progress.speed = speed;
                s.progress.eta = if speed > 0 && total > downloaded {
                    Duration::from_secs((total - downloaded) / speed)
                } else {
                    Duration::ZERO
                };
                s.progress.current_time = now;
            });

            if let Some(cb) = callback {
                cb(downloaded, total);
            }
        }

        if let Err(e) = file.flush().await {
            drop(file);
            let _ = tokio::fs::remove_file(&temp_path).await;
            return Err(PreviewError::cache("write_temp", &temp_path, e));
        }

        Ok(temp_path)
    }

    /// Unique temp path keeping the key's extension so downstream format
    /// detection still works.
    fn temp_path_for(&self, key: &str) -> PathBuf {
        let seq = self.temp_seq.fetch_add(1, Ordering::Relaxed);
        let name = Path::new(key)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("blob");
        std::env::temp_dir().join(format!("blobview-{}-{seq}-{name}", std::process::id()))
    }

    /// Size probe without a body transfer, for cache preallocation when
    /// the caller has no metadata.
    pub async fn estimate_size(&self, key: &str) -> Result<u64, PreviewError> {
        self.store.head_object(key).await
    }

    /// Flags the in-flight download for `key` as cancelled. The fetch
    /// notices at the next chunk boundary, or immediately when it is
    /// waiting out a retry backoff.
    pub fn cancel(&self, key: &str) {
        if let Some(handle) = self.active.lock().unwrap().get(key) {
            handle.cancel();
        }
    }

    pub fn cancel_all(&self) {
        for handle in self.active.lock().unwrap().values() {
            handle.cancel();
        }
    }

    /// Snapshot of the download state for `key`, if one is tracked.
    pub fn state(&self, key: &str) -> Option<DownloadState> {
        self.active
            .lock()
            .unwrap()
            .get(key)
            .map(|h| h.state.lock().unwrap().clone())
    }

    pub fn active_downloads(&self) -> Vec<DownloadState> {
        self.active
            .lock()
            .unwrap()
            .values()
            .map(|h| h.state.lock().unwrap().clone())
            .collect()
    }
}

/// Exponential backoff: 1s, 2s, 4s, ... capped at the maximum delay.
fn retry_delay(completed_attempts: u32) -> Duration {
    let exp = completed_attempts.saturating_sub(1).min(16);
    let delay = RETRY_BASE_DELAY * 2u32.pow(exp);
    delay.min(RETRY_MAX_DELAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{HttpObjectStore, ObjectBody};
    use async_trait::async_trait;
    use bytes::Bytes;
    use mockito::Server;

    fn http_downloader(server: &Server, max_retries: u32) -> ObjectDownloader {
        let store = HttpObjectStore::new(&server.url(), Duration::from_secs(5)).unwrap();
        ObjectDownloader::new(Arc::new(store), max_retries)
    }

    #[test]
    fn test_retry_delay_caps_at_max() {
        assert_eq!(retry_delay(1), Duration::from_secs(1));
        assert_eq!(retry_delay(2), Duration::from_secs(2));
        assert_eq!(retry_delay(3), Duration::from_secs(4));
        assert_eq!(retry_delay(6), Duration::from_secs(30));
        assert_eq!(retry_delay(10), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_fetch_writes_temp_file() {
        let mut server = Server::new_async().await;
        let body = b"\x89PNG\r\n\x1a\nimage bytes".to_vec();
        let mock = server
            .mock("GET", "/photos/cat.png")
            .with_status(200)
            .with_body(&body)
            .create_async()
            .await;

        let downloader = http_downloader(&server, 0);
        let path = downloader.fetch("photos/cat.png").await.unwrap();

        mock.assert_async().await;
        assert_eq!(std::fs::read(&path).unwrap(), body);
        assert!(path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap()
            .ends_with("cat.png"));
        // Finished downloads are no longer tracked.
        assert!(downloader.state("photos/cat.png").is_none());
        std::fs::remove_file(&path).unwrap();
    }

    #[tokio::test]
    async fn test_non_retryable_error_makes_one_request() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/missing.png")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let downloader = http_downloader(&server, 3);
        let err = downloader.fetch("missing.png").await.unwrap_err();

        mock.assert_async().await;
        match err {
            PreviewError::Network { code, .. } => assert_eq!(code, Some(404)),
            other => panic!("expected network error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transient_failures_retried_to_budget() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/flaky.png")
            .with_status(503)
            .expect(3)
            .create_async()
            .await;

        let downloader = http_downloader(&server, 2);
        let err = downloader.fetch("flaky.png").await.unwrap_err();

        mock.assert_async().await;
        let rendered = err.to_string();
        assert!(rendered.contains("after 3 attempts"), "got: {rendered}");
        assert!(rendered.contains("503"), "got: {rendered}");
    }

    struct SlowStore;

    #[async_trait]
    impl ObjectStore for SlowStore {
        async fn get_object(&self, _key: &str) -> Result<ObjectBody, PreviewError> {
            // One small chunk every poll, forever; only cancellation ends it.
            let stream = futures_util::stream::unfold(0u32, |n| async move {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Some((Ok(Bytes::from_static(b"chunk")), n + 1))
            })
            .boxed();
            Ok(ObjectBody {
                content_length: None,
                stream,
            })
        }

        async fn head_object(&self, _key: &str) -> Result<u64, PreviewError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_cancel_stops_download_and_removes_temp() {
        let downloader = Arc::new(ObjectDownloader::new(Arc::new(SlowStore), 0));

        let fetcher = Arc::clone(&downloader);
        let task = tokio::spawn(async move { fetcher.fetch("endless.png").await });

        // Give the stream time to deliver a few chunks, then cancel.
        tokio::time::sleep(Duration::from_millis(30)).await;
        let temp = downloader
            .state("endless.png")
            .and_then(|s| s.temp_path)
            .unwrap();
        downloader.cancel("endless.png");

        let err = task.await.unwrap().unwrap_err();
        assert!(matches!(err, PreviewError::Cancelled(_)));
        assert!(!temp.exists());
    }

    /// Three fixed chunks with a known total, for progress observation.
    struct ChunkedStore;

    #[async_trait]
    impl ObjectStore for ChunkedStore {
        async fn get_object(&self, _key: &str) -> Result<ObjectBody, PreviewError> {
            let chunks: Vec<Result<Bytes, PreviewError>> = vec![
                Ok(Bytes::from_static(b"11111")),
                Ok(Bytes::from_static(b"22222")),
                Ok(Bytes::from_static(b"33333")),
            ];
            Ok(ObjectBody {
                content_length: Some(15),
                stream: futures_util::stream::iter(chunks).boxed(),
            })
        }

        async fn head_object(&self, _key: &str) -> Result<u64, PreviewError> {
            Ok(15)
        }
    }

    #[tokio::test]
    async fn test_progress_callback_fires_per_chunk() {
        let downloader = ObjectDownloader::new(Arc::new(ChunkedStore), 0);
        let calls: Arc<Mutex<Vec<(u64, u64)>>> = Arc::new(Mutex::new(Vec::new()));

        let sink = Arc::clone(&calls);
        let path = downloader
            .fetch_with_progress(
                "chunked.png",
                Box::new(move |downloaded, total| {
                    sink.lock().unwrap().push((downloaded, total));
                }),
            )
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec![(5, 15), (10, 15), (15, 15)]);
        assert_eq!(std::fs::read(&path).unwrap(), b"111112222233333");
        std::fs::remove_file(&path).unwrap();
    }

    /// Every request fails with a retryable status.
    struct FlakyStore {
        gets: AtomicU64,
    }

    #[async_trait]
    impl ObjectStore for FlakyStore {
        async fn get_object(&self, _key: &str) -> Result<ObjectBody, PreviewError> {
            self.gets.fetch_add(1, Ordering::Relaxed);
            Err(PreviewError::network(
                "get_object",
                Some(503),
                "service unavailable",
            ))
        }

        async fn head_object(&self, _key: &str) -> Result<u64, PreviewError> {
            Ok(0)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff_wait() {
        let store = Arc::new(FlakyStore {
            gets: AtomicU64::new(0),
        });
        let downloader = Arc::new(ObjectDownloader::new(
            Arc::clone(&store) as Arc<dyn ObjectStore>,
            5,
        ));

        let fetcher = Arc::clone(&downloader);
        let task = tokio::spawn(async move { fetcher.fetch("stuck.png").await });

        // Let the first attempt fail and the one-second backoff begin.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(store.gets.load(Ordering::Relaxed), 1);

        let waited = tokio::time::Instant::now();
        downloader.cancel("stuck.png");
        let err = task.await.unwrap().unwrap_err();

        assert!(matches!(err, PreviewError::Cancelled(_)));
        // The fetch gives up mid-backoff instead of sleeping out the
        // delay, and never issues another request.
        assert!(waited.elapsed() < Duration::from_millis(500));
        assert_eq!(store.gets.load(Ordering::Relaxed), 1);
    }

    /// One good chunk, then the connection drops.
    struct BrokenStore;

    #[async_trait]
    impl ObjectStore for BrokenStore {
        async fn get_object(&self, _key: &str) -> Result<ObjectBody, PreviewError> {
            let stream = futures_util::stream::iter(vec![Ok(Bytes::from_static(b"data"))])
                .chain(futures_util::stream::once(async {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Err(PreviewError::network(
                        "get_object",
                        None,
                        "connection reset by peer",
                    ))
                }))
                .boxed();
            Ok(ObjectBody {
                content_length: None,
                stream,
            })
        }

        async fn head_object(&self, _key: &str) -> Result<u64, PreviewError> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn test_failed_stream_removes_temp_file() {
        let downloader = Arc::new(ObjectDownloader::new(Arc::new(BrokenStore), 0));

        let fetcher = Arc::clone(&downloader);
        let task = tokio::spawn(async move { fetcher.fetch("broken.png").await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let temp = downloader
            .state("broken.png")
            .and_then(|s| s.temp_path)
            .unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("after 1 attempts"));
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn test_state_snapshot_while_downloading() {
        let downloader = Arc::new(ObjectDownloader::new(Arc::new(SlowStore), 0));

        let fetcher = Arc::clone(&downloader);
        let task = tokio::spawn(async move { fetcher.fetch("watched.png").await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        let state = downloader.state("watched.png").unwrap();
        assert_eq!(state.status, DownloadStatus::Downloading);
        assert!(state.progress.downloaded > 0);
        assert!(state.is_active());
        assert_eq!(downloader.active_downloads().len(), 1);

        downloader.cancel_all();
        let _ = task.await.unwrap();
        assert!(downloader.active_downloads().is_empty());
    }
}
