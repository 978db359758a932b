// ABOUTME: Narrow remote-object-read capability consumed by the downloader
// ABOUTME: HTTP-backed implementation plus the metadata shape the browser supplies

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;
use url::Url;

use crate::error::PreviewError;

/// Stream of body chunks from the remote store.
pub type ByteStream = BoxStream<'static, Result<Bytes, PreviewError>>;

/// A remote object opened for streaming.
pub struct ObjectBody {
    /// Expected byte count, when the store reports one.
    pub content_length: Option<u64>,
    pub stream: ByteStream,
}

impl std::fmt::Debug for ObjectBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectBody")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// The only two operations the preview pipeline needs from a remote
/// object store. Satisfied by the real client or a test double.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Open a streaming read of the blob named `key`.
    async fn get_object(&self, key: &str) -> Result<ObjectBody, PreviewError>;

    /// Metadata probe returning the blob's byte count without a body
    /// transfer.
    async fn head_object(&self, key: &str) -> Result<u64, PreviewError>;
}

/// Metadata about a browsed object, supplied by the UI layer. Only the
/// content type is consulted before any I/O happens.
#[derive(Debug, Clone)]
pub struct FileItem {
    pub key: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
    pub content_type: String,
    pub category: String,
}

impl FileItem {
    pub fn new(key: impl Into<String>, content_type: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            size: 0,
            last_modified: Utc::now(),
            content_type: content_type.into(),
            category: String::new(),
        }
    }
}

/// [`ObjectStore`] over plain HTTP: keys are resolved against a base URL.
pub struct HttpObjectStore {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, PreviewError> {
        let base_url = Url::parse(base_url)
            .map_err(|e| PreviewError::network("configure", None, format!("invalid base URL '{base_url}': {e}")))?;

        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("blobview/", env!("CARGO_PKG_VERSION")))
            .redirect(reqwest::redirect::Policy::limited(3))
            .build()
            .map_err(|e| {
                PreviewError::network("configure", None, format!("failed to create HTTP client: {e}"))
            })?;

        Ok(Self { base_url, client })
    }

    fn object_url(&self, key: &str) -> Result<Url, PreviewError> {
        // Keys are path-like; a leading slash would discard the base path.
        self.base_url
            .join(key.trim_start_matches('/'))
            .map_err(|e| PreviewError::network("get_object", None, format!("invalid key '{key}': {e}")))
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get_object(&self, key: &str) -> Result<ObjectBody, PreviewError> {
        let url = self.object_url(key)?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| PreviewError::network("get_object", None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PreviewError::network(
                "get_object",
                Some(status.as_u16()),
                format!("request for {url} failed with status {status}"),
            ));
        }

        let content_length = response.content_length();
        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|e| PreviewError::network("get_object", None, e.to_string())))
            .boxed();

        Ok(ObjectBody {
            content_length,
            stream,
        })
    }

    async fn head_object(&self, key: &str) -> Result<u64, PreviewError> {
        let url = self.object_url(key)?;

        let response = self
            .client
            .head(url.clone())
            .send()
            .await
            .map_err(|e| PreviewError::network("head_object", None, e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PreviewError::network(
                "head_object",
                Some(status.as_u16()),
                format!("request for {url} failed with status {status}"),
            ));
        }

        Ok(response.content_length().unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;
    use mockito::Server;

    #[tokio::test]
    async fn test_get_object_streams_body() {
        let mut server = Server::new_async().await;
        let body = vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A];

        let mock = server
            .mock("GET", "/photos/cat.png")
            .with_status(200)
            .with_header("content-type", "image/png")
            .with_body(&body)
            .create_async()
            .await;

        let store = HttpObjectStore::new(&server.url(), Duration::from_secs(5)).unwrap();
        let mut object = store.get_object("photos/cat.png").await.unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = object.stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }

        mock.assert_async().await;
        assert_eq!(collected, body);
        assert_eq!(object.content_length, Some(body.len() as u64));
    }

    #[tokio::test]
    async fn test_get_object_surfaces_status_code() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/missing.png")
            .with_status(404)
            .create_async()
            .await;

        let store = HttpObjectStore::new(&server.url(), Duration::from_secs(5)).unwrap();
        let err = store.get_object("missing.png").await.unwrap_err();

        mock.assert_async().await;
        match err {
            PreviewError::Network { code, .. } => assert_eq!(code, Some(404)),
            other => panic!("expected network error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_head_object_reports_length() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("HEAD", "/photos/big.jpg")
            .with_status(200)
            .with_header("content-length", "123456")
            .create_async()
            .await;

        let store = HttpObjectStore::new(&server.url(), Duration::from_secs(5)).unwrap();
        let size = store.head_object("photos/big.jpg").await.unwrap();

        mock.assert_async().await;
        assert_eq!(size, 123456);
    }

    #[test]
    fn test_leading_slash_keys_resolve_against_base() {
        let store = HttpObjectStore::new("http://127.0.0.1:9/", Duration::from_secs(1)).unwrap();
        let url = store.object_url("/photos/cat.png").unwrap();
        assert_eq!(url.path(), "/photos/cat.png");
    }
}
