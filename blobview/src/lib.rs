// ABOUTME: Library exports for the blobview preview pipeline
// ABOUTME: Makes internal modules available to the CLI and integration tests

pub mod config;
pub mod constants;
pub mod error;
pub mod preview;
pub mod store;

pub use config::PreviewConfig;
pub use error::PreviewError;
pub use preview::PreviewManager;
pub use store::{FileItem, HttpObjectStore, ObjectStore};
