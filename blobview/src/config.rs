// ABOUTME: Construction-time configuration for the preview pipeline
// ABOUTME: Defaults plus environment-variable overrides for cache and fetch tuning

use std::path::PathBuf;
use std::time::Duration;

use crate::preview::cache::EvictionPolicy;

/// Configuration handed to [`crate::preview::manager::PreviewManager`] and
/// its components at construction time. No dynamic reconfiguration beyond
/// `set_max_size` is supported.
#[derive(Debug, Clone)]
pub struct PreviewConfig {
    /// Directory holding cached blobs and the index sidecar.
    pub cache_dir: PathBuf,
    /// Cache size budget in bytes.
    pub max_cache_size: u64,
    pub eviction_policy: EvictionPolicy,
    /// Creation-age cutoff used by the age eviction policy.
    pub age_threshold: Duration,
    /// Deadline applied to each individual fetch attempt.
    pub fetch_timeout: Duration,
    /// Retry budget for transient network failures.
    pub max_retries: u32,
    /// Render with ANSI half-blocks instead of a graphics protocol. The
    /// safe default inside a TUI, where raw protocol sequences can corrupt
    /// the screen.
    pub text_mode: bool,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        let cache_dir = dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("blobview");

        Self {
            cache_dir,
            max_cache_size: 100 * 1024 * 1024,
            eviction_policy: EvictionPolicy::Lru,
            age_threshold: Duration::from_secs(24 * 60 * 60),
            fetch_timeout: Duration::from_secs(30),
            max_retries: 3,
            text_mode: true,
        }
    }
}

impl PreviewConfig {
    /// Defaults with `BLOBVIEW_*` environment overrides applied.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("BLOBVIEW_CACHE_DIR") {
            config.cache_dir = PathBuf::from(dir);
        }
        config.max_cache_size = parse_size_env("BLOBVIEW_CACHE_SIZE", config.max_cache_size);
        config.age_threshold = Duration::from_secs(parse_duration_env(
            "BLOBVIEW_CACHE_TTL",
            config.age_threshold.as_secs(),
        ));

        config
    }
}

/// Parse a byte size like `500KB`, `100MB`, or `2GB` from an environment
/// variable, falling back to `default` when unset or unparseable.
pub fn parse_size_env(env_var: &str, default: u64) -> u64 {
    let Ok(size_str) = std::env::var(env_var) else {
        return default;
    };

    let size_str = size_str.to_uppercase();

    let (number_part, unit) = if size_str.ends_with("GB") {
        (size_str.trim_end_matches("GB"), 1024 * 1024 * 1024)
    } else if size_str.ends_with("MB") {
        (size_str.trim_end_matches("MB"), 1024 * 1024)
    } else if size_str.ends_with("KB") {
        (size_str.trim_end_matches("KB"), 1024)
    } else {
        (size_str.as_str(), 1)
    };

    match number_part.parse::<u64>() {
        Ok(num) => num * unit,
        Err(_) => default,
    }
}

/// Parse a duration like `30m`, `2h`, or `7d` (bare numbers are seconds)
/// from an environment variable.
pub fn parse_duration_env(env_var: &str, default_seconds: u64) -> u64 {
    let Ok(duration_str) = std::env::var(env_var) else {
        return default_seconds;
    };

    let duration_str = duration_str.to_lowercase();

    let (number_part, multiplier) = if duration_str.ends_with('d') {
        (duration_str.trim_end_matches('d'), 24 * 3600)
    } else if duration_str.ends_with('h') {
        (duration_str.trim_end_matches('h'), 3600)
    } else if duration_str.ends_with('m') {
        (duration_str.trim_end_matches('m'), 60)
    } else {
        (duration_str.as_str(), 1)
    };

    match number_part.parse::<u64>() {
        Ok(num) => num * multiplier,
        Err(_) => default_seconds,
    }
}
