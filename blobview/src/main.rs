// ABOUTME: Command-line entry point for previewing remote images in the terminal
// ABOUTME: Subcommands for previewing, prefetching, and cache inspection

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use blobview::preview::{DiskCache, ObjectDownloader, PreviewManager};
use blobview::preview::manager::probe_dimensions;
use blobview::{FileItem, HttpObjectStore, PreviewConfig};

#[derive(Parser)]
#[command(name = "blobview")]
#[command(about = "Preview images from a remote object store in your terminal", long_about = None)]
struct Cli {
    /// Base URL of the object store (or set BLOBVIEW_BASE_URL)
    #[arg(long, global = true)]
    url: Option<String>,

    /// Override the cache directory
    #[arg(long, global = true)]
    cache_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch an image and render it to the terminal
    Preview {
        /// Object key, e.g. photos/cat.png
        key: String,

        /// Fit the preview into this many columns
        #[arg(long, requires = "rows")]
        cols: Option<u16>,

        /// Fit the preview into this many rows
        #[arg(long, requires = "cols")]
        rows: Option<u16>,

        /// Place the preview at this terminal column (1-based, kitty only)
        #[arg(long, requires = "cols")]
        col: Option<u16>,

        /// Place the preview at this terminal row
        #[arg(long, requires = "cols")]
        row: Option<u16>,

        /// Re-download even when a cached copy exists
        #[arg(long)]
        force: bool,

        /// Render with ANSI half-blocks instead of a graphics protocol
        #[arg(long)]
        text: bool,
    },

    /// Download an image into the cache without rendering it
    Fetch {
        /// Object key to prefetch
        key: String,
    },

    /// Show cache usage statistics
    CacheStats {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify cached file checksums (one key, or the whole cache)
    Verify {
        /// Object key to verify; omit to verify and compact everything
        key: Option<String>,
    },

    /// Evict entries until the cache is within its size budget
    Clean,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();

    let mut config = PreviewConfig::from_env();
    if let Some(dir) = cli.cache_dir {
        config.cache_dir = dir;
    }

    match cli.command {
        Commands::Preview {
            key,
            cols,
            rows,
            col,
            row,
            force,
            text,
        } => {
            config.text_mode = text;
            let store = open_store(cli.url, &config)?;
            let manager = PreviewManager::new(store, &config)?;
            let item = FileItem::new(key.clone(), guess_content_type(&key));
            let (at_col, at_row) = (col.unwrap_or(1), row.unwrap_or(1));

            let preview = match (cols, rows, force) {
                (Some(c), Some(r), false) => {
                    manager.preview_at(&item, c, r, at_col, at_row).await?
                }
                (Some(c), Some(r), true) => {
                    manager
                        .preview_at_forced(&item, c, r, at_col, at_row)
                        .await?
                }
                (_, _, false) => manager.preview(&item).await?,
                (_, _, true) => manager.preview_forced(&item).await?,
            };

            print!("{}", preview.rendered_data);
            eprintln!(
                "{} {} {} -> {} ({}, {:.0?}{})",
                preview.file_key,
                preview.format.name(),
                preview.original_size,
                preview.display_size,
                if preview.cache_hit { "cached" } else { "downloaded" },
                preview.load_time,
                if preview.cache_hit { "" } else { ", now cached" },
            );
            manager.close();
        }

        Commands::Fetch { key } => {
            let store = open_store(cli.url, &config)?;
            let cache = open_cache(&config)?;
            let downloader = ObjectDownloader::new(store, config.max_retries);

            let bar = ProgressBar::new(0);
            bar.set_style(
                ProgressStyle::with_template(
                    "{bar:40.cyan/blue} {bytes}/{total_bytes} ({bytes_per_sec}, eta {eta})",
                )
                .context("invalid progress template")?,
            );

            let progress = bar.clone();
            let temp = downloader
                .fetch_with_progress(
                    &key,
                    Box::new(move |downloaded, total| {
                        progress.set_length(total.max(downloaded));
                        progress.set_position(downloaded);
                    }),
                )
                .await?;
            bar.finish_and_clear();

            let cached = cache.put(&key, &temp)?;
            let _ = std::fs::remove_file(&temp);
            let dims = probe_dimensions(&cached);
            println!("{key} -> {} ({dims})", cached.display());
            cache.stop_maintenance();
        }

        Commands::CacheStats { json } => {
            let cache = open_cache(&config)?;
            let metrics = cache.metrics();
            if json {
                println!("{}", serde_json::to_string_pretty(&metrics)?);
            } else {
                println!("files:      {}", metrics.total_files);
                println!(
                    "size:       {} / {} ({:.1}%)",
                    metrics.total_size, metrics.max_size, metrics.usage_percent
                );
                println!("avg size:   {:.0} bytes", metrics.average_file_size);
                println!("last clean: {}", metrics.last_cleanup);
                if let Some(oldest) = metrics.oldest_entry {
                    println!("oldest:     {} ({})", oldest.key, oldest.create_time);
                }
            }
            cache.stop_maintenance();
        }

        Commands::Verify { key } => {
            let cache = open_cache(&config)?;
            match key {
                Some(key) => {
                    if cache.verify_checksum(&key)? {
                        println!("{key}: ok");
                    } else {
                        println!("{key}: checksum mismatch");
                        std::process::exit(1);
                    }
                }
                None => {
                    let before = cache.stats().total_files;
                    cache.compact()?;
                    let after = cache.stats().total_files;
                    println!("verified {after} entries, dropped {}", before - after);
                }
            }
            cache.stop_maintenance();
        }

        Commands::Clean => {
            let cache = open_cache(&config)?;
            let before = cache.stats();
            cache.cleanup()?;
            let after = cache.stats();
            println!(
                "evicted {} entries, {} -> {} bytes",
                before.total_files - after.total_files,
                before.total_size,
                after.total_size
            );
            cache.stop_maintenance();
        }
    }

    Ok(())
}

fn open_store(url: Option<String>, config: &PreviewConfig) -> Result<Arc<HttpObjectStore>> {
    let base_url = match url.or_else(|| env::var("BLOBVIEW_BASE_URL").ok()) {
        Some(url) => url,
        None => {
            eprintln!("Error: no object store URL given");
            eprintln!();
            eprintln!("Pass --url or set the base URL in the environment:");
            eprintln!("export BLOBVIEW_BASE_URL=https://bucket.example.com/");
            std::process::exit(1);
        }
    };

    let store = HttpObjectStore::new(&base_url, config.fetch_timeout)?;
    Ok(Arc::new(store))
}

fn open_cache(config: &PreviewConfig) -> Result<DiskCache> {
    DiskCache::new(
        &config.cache_dir,
        config.max_cache_size,
        config.eviction_policy,
        config.age_threshold,
    )
    .context("failed to open cache")
}

/// Content type from the key's extension; the preview gate falls back to
/// extension checks for generic types anyway.
fn guess_content_type(key: &str) -> String {
    std::path::Path::new(key)
        .extension()
        .and_then(|e| e.to_str())
        .and_then(blobview::preview::ImageFormat::from_extension)
        .map(|f| f.mime_type().to_string())
        .unwrap_or_else(|| "application/octet-stream".to_string())
}
