//! YouTube Audio Downloader - A Rust CLI and web tool for downloading audio from YouTube
//!
//! This library wraps yt-dlp and ffmpeg to download audio from YouTube videos,
//! convert it to high-quality MP3, and persist descriptive metadata as JSON records.
//! The same functionality is exposed over HTTP with SSE progress streaming and an
//! SQLite-backed download history.

pub mod cli;
pub mod config;
pub mod downloader;
pub mod history;
pub mod metadata;
pub mod registry;
pub mod server;
pub mod utils;
pub mod youtube;

pub use cli::{Cli, Commands};
pub use config::Config;
pub use downloader::{AudioDownloader, DownloadOutcome, Progress, TaskStatus};
pub use metadata::MetadataRecord;

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Error types specific to the downloader
#[derive(thiserror::Error, Debug)]
pub enum DownloadError {
    #[error("Invalid YouTube URL: {0}")]
    InvalidUrl(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Audio conversion failed: {0}")]
    ConversionFailed(String),

    #[error("Metadata extraction failed: {0}")]
    MetadataFailed(String),

    #[error("History persistence failed: {0}")]
    PersistenceFailed(String),
}
