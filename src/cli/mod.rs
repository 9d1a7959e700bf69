use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "yt-audio",
    about = "YouTube Audio Downloader - Download high-quality MP3 audio from YouTube videos",
    version,
    long_about = "A CLI and web tool for downloading audio from YouTube videos. Wraps yt-dlp and ffmpeg to extract high-quality MP3 audio, saves rich metadata as JSON records, and keeps an SQLite download history."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Download audio from one or more YouTube videos
    Download {
        /// YouTube video URL
        #[arg(value_name = "URL", required_unless_present = "file")]
        url: Option<String>,

        /// Read URLs from a file, one per line
        #[arg(short, long, value_name = "FILE", conflicts_with = "url")]
        file: Option<PathBuf>,

        /// Custom output filename (without extension, single downloads only)
        #[arg(short, long, value_name = "NAME")]
        output: Option<String>,

        /// Also save the metadata JSON record
        #[arg(short, long)]
        metadata: bool,

        /// Show video information without downloading
        #[arg(long)]
        info_only: bool,

        /// Keep going when a URL in a batch fails
        #[arg(long)]
        continue_on_error: bool,
    },

    /// Show detailed information about a video
    Info {
        /// YouTube video URL
        #[arg(value_name = "URL")]
        url: String,

        /// Save the metadata JSON record
        #[arg(short, long)]
        save_info: bool,
    },

    /// Show or create the configuration file
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,

        /// Write a sample configuration file to the current directory
        #[arg(long)]
        create_sample: bool,
    },

    /// Run the web server
    Serve {
        /// Bind address (overrides the configuration)
        #[arg(long, value_name = "HOST")]
        host: Option<String>,

        /// Bind port (overrides the configuration)
        #[arg(short, long, value_name = "PORT")]
        port: Option<u16>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_download_requires_url_or_file() {
        assert!(Cli::try_parse_from(["yt-audio", "download"]).is_err());
        assert!(Cli::try_parse_from(["yt-audio", "download", "https://youtu.be/x"]).is_ok());
        assert!(Cli::try_parse_from(["yt-audio", "download", "--file", "urls.txt"]).is_ok());
    }

    #[test]
    fn test_download_url_conflicts_with_file() {
        let result = Cli::try_parse_from([
            "yt-audio",
            "download",
            "https://youtu.be/x",
            "--file",
            "urls.txt",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_global_flags_parse_after_subcommand() {
        let cli = Cli::try_parse_from(["yt-audio", "info", "https://youtu.be/x", "--verbose"])
            .unwrap();
        assert!(cli.verbose);
    }
}
