use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Audio output settings
    pub audio: AudioConfig,

    /// Output directory layout
    pub paths: PathsConfig,

    /// yt-dlp invocation settings
    pub ytdlp: YtDlpConfig,

    /// Web server settings
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioConfig {
    /// Target audio format after extraction
    pub format: String,

    /// Target bitrate in kbps
    pub quality: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Directory for downloaded audio files
    pub downloads_dir: PathBuf,

    /// Directory for metadata JSON records
    pub metadata_dir: PathBuf,

    /// Directory for log files
    pub logs_dir: PathBuf,

    /// SQLite database file for the download history
    pub history_db: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct YtDlpConfig {
    /// Path to the yt-dlp binary
    pub binary: String,

    /// Socket timeout in seconds passed to yt-dlp
    pub socket_timeout: u32,

    /// Retry count for failed downloads
    pub retries: u32,

    /// Retry count for failed fragments
    pub fragment_retries: u32,

    /// Upper bound for a whole download, in seconds
    pub download_timeout: u64,

    /// Also save the video thumbnail next to the audio file
    pub write_thumbnail: bool,

    /// Also save yt-dlp's raw info JSON next to the audio file
    pub write_info_json: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address for the web server
    pub host: String,

    /// Bind port for the web server
    pub port: u16,

    /// How long finished tasks stay queryable, in seconds
    pub task_ttl: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            audio: AudioConfig {
                format: "mp3".to_string(),
                quality: 320,
            },
            paths: PathsConfig {
                downloads_dir: PathBuf::from("downloads"),
                metadata_dir: PathBuf::from("metadata"),
                logs_dir: PathBuf::from("logs"),
                history_db: PathBuf::from("downloads.db"),
            },
            ytdlp: YtDlpConfig {
                binary: "yt-dlp".to_string(),
                socket_timeout: 30,
                retries: 3,
                fragment_retries: 3,
                download_timeout: 1800,
                write_thumbnail: true,
                write_info_json: true,
            },
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8000,
                task_ttl: 3600,
            },
        }
    }
}

impl Config {
    /// Load configuration from an explicit path, or from the default
    /// locations, falling back to the built-in defaults
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::config_path()? {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        let content = fs_err::read_to_string(&config_path)
            .context("Failed to read config file")?;

        let config: Config = serde_yaml::from_str(&content)
            .context("Failed to parse config file")?;

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent)?;
            }
        }

        let content = serde_yaml::to_string(self)
            .context("Failed to serialize config")?;

        fs_err::write(path, content)
            .context("Failed to write config file")?;

        Ok(())
    }

    /// Find an existing configuration file, if any
    fn config_path() -> Result<Option<PathBuf>> {
        // First try current directory for easy testing
        let local_config = PathBuf::from("config.yaml");
        if local_config.exists() {
            return Ok(Some(local_config));
        }

        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?;

        let user_config = config_dir.join("yt-audio-downloader").join("config.yaml");
        if user_config.exists() {
            return Ok(Some(user_config));
        }

        Ok(None)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        const SUPPORTED_FORMATS: &[&str] = &["mp3", "m4a", "opus", "vorbis", "wav"];

        if !SUPPORTED_FORMATS.contains(&self.audio.format.as_str()) {
            anyhow::bail!(
                "Unsupported audio format '{}' (supported: {})",
                self.audio.format,
                SUPPORTED_FORMATS.join(", ")
            );
        }

        if !(32..=320).contains(&self.audio.quality) {
            anyhow::bail!(
                "Audio quality must be between 32 and 320 kbps, got {}",
                self.audio.quality
            );
        }

        if self.ytdlp.download_timeout == 0 {
            anyhow::bail!("Download timeout must be greater than zero");
        }

        Ok(())
    }

    /// Create the output directories if they do not exist yet
    pub fn ensure_dirs(&self) -> Result<()> {
        fs_err::create_dir_all(&self.paths.downloads_dir)?;
        fs_err::create_dir_all(&self.paths.metadata_dir)?;
        fs_err::create_dir_all(&self.paths.logs_dir)?;

        if let Some(parent) = self.paths.history_db.parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent)?;
            }
        }

        Ok(())
    }

    /// Display current configuration
    pub fn display(&self) {
        println!("Current Configuration:");
        println!("  Audio Format: {}", self.audio.format);
        println!("  Audio Quality: {} kbps", self.audio.quality);
        println!("  Downloads Dir: {}", self.paths.downloads_dir.display());
        println!("  Metadata Dir: {}", self.paths.metadata_dir.display());
        println!("  Logs Dir: {}", self.paths.logs_dir.display());
        println!("  History DB: {}", self.paths.history_db.display());
        println!("  Server: {}:{}", self.server.host, self.server.port);
        println!("  Download Timeout: {}s", self.ytdlp.download_timeout);
    }
}
