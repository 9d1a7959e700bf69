//! Download task runner.
//!
//! Drives a single yt-dlp invocation per download, parses its stdout line
//! stream into normalized progress events, and reports a terminal result with
//! the final file path. Audio extraction runs through yt-dlp's ffmpeg
//! post-processor, so a download passes through `downloading` and then
//! `converting` before it finishes.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::Config;
use crate::{youtube, DownloadError, Result};

/// Timeout for metadata-only yt-dlp invocations
const INFO_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle states of a download task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Downloading,
    Converting,
    Finished,
    Error,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Finished | TaskStatus::Error)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Converting => "converting",
            TaskStatus::Finished => "finished",
            TaskStatus::Error => "error",
        }
    }
}

/// A single normalized progress event
#[derive(Debug, Clone, Serialize)]
pub struct Progress {
    pub status: TaskStatus,
    pub percentage: f64,
    pub message: Option<String>,
    pub rate: Option<String>,
    pub filename: Option<String>,
}

impl Progress {
    fn downloading(percentage: f64, rate: Option<String>) -> Self {
        Self {
            status: TaskStatus::Downloading,
            percentage,
            message: None,
            rate,
            filename: None,
        }
    }

    fn converting(filename: Option<String>, format: &str) -> Self {
        Self {
            status: TaskStatus::Converting,
            percentage: 100.0,
            message: Some(format!("Converting to {}", format)),
            rate: None,
            filename,
        }
    }

    fn finished(filename: &str) -> Self {
        Self {
            status: TaskStatus::Finished,
            percentage: 100.0,
            message: Some("Download completed".to_string()),
            rate: None,
            filename: Some(filename.to_string()),
        }
    }

    fn errored(message: String, percentage: f64) -> Self {
        Self {
            status: TaskStatus::Error,
            percentage,
            message: Some(message),
            rate: None,
            filename: None,
        }
    }
}

/// Result of a finished download
#[derive(Debug, Clone)]
pub struct DownloadOutcome {
    pub url: String,
    pub video_id: Option<String>,
    pub title: String,
    pub uploader: Option<String>,
    pub duration: Option<u64>,
    pub filename: String,
    pub path: PathBuf,
    pub file_size: Option<u64>,
    pub raw_info: Value,
}

/// Wraps the yt-dlp binary for info extraction and audio downloads
pub struct AudioDownloader {
    config: Config,
    binary: String,
}

impl AudioDownloader {
    pub fn new(config: Config) -> Self {
        let binary = config.ytdlp.binary.clone();
        Self { config, binary }
    }

    /// Fetch raw video metadata without downloading anything
    pub async fn video_info(&self, url: &str) -> Result<Value> {
        if !youtube::is_valid_url(url) {
            return Err(DownloadError::InvalidUrl(url.to_string()).into());
        }
        let url = youtube::normalize_url(url);

        let mut cmd = Command::new(&self.binary);
        cmd.arg("--dump-json")
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--socket-timeout")
            .arg(self.config.ytdlp.socket_timeout.to_string())
            .arg(&url)
            .stdin(Stdio::null());

        debug!(url = %url, "Fetching video info");

        let output = timeout(INFO_TIMEOUT, cmd.output())
            .await
            .map_err(|_| DownloadError::MetadataFailed("yt-dlp timed out".to_string()))?
            .map_err(spawn_error)?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DownloadError::MetadataFailed(translate_stderr(&stderr)).into());
        }

        let raw: Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| DownloadError::MetadataFailed(format!("unreadable info JSON: {}", e)))?;
        Ok(raw)
    }

    /// Download the audio track of one video and convert it to the configured
    /// format.
    ///
    /// Progress events flow through `progress`: at least one `downloading`
    /// event with a monotonically non-decreasing percentage, then
    /// `converting`, and exactly one terminal `finished` or `error` event.
    /// Validation failures return immediately without any event.
    pub async fn download(
        &self,
        url: &str,
        output_name: Option<&str>,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<DownloadOutcome> {
        if !youtube::is_valid_url(url) {
            return Err(DownloadError::InvalidUrl(url.to_string()).into());
        }
        let url = youtube::normalize_url(url);

        // remember the highest percentage handed out so a failure
        // mid-transfer reports at that level instead of dropping to zero
        let peak = std::sync::Mutex::new(0.0f64);
        let tracked = |p: Progress| {
            {
                let mut peak = match peak.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                if p.percentage > *peak {
                    *peak = p.percentage;
                }
            }
            progress(p);
        };

        match self.run(&url, output_name, &tracked).await {
            Ok(outcome) => {
                progress(Progress::finished(&outcome.filename));
                Ok(outcome)
            }
            Err(e) => {
                let peak = match peak.lock() {
                    Ok(guard) => *guard,
                    Err(poisoned) => *poisoned.into_inner(),
                };
                progress(Progress::errored(e.to_string(), peak));
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        url: &str,
        output_name: Option<&str>,
        progress: &(dyn Fn(Progress) + Send + Sync),
    ) -> Result<DownloadOutcome> {
        let raw_info = self.video_info(url).await.map_err(|e| {
            DownloadError::DownloadFailed(format!("could not resolve video: {}", e))
        })?;

        progress(Progress::downloading(0.0, None));

        let mut child = self
            .build_command(url, output_name)
            .spawn()
            .map_err(spawn_error)?;

        let stdout = child
            .stdout
            .take()
            .context("yt-dlp stdout was not captured")?;
        let stderr = child
            .stderr
            .take()
            .context("yt-dlp stderr was not captured")?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = String::new();
            let mut reader = BufReader::new(stderr);
            let _ = reader.read_to_string(&mut buf).await;
            buf
        });

        let mut parser = OutputParser::new(self.config.audio.format.clone());

        let wait = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines.next_line().await? {
                parser.feed(&line, progress);
            }
            child.wait().await
        };

        let waited = timeout(Duration::from_secs(self.config.ytdlp.download_timeout), wait).await;
        let status = match waited {
            Ok(status) => status.context("Failed reading yt-dlp output")?,
            Err(_) => {
                let _ = child.kill().await;
                return Err(DownloadError::DownloadFailed(format!(
                    "download timed out after {}s",
                    self.config.ytdlp.download_timeout
                ))
                .into());
            }
        };

        let stderr_buf = stderr_task.await.unwrap_or_default();

        if !status.success() {
            return Err(classify_failure(&stderr_buf).into());
        }

        let path = parser
            .final_path()
            .unwrap_or_else(|| self.fallback_path(&raw_info, output_name));
        let filename = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());

        let file_size = match tokio::fs::metadata(&path).await {
            Ok(meta) => Some(meta.len()),
            Err(e) => {
                warn!(path = %path.display(), "Downloaded file not found on disk: {}", e);
                None
            }
        };

        Ok(DownloadOutcome {
            url: url.to_string(),
            video_id: raw_info.get("id").and_then(Value::as_str).map(str::to_string),
            title: raw_info
                .get("title")
                .and_then(Value::as_str)
                .unwrap_or("Unknown")
                .to_string(),
            uploader: raw_info
                .get("uploader")
                .and_then(Value::as_str)
                .map(str::to_string),
            duration: raw_info.get("duration").and_then(Value::as_u64),
            filename,
            path,
            file_size,
            raw_info,
        })
    }

    fn build_command(&self, url: &str, output_name: Option<&str>) -> Command {
        let ytdlp = &self.config.ytdlp;
        let template = match output_name {
            Some(name) => self
                .config
                .paths
                .downloads_dir
                .join(format!("{}.%(ext)s", crate::utils::sanitize_filename(name))),
            None => self.config.paths.downloads_dir.join("%(title)s.%(ext)s"),
        };

        let mut cmd = Command::new(&self.binary);
        cmd.arg("-f")
            .arg("bestaudio/best")
            .arg("-x")
            .arg("--audio-format")
            .arg(&self.config.audio.format)
            .arg("--audio-quality")
            .arg(format!("{}K", self.config.audio.quality))
            .arg("--no-playlist")
            .arg("--no-warnings")
            .arg("--newline")
            .arg("--progress-template")
            .arg("download:%(progress._percent_str)s|%(progress._speed_str)s")
            .arg("--socket-timeout")
            .arg(ytdlp.socket_timeout.to_string())
            .arg("--retries")
            .arg(ytdlp.retries.to_string())
            .arg("--fragment-retries")
            .arg(ytdlp.fragment_retries.to_string())
            .arg("-o")
            .arg(&template);

        if ytdlp.write_thumbnail {
            cmd.arg("--write-thumbnail");
        }
        if ytdlp.write_info_json {
            cmd.arg("--write-info-json");
        }

        cmd.arg(url)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn fallback_path(&self, raw_info: &Value, output_name: Option<&str>) -> PathBuf {
        let stem = match output_name {
            Some(name) => crate::utils::sanitize_filename(name),
            None => raw_info
                .get("title")
                .and_then(Value::as_str)
                .map(crate::utils::sanitize_filename)
                .unwrap_or_else(|| "audio".to_string()),
        };
        self.config
            .paths
            .downloads_dir
            .join(format!("{}.{}", stem, self.config.audio.format))
    }
}

/// Incremental parser over yt-dlp's stdout lines
struct OutputParser {
    audio_format: String,
    max_percentage: f64,
    download_dest: Option<PathBuf>,
    audio_dest: Option<PathBuf>,
}

impl OutputParser {
    fn new(audio_format: String) -> Self {
        Self {
            audio_format,
            max_percentage: 0.0,
            download_dest: None,
            audio_dest: None,
        }
    }

    fn feed(&mut self, line: &str, progress: &(dyn Fn(Progress) + Send + Sync)) {
        if let Some((pct, rate)) = parse_progress_line(line) {
            // yt-dlp restarts its counter per fragment; keep reports monotonic
            if pct >= self.max_percentage {
                self.max_percentage = pct;
                progress(Progress::downloading(pct, rate));
            }
        } else if let Some(dest) = line.strip_prefix("[ExtractAudio] Destination: ") {
            let path = PathBuf::from(dest.trim());
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned());
            self.audio_dest = Some(path);
            progress(Progress::converting(filename, &self.audio_format));
        } else if let Some(dest) = line.strip_prefix("[download] Destination: ") {
            self.download_dest = Some(PathBuf::from(dest.trim()));
        } else if let Some(rest) = line.strip_prefix("[download] ") {
            if let Some(dest) = rest.strip_suffix(" has already been downloaded") {
                self.download_dest = Some(PathBuf::from(dest.trim()));
            }
        }
    }

    /// Path of the converted audio file, if yt-dlp reported one
    fn final_path(&self) -> Option<PathBuf> {
        self.audio_dest.clone().or_else(|| {
            self.download_dest
                .as_ref()
                .map(|p| p.with_extension(&self.audio_format))
        })
    }
}

/// Parse one progress-template line into (percentage, rate)
fn parse_progress_line(line: &str) -> Option<(f64, Option<String>)> {
    let rest = line.strip_prefix("download:")?;
    let (pct_part, rate_part) = match rest.split_once('|') {
        Some((p, r)) => (p, Some(r)),
        None => (rest, None),
    };

    let pct: f64 = pct_part.trim().trim_end_matches('%').trim().parse().ok()?;
    let pct = pct.clamp(0.0, 100.0);

    let rate = rate_part
        .map(str::trim)
        .filter(|r| !r.is_empty() && *r != "NA" && *r != "Unknown")
        .map(str::to_string);

    Some((pct, rate))
}

/// Map a process spawn error to something actionable
fn spawn_error(e: std::io::Error) -> anyhow::Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        DownloadError::DownloadFailed(
            "yt-dlp is not installed or not in PATH".to_string(),
        )
        .into()
    } else {
        DownloadError::DownloadFailed(format!("failed to start yt-dlp: {}", e)).into()
    }
}

/// Classify a failed run as a download or conversion error from its stderr
fn classify_failure(stderr: &str) -> DownloadError {
    let lower = stderr.to_lowercase();
    let message = translate_stderr(stderr);

    if lower.contains("ffmpeg") || lower.contains("ffprobe") || lower.contains("postprocess") {
        DownloadError::ConversionFailed(message)
    } else {
        DownloadError::DownloadFailed(message)
    }
}

/// Turn yt-dlp's stderr into a single readable message
fn translate_stderr(stderr: &str) -> String {
    let lower = stderr.to_lowercase();

    if lower.contains("video unavailable") {
        return "video is unavailable or has been removed".to_string();
    }
    if lower.contains("private video") {
        return "video is private".to_string();
    }
    if lower.contains("sign in to confirm your age") || lower.contains("age-restricted") {
        return "video is age-restricted".to_string();
    }
    if lower.contains("ffmpeg") && lower.contains("not found") {
        return "ffmpeg is not installed or not in PATH".to_string();
    }
    if lower.contains("unsupported url") || lower.contains("is not a valid url") {
        return "URL is not supported".to_string();
    }

    // fall back to yt-dlp's last ERROR line
    stderr
        .lines()
        .rev()
        .find(|l| l.starts_with("ERROR:"))
        .map(|l| l.trim_start_matches("ERROR:").trim().to_string())
        .unwrap_or_else(|| "yt-dlp exited with an error".to_string())
}
