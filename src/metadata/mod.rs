//! Metadata extraction and persistence.
//!
//! Maps the raw JSON that `yt-dlp --dump-json` emits into a normalized
//! [`MetadataRecord`] and writes it as a JSON file keyed by sanitized title
//! and video id. Records are derived once and never mutated.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::AudioConfig;
use crate::utils::{format_file_size, sanitize_filename};
use crate::Result;

/// Schema version written into every record
const METADATA_VERSION: &str = "1.0";

/// Normalized metadata for a single video
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataRecord {
    pub video_info: VideoInfo,
    pub technical_info: TechnicalInfo,
    pub download_info: DownloadInfo,
    pub computed: ComputedInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoInfo {
    pub id: Option<String>,
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub upload_date: Option<String>,
    pub duration: Option<u64>,
    pub duration_formatted: String,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub description: Option<String>,
    pub tags: Vec<String>,
    pub webpage_url: Option<String>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TechnicalInfo {
    pub format: Option<String>,
    pub ext: Option<String>,
    pub filesize: Option<u64>,
    pub filesize_formatted: Option<String>,
    pub acodec: Option<String>,
    pub vcodec: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadInfo {
    pub extracted_at: DateTime<Utc>,
    pub output_format: String,
    pub quality: String,
    pub metadata_version: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComputedInfo {
    pub video_id: Option<String>,
    pub has_description: bool,
    pub has_tags: bool,
    pub estimated_file_size: String,
}

impl MetadataRecord {
    /// Build a record from yt-dlp's raw info JSON.
    ///
    /// Missing or malformed fields map to `None` rather than failing; the
    /// record is always constructible from whatever yt-dlp returned.
    pub fn from_raw(raw: &Value, audio: &AudioConfig) -> Self {
        let duration = raw.get("duration").and_then(Value::as_u64);
        let description = get_string(raw, "description");
        let tags: Vec<String> = raw
            .get("tags")
            .and_then(Value::as_array)
            .map(|arr| {
                arr.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let filesize = raw
            .get("filesize")
            .and_then(Value::as_u64)
            .or_else(|| raw.get("filesize_approx").and_then(Value::as_u64));

        let video_id = get_string(raw, "id");

        Self {
            video_info: VideoInfo {
                id: video_id.clone(),
                title: get_string(raw, "title"),
                uploader: get_string(raw, "uploader"),
                upload_date: get_string(raw, "upload_date"),
                duration,
                duration_formatted: format_duration(duration),
                view_count: raw.get("view_count").and_then(Value::as_u64),
                like_count: raw.get("like_count").and_then(Value::as_u64),
                description: description.clone(),
                tags: tags.clone(),
                webpage_url: get_string(raw, "webpage_url"),
                thumbnail: get_string(raw, "thumbnail"),
            },
            technical_info: TechnicalInfo {
                format: get_string(raw, "format"),
                ext: get_string(raw, "ext"),
                filesize,
                filesize_formatted: filesize.map(format_file_size),
                acodec: get_string(raw, "acodec"),
                vcodec: get_string(raw, "vcodec"),
            },
            download_info: DownloadInfo {
                extracted_at: Utc::now(),
                output_format: audio.format.clone(),
                quality: format!("{}kbps", audio.quality),
                metadata_version: METADATA_VERSION.to_string(),
            },
            computed: ComputedInfo {
                video_id,
                has_description: description.map_or(false, |d| !d.trim().is_empty()),
                has_tags: !tags.is_empty(),
                estimated_file_size: estimate_audio_size(duration, audio.quality),
            },
        }
    }

    /// Filename stem this record is persisted under
    pub fn file_stem(&self) -> String {
        let title = self.video_info.title.as_deref().unwrap_or("unknown");
        let id = self.video_info.id.as_deref().unwrap_or("unknown");
        format!("{}_{}", sanitize_filename(title), id)
    }
}

/// Write a record as pretty JSON into `dir`, atomically.
///
/// The record is written to a temporary file first and renamed into place so
/// readers never observe a half-written record.
pub fn save_record(dir: &Path, record: &MetadataRecord) -> Result<PathBuf> {
    let filename = format!("{}.json", record.file_stem());
    let final_path = dir.join(&filename);
    let tmp_path = dir.join(format!(".{}.tmp", filename));

    let content = serde_json::to_string_pretty(record)
        .context("Failed to serialize metadata record")?;

    fs_err::write(&tmp_path, content).context("Failed to write metadata record")?;
    fs_err::rename(&tmp_path, &final_path).context("Failed to finalize metadata record")?;

    Ok(final_path)
}

/// Format a duration in seconds as `M:SS` or `H:MM:SS`.
///
/// The leading field is unpadded; absent durations become `"N/A"`.
pub fn format_duration(seconds: Option<u64>) -> String {
    let Some(total) = seconds else {
        return "N/A".to_string();
    };

    let hours = total / 3600;
    let minutes = (total % 3600) / 60;
    let secs = total % 60;

    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, secs)
    } else {
        format!("{}:{:02}", minutes, secs)
    }
}

/// Parse a duration previously produced by [`format_duration`]
pub fn parse_duration(formatted: &str) -> Option<u64> {
    if formatted == "N/A" {
        return None;
    }

    let parts: Vec<&str> = formatted.split(':').collect();
    let nums: Vec<u64> = parts.iter().map(|p| p.parse().ok()).collect::<Option<_>>()?;

    match nums.as_slice() {
        [m, s] => Some(m * 60 + s),
        [h, m, s] => Some(h * 3600 + m * 60 + s),
        _ => None,
    }
}

/// Estimate the size of the extracted audio file at the given bitrate
pub fn estimate_audio_size(duration: Option<u64>, quality_kbps: u32) -> String {
    match duration {
        Some(secs) => {
            let bytes = secs * u64::from(quality_kbps) / 8 * 1024;
            format_file_size(bytes)
        }
        None => "N/A".to_string(),
    }
}

fn get_string(raw: &Value, key: &str) -> Option<String> {
    raw.get(key).and_then(Value::as_str).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn audio_config() -> AudioConfig {
        AudioConfig {
            format: "mp3".to_string(),
            quality: 320,
        }
    }

    #[test]
    fn test_format_duration_short() {
        assert_eq!(format_duration(Some(19)), "0:19");
        assert_eq!(format_duration(Some(59)), "0:59");
        assert_eq!(format_duration(Some(225)), "3:45");
    }

    #[test]
    fn test_format_duration_with_hours() {
        assert_eq!(format_duration(Some(3661)), "1:01:01");
        assert_eq!(format_duration(Some(3600)), "1:00:00");
        assert_eq!(format_duration(Some(36000)), "10:00:00");
    }

    #[test]
    fn test_format_duration_missing() {
        assert_eq!(format_duration(None), "N/A");
        assert_eq!(format_duration(Some(0)), "0:00");
    }

    #[test]
    fn test_parse_duration_inverts_format() {
        for secs in [0, 19, 59, 60, 225, 3599, 3600, 3661, 36000] {
            let formatted = format_duration(Some(secs));
            assert_eq!(parse_duration(&formatted), Some(secs), "for {}", formatted);
        }
        assert_eq!(parse_duration("N/A"), None);
        assert_eq!(parse_duration("garbage"), None);
    }

    #[test]
    fn test_from_raw_full_record() {
        let raw = json!({
            "id": "dQw4w9WgXcQ",
            "title": "Test Video",
            "uploader": "Test Channel",
            "upload_date": "20240115",
            "duration": 212,
            "view_count": 1000000,
            "like_count": 50000,
            "description": "A description",
            "tags": ["music", "test"],
            "webpage_url": "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "thumbnail": "https://i.ytimg.com/vi/dQw4w9WgXcQ/default.jpg",
            "format": "251 - audio only",
            "ext": "webm",
            "filesize": 3400000u64,
            "acodec": "opus",
            "vcodec": "none"
        });

        let record = MetadataRecord::from_raw(&raw, &audio_config());
        assert_eq!(record.video_info.title.as_deref(), Some("Test Video"));
        assert_eq!(record.video_info.duration_formatted, "3:32");
        assert_eq!(record.computed.video_id.as_deref(), Some("dQw4w9WgXcQ"));
        assert!(record.computed.has_description);
        assert!(record.computed.has_tags);
        assert_eq!(record.technical_info.filesize, Some(3400000));
        assert!(record.technical_info.filesize_formatted.is_some());
        assert_eq!(record.download_info.quality, "320kbps");
    }

    #[test]
    fn test_from_raw_sparse_record() {
        let raw = json!({ "id": "abcdefghijk" });

        let record = MetadataRecord::from_raw(&raw, &audio_config());
        assert_eq!(record.video_info.title, None);
        assert_eq!(record.video_info.duration, None);
        assert_eq!(record.video_info.duration_formatted, "N/A");
        assert!(!record.computed.has_description);
        assert!(!record.computed.has_tags);
        assert!(record.video_info.tags.is_empty());
        assert_eq!(record.computed.estimated_file_size, "N/A");
    }

    #[test]
    fn test_estimate_audio_size() {
        // one minute at 320 kbps is about 2.3 MB
        let estimate = estimate_audio_size(Some(60), 320);
        assert_eq!(estimate, "2.3 MB");
        assert_eq!(estimate_audio_size(None, 320), "N/A");
    }

    #[test]
    fn test_file_stem_sanitizes_title() {
        let raw = json!({ "id": "abcdefghijk", "title": "a/b: c?" });
        let record = MetadataRecord::from_raw(&raw, &audio_config());
        assert_eq!(record.file_stem(), "a_b_ c__abcdefghijk");
    }

    #[test]
    fn test_save_record_writes_readable_json() {
        let dir = tempfile::tempdir().unwrap();
        let raw = json!({ "id": "abcdefghijk", "title": "Test", "duration": 19 });
        let record = MetadataRecord::from_raw(&raw, &audio_config());

        let path = save_record(dir.path(), &record).unwrap();
        assert!(path.is_file());
        assert_eq!(path.file_name().unwrap(), "Test_abcdefghijk.json");

        let content = fs_err::read_to_string(&path).unwrap();
        let reloaded: MetadataRecord = serde_json::from_str(&content).unwrap();
        assert_eq!(reloaded.video_info.duration_formatted, "0:19");

        // no leftover temp file
        let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }
}
