use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yt_audio_downloader::cli::{Cli, Commands};
use yt_audio_downloader::config::Config;
use yt_audio_downloader::downloader::{AudioDownloader, Progress, TaskStatus};
use yt_audio_downloader::metadata::{self, MetadataRecord};
use yt_audio_downloader::{server, utils};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    init_logging(&config, cli.verbose, cli.quiet)?;

    match cli.command {
        Commands::Download {
            url,
            file,
            output,
            metadata,
            info_only,
            continue_on_error,
        } => {
            config.ensure_dirs()?;
            warn_missing_tools().await;

            let urls = collect_urls(url, file)?;
            let failures = if info_only {
                cmd_info_batch(&config, &urls, continue_on_error).await?
            } else {
                cmd_download(
                    &config,
                    &urls,
                    output.as_deref(),
                    metadata,
                    continue_on_error,
                    cli.quiet,
                )
                .await?
            };
            if failures > 0 {
                std::process::exit(1);
            }
        }
        Commands::Info { url, save_info } => {
            config.ensure_dirs()?;
            cmd_info(&config, &url, save_info).await?;
        }
        Commands::Config {
            show,
            create_sample,
        } => {
            if create_sample {
                let path = std::path::Path::new("config.yaml");
                Config::default().save(path)?;
                println!("Sample configuration written to {}", path.display());
            }
            if show || !create_sample {
                config.display();
            }
        }
        Commands::Serve { host, port } => {
            config.ensure_dirs()?;
            warn_missing_tools().await;

            let mut config = config;
            if let Some(host) = host {
                config.server.host = host;
            }
            if let Some(port) = port {
                config.server.port = port;
            }
            server::serve(config).await?;
        }
    }

    Ok(())
}

/// Console logging plus a plain-text log file in the configured logs
/// directory
fn init_logging(config: &Config, verbose: bool, quiet: bool) -> Result<()> {
    let default_level = if quiet {
        "yt_audio_downloader=warn,yt_audio=warn"
    } else if verbose {
        "yt_audio_downloader=debug,yt_audio=debug"
    } else {
        "yt_audio_downloader=info,yt_audio=info"
    };

    let registry = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_level.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false));

    // the logs directory may not exist yet on first run
    let file_layer = fs_err::create_dir_all(&config.paths.logs_dir)
        .ok()
        .and_then(|_| {
            fs_err::OpenOptions::new()
                .create(true)
                .append(true)
                .open(config.paths.logs_dir.join("yt-audio.log"))
                .ok()
        })
        .map(|file| {
            tracing_subscriber::fmt::layer()
                .with_writer(Arc::new(file.into_parts().0))
                .with_ansi(false)
        });

    registry.with(file_layer).init();
    Ok(())
}

async fn warn_missing_tools() {
    let missing = utils::check_dependencies().await;
    if !missing.is_empty() {
        eprintln!("{} Dependency check warnings:", style("!").yellow().bold());
        for dep in missing {
            eprintln!("   - {}", dep);
        }
    }
}

/// Collect the URLs to work on, either one from the command line or a batch
/// from a file (one per line, `#` comments allowed)
fn collect_urls(url: Option<String>, file: Option<std::path::PathBuf>) -> Result<Vec<String>> {
    let urls: Vec<String> = match (url, file) {
        (Some(url), None) => vec![url],
        (None, Some(path)) => fs_err::read_to_string(&path)
            .with_context(|| format!("Failed to read URL file {}", path.display()))?
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty() && !l.starts_with('#'))
            .map(str::to_string)
            .collect(),
        _ => anyhow::bail!("Provide either a URL or --file"),
    };

    if urls.is_empty() {
        anyhow::bail!("No URLs to download");
    }

    // invalid URLs are handled per entry so a batch can keep going
    Ok(urls)
}

/// Returns the number of failed URLs; a single-URL run propagates its error
/// instead
async fn cmd_download(
    config: &Config,
    urls: &[String],
    output: Option<&str>,
    save_metadata: bool,
    continue_on_error: bool,
    quiet: bool,
) -> Result<usize> {
    if urls.len() > 1 && output.is_some() {
        anyhow::bail!("--output only applies to single downloads");
    }

    let downloader = AudioDownloader::new(config.clone());
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for (index, url) in urls.iter().enumerate() {
        if urls.len() > 1 {
            println!(
                "{} [{}/{}] {}",
                style(">").cyan().bold(),
                index + 1,
                urls.len(),
                url
            );
        }

        match download_one(config, &downloader, url, output, save_metadata, quiet).await {
            Ok(()) => succeeded += 1,
            Err(e) => {
                if urls.len() == 1 {
                    return Err(e);
                }
                eprintln!("{} {}: {}", style("x").red().bold(), url, e);
                failed += 1;
                if !continue_on_error {
                    eprintln!("Stopping batch (use --continue-on-error to keep going)");
                    break;
                }
            }
        }
    }

    if urls.len() > 1 {
        println!(
            "\n{} {} succeeded, {} failed",
            style("Summary:").bold(),
            succeeded,
            failed
        );
    }

    Ok(failed)
}

async fn download_one(
    config: &Config,
    downloader: &AudioDownloader,
    url: &str,
    output: Option<&str>,
    save_metadata: bool,
    quiet: bool,
) -> Result<()> {
    let bar = if quiet { None } else { Some(progress_bar()) };

    let bar_handle = bar.clone();
    let callback = move |progress: Progress| {
        if let Some(bar) = &bar_handle {
            update_bar(bar, &progress);
        }
    };

    let outcome = downloader.download(url, output, &callback).await?;

    println!(
        "{} Saved {}",
        style("+").green().bold(),
        outcome.path.display()
    );
    if let Some(size) = outcome.file_size {
        println!("  Size: {}", utils::format_file_size(size));
    }

    if save_metadata {
        let record = MetadataRecord::from_raw(&outcome.raw_info, &config.audio);
        match metadata::save_record(&config.paths.metadata_dir, &record) {
            Ok(path) => println!("  Metadata: {}", path.display()),
            Err(e) => tracing::warn!("Could not save metadata record: {}", e),
        }
    }

    Ok(())
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    bar
}

fn update_bar(bar: &ProgressBar, progress: &Progress) {
    match progress.status {
        TaskStatus::Pending => {}
        TaskStatus::Downloading => {
            bar.set_position(progress.percentage as u64);
            if let Some(rate) = &progress.rate {
                bar.set_message(rate.clone());
            }
        }
        TaskStatus::Converting => {
            bar.set_position(100);
            bar.set_message(
                progress
                    .message
                    .clone()
                    .unwrap_or_else(|| "Converting".to_string()),
            );
        }
        TaskStatus::Finished => {
            bar.finish_with_message("done");
        }
        TaskStatus::Error => {
            bar.abandon_with_message("failed");
        }
    }
}

/// Info-only batches report per-URL failures the same way downloads do.
/// Returns the number of failed URLs; a single-URL run propagates its error
/// instead.
async fn cmd_info_batch(
    config: &Config,
    urls: &[String],
    continue_on_error: bool,
) -> Result<usize> {
    let downloader = AudioDownloader::new(config.clone());
    let mut succeeded = 0usize;
    let mut failed = 0usize;

    for (index, url) in urls.iter().enumerate() {
        if urls.len() > 1 && index > 0 {
            println!();
        }

        match info_one(config, &downloader, url, false).await {
            Ok(()) => succeeded += 1,
            Err(e) => {
                if urls.len() == 1 {
                    return Err(e);
                }
                eprintln!("{} {}: {}", style("x").red().bold(), url, e);
                failed += 1;
                if !continue_on_error {
                    eprintln!("Stopping batch (use --continue-on-error to keep going)");
                    break;
                }
            }
        }
    }

    if urls.len() > 1 {
        println!(
            "\n{} {} succeeded, {} failed",
            style("Summary:").bold(),
            succeeded,
            failed
        );
    }

    Ok(failed)
}

async fn cmd_info(config: &Config, url: &str, save_info: bool) -> Result<()> {
    let downloader = AudioDownloader::new(config.clone());
    info_one(config, &downloader, url, save_info).await
}

async fn info_one(
    config: &Config,
    downloader: &AudioDownloader,
    url: &str,
    save_info: bool,
) -> Result<()> {
    let raw = downloader.video_info(url).await?;
    let record = MetadataRecord::from_raw(&raw, &config.audio);

    print_record(&record);

    if save_info {
        let path = metadata::save_record(&config.paths.metadata_dir, &record)?;
        println!("  Metadata: {}", path.display());
    }

    Ok(())
}

fn print_record(record: &MetadataRecord) {
    let video = &record.video_info;

    println!(
        "{}",
        style(video.title.as_deref().unwrap_or("Unknown title")).bold()
    );
    if let Some(uploader) = &video.uploader {
        println!("  Uploader: {}", uploader);
    }
    println!("  Duration: {}", video.duration_formatted);
    if let Some(views) = video.view_count {
        println!("  Views: {}", views);
    }
    if let Some(likes) = video.like_count {
        println!("  Likes: {}", likes);
    }
    if let Some(date) = &video.upload_date {
        println!("  Uploaded: {}", date);
    }
    if let Some(url) = &video.webpage_url {
        println!("  URL: {}", url);
    }
    println!(
        "  Estimated MP3 size: {}",
        record.computed.estimated_file_size
    );
    if !video.tags.is_empty() {
        println!("  Tags: {}", video.tags.join(", "));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WATCH_URL: &str = "https://www.youtube.com/watch?v=dQw4w9WgXcQ";

    #[test]
    fn test_collect_urls_single() {
        let urls = collect_urls(Some(WATCH_URL.to_string()), None).unwrap();
        assert_eq!(urls, vec![WATCH_URL.to_string()]);
    }

    #[test]
    fn test_collect_urls_from_file_skips_comments_and_blanks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        fs_err::write(
            &path,
            "# playlist\nhttps://youtu.be/dQw4w9WgXcQ\n\n  not-a-url  \n",
        )
        .unwrap();

        let urls = collect_urls(None, Some(path)).unwrap();
        // bad entries stay in the list; they fail per entry later
        assert_eq!(urls, vec!["https://youtu.be/dQw4w9WgXcQ", "not-a-url"]);
    }

    #[test]
    fn test_collect_urls_rejects_empty_input() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("urls.txt");
        fs_err::write(&path, "# nothing here\n").unwrap();

        assert!(collect_urls(None, Some(path)).is_err());
        assert!(collect_urls(None, None).is_err());
    }

    #[cfg(unix)]
    fn write_stub(dir: &std::path::Path, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("yt-dlp-stub.sh");
        fs_err::write(&path, body).unwrap();
        let mut perms = fs_err::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs_err::set_permissions(&path, perms).unwrap();
        path
    }

    #[cfg(unix)]
    fn stub_config(dir: &std::path::Path, stub: &std::path::Path) -> Config {
        let mut config = Config::default();
        config.paths.downloads_dir = dir.to_path_buf();
        config.paths.metadata_dir = dir.to_path_buf();
        config.ytdlp.binary = stub.to_string_lossy().into_owned();
        config
    }

    #[cfg(unix)]
    const FAILING_STUB: &str = "#!/bin/sh\necho 'ERROR: boom' >&2\nexit 1\n";

    #[cfg(unix)]
    #[tokio::test]
    async fn test_info_batch_counts_failures_with_continue_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path(), FAILING_STUB);
        let config = stub_config(dir.path(), &stub);

        let urls = vec![WATCH_URL.to_string(), WATCH_URL.to_string()];
        let failed = cmd_info_batch(&config, &urls, true).await.unwrap();
        assert_eq!(failed, 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_info_batch_stops_on_first_failure_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let stub = write_stub(dir.path(), FAILING_STUB);
        let config = stub_config(dir.path(), &stub);

        let urls = vec![WATCH_URL.to_string(), WATCH_URL.to_string()];
        let failed = cmd_info_batch(&config, &urls, false).await.unwrap();
        assert_eq!(failed, 1);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_download_batch_counts_invalid_url_as_failure() {
        let dir = tempfile::tempdir().unwrap();
        let audio_path = dir.path().join("Stub.mp3");
        fs_err::write(&audio_path, b"mp3").unwrap();

        let stub = write_stub(
            dir.path(),
            &format!(
                concat!(
                    "#!/bin/sh\n",
                    "if [ \"$1\" = \"--dump-json\" ]; then\n",
                    "  echo '{{\"id\":\"abcdefghijk\",\"title\":\"Stub\",\"duration\":10}}'\n",
                    "  exit 0\n",
                    "fi\n",
                    "echo 'download: 100.0%|NA'\n",
                    "echo '[ExtractAudio] Destination: {}'\n",
                    "exit 0\n",
                ),
                audio_path.display()
            ),
        );
        let config = stub_config(dir.path(), &stub);

        let urls = vec!["https://example.com/nope".to_string(), WATCH_URL.to_string()];
        let failed = cmd_download(&config, &urls, None, false, true, true)
            .await
            .unwrap();
        assert_eq!(failed, 1);
    }
}
