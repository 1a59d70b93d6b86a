//! Fetches recent B3 daily trade archives and unpacks them into the source directory.

use anyhow::{Context, Result};
use chrono::{Datelike, Days, NaiveDate, Weekday};
use hyper::body::Bytes;
use reqwest::Client;
use std::fs::{self, File};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use zip::ZipArchive;

use crate::config::DOWNLOAD_TIMEOUT;
use crate::formats::reader::TRADE_DATE_FORMAT;

/// What a download pass fetched
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DownloadSummary {
    pub days_requested: usize,
    pub days_downloaded: usize,
    pub files_extracted: usize,
}

/// The `n` most recent weekdays strictly before `today`, oldest first
pub fn last_workdays(today: NaiveDate, n: usize) -> Vec<NaiveDate> {
    let mut days = Vec::with_capacity(n);
    let mut day = today;
    while days.len() < n {
        day = match day.checked_sub_days(Days::new(1)) {
            Some(d) => d,
            None => break,
        };
        if !matches!(day.weekday(), Weekday::Sat | Weekday::Sun) {
            days.push(day);
        }
    }
    days.reverse();
    days
}

/// Download one archive per date from `base_url` and extract it into `dest_dir`.
///
/// Days without a published file, failed requests and broken archives are
/// logged and skipped; only a failure to create `dest_dir` is an error.
pub async fn download_days(
    base_url: &str,
    dates: &[NaiveDate],
    dest_dir: &Path,
) -> Result<DownloadSummary> {
    fs::create_dir_all(dest_dir)
        .with_context(|| format!("Failed to create {}", dest_dir.display()))?;

    let client = Client::builder()
        .timeout(DOWNLOAD_TIMEOUT)
        .build()
        .context("Failed to build HTTP client")?;

    let mut summary = DownloadSummary {
        days_requested: dates.len(),
        ..Default::default()
    };

    for date in dates {
        let day = date.format(TRADE_DATE_FORMAT).to_string();
        let url = format!("{}{}", base_url, day);
        info!("Downloading {}", url);

        let archive = match fetch(&client, &url).await {
            Ok(Some(bytes)) => bytes,
            Ok(None) => continue,
            Err(e) => {
                warn!("Failed to download {}: {:#}", url, e);
                continue;
            }
        };

        let dest = dest_dir.to_path_buf();
        let extracted = tokio::task::spawn_blocking(move || extract_archive(archive, &dest)).await;
        match extracted {
            Ok(Ok(files)) => {
                info!("Downloaded and extracted {} ({} files)", day, files.len());
                summary.days_downloaded += 1;
                summary.files_extracted += files.len();
            }
            Ok(Err(e)) => warn!("Failed to extract archive for {}: {:#}", day, e),
            Err(e) => warn!("Extraction for {} panicked: {}", day, e),
        }
    }

    Ok(summary)
}

/// GET `url`; `None` when the server has no file for that day
async fn fetch(client: &Client, url: &str) -> Result<Option<Bytes>> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        warn!("No file at {} (HTTP {})", url, response.status());
        return Ok(None);
    }
    Ok(Some(response.bytes().await?))
}

/// Unpack every file entry of a zip archive below `dest_dir`.
/// Entries whose names would escape `dest_dir` are skipped.
pub fn extract_archive(bytes: Bytes, dest_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut archive = ZipArchive::new(Cursor::new(bytes)).context("Not a zip archive")?;
    let mut written = Vec::new();

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        let Some(relative) = entry.enclosed_name() else {
            warn!("Skipping unsafe archive entry {}", entry.name());
            continue;
        };
        let target = dest_dir.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut out = File::create(&target)
            .with_context(|| format!("Failed to create {}", target.display()))?;
        std::io::copy(&mut entry, &mut out)
            .with_context(|| format!("Failed to write {}", target.display()))?;
        written.push(target);
    }

    Ok(written)
}
