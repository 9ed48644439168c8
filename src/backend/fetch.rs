use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::ProgressBar;
use log::{debug, info, warn};

use super::{FetchError, Fetcher};
use crate::metrics;
use crate::utils::pb_style;

/// HTTP image acquisition with content-hash deduplication. Files are named
/// after a prefix of their blake3 hash, so refetching an already acquired
/// image is a no-op even across pipeline stages.
pub struct FileFetcher {
    timeout: Duration,
}

impl FileFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Fetcher for FileFetcher {
    fn fetch_all(
        &self,
        urls: &[String],
        dest: &Path,
    ) -> Result<Vec<(String, PathBuf)>, FetchError> {
        fs::create_dir_all(dest)?;

        // Seed the dedup set from files already in the destination.
        let mut seen = HashSet::new();
        for entry in fs::read_dir(dest)? {
            let path = entry?.path();
            if path.is_file() {
                seen.insert(blake3::hash(&fs::read(&path)?));
            }
        }

        let client = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        let pb = ProgressBar::new(urls.len() as u64).with_style(pb_style());
        let mut fetched = Vec::new();
        for url in urls {
            match fetch_one(&client, url, dest, &mut seen) {
                Ok(Some(path)) => fetched.push((url.clone(), path)),
                Ok(None) => debug!("skipping duplicate content from {url}"),
                Err(e) => {
                    metrics::inc_fetch_failure();
                    warn!("failed to fetch {url}: {e}");
                }
            }
            pb.inc(1);
        }
        pb.finish_and_clear();

        info!("fetched {} of {} urls into {}", fetched.len(), urls.len(), dest.display());
        Ok(fetched)
    }
}

fn fetch_one(
    client: &reqwest::blocking::Client,
    url: &str,
    dest: &Path,
    seen: &mut HashSet<blake3::Hash>,
) -> Result<Option<PathBuf>, String> {
    let response = client.get(url).send().map_err(|e| e.to_string())?;
    let status = response.status();
    if !status.is_success() {
        return Err(format!("HTTP {status}"));
    }
    let bytes = response.bytes().map_err(|e| e.to_string())?;
    if bytes.is_empty() {
        return Err("empty response body".to_string());
    }

    let hash = blake3::hash(&bytes);
    if !seen.insert(hash) {
        return Ok(None);
    }

    let name = format!("{}.{}", &hash.to_hex()[..16], extension_for(url));
    let path = dest.join(name);
    fs::write(&path, &bytes).map_err(|e| e.to_string())?;
    Ok(Some(path))
}

fn extension_for(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url);
    match path.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "png",
        Some("webp") => "webp",
        Some("gif") => "gif",
        Some("bmp") => "bmp",
        _ => "jpg",
    }
}
