//! Remote image localization for one render job.
//!
//! [`RemoteAssetCache`] downloads every distinct remote image referenced by
//! the book's chapters into the job's `assets/` directory, at most once per
//! URL, and rewrites the markdown to point at the local copy. A failed
//! download is logged to the build ledger and the image is replaced by an
//! italic placeholder, so the render can still go ahead.

use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::{Captures, Regex};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::process::Command;

use crate::config::AssetsConfig;
use crate::events::BuildLog;

pub const ASSETS_DIR: &str = "assets";

/// Formats the typesetter accepts, plus `webp` which is converted.
const KNOWN_EXTENSIONS: &[&str] = &["webp", "png", "jpg", "jpeg", "gif", "svg"];

/// Raster format without typesetter support; converted to png.
const UNSUPPORTED_EXTENSION: &str = "webp";

/// Source of remote image bytes.
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// [`AssetFetcher`] over HTTP with a browser-like `User-Agent`.
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &AssetsConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }
}

#[async_trait]
impl AssetFetcher for HttpFetcher {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, "image/avif,image/webp,image/*,*/*;q=0.8")
            .send()
            .await
            .with_context(|| format!("request to {} failed", url))?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }
}

fn remote_image_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"!\[([^\]]*)\]\((https?://[^)\s]+)\)").expect("valid remote image pattern")
    })
}

fn image_target_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"(!\[[^\]]*\]\(|<img\s[^>]*?src=["'])([^)"'\s]+)"#)
            .expect("valid image target pattern")
    })
}

/// Local file extension for a remote URL.
///
/// An explicit `as=<format>` query hint wins, then the path's extension,
/// then `default`.
pub fn extension_for(url: &str, default: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return default.to_string();
    };

    let known = |ext: &str| {
        let ext = ext.to_ascii_lowercase();
        KNOWN_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
    };

    if let Some(hint) = parsed
        .query_pairs()
        .find(|(k, _)| k == "as")
        .and_then(|(_, v)| known(&v))
    {
        return hint;
    }

    parsed
        .path_segments()
        .and_then(|mut segments| segments.next_back())
        .and_then(|name| name.rsplit_once('.'))
        .and_then(|(_, ext)| known(ext))
        .unwrap_or_else(|| default.to_string())
}

/// True when the payload is an HTML page (error or bot challenge).
pub fn looks_like_html(bytes: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(200)]);
    let head = head.trim_start().to_ascii_lowercase();
    head.starts_with("<!doctype") || head.starts_with("<html")
}

pub fn is_valid_svg(bytes: &[u8]) -> bool {
    let head = String::from_utf8_lossy(&bytes[..bytes.len().min(200)]);
    let head = head.trim_start();
    head.starts_with("<?xml") || head.starts_with("<svg")
}

/// Italic stand-in for an image that could not be localized.
pub fn placeholder(alt: &str) -> String {
    if alt.trim().is_empty() {
        "*[Image not available]*".to_string()
    } else {
        format!("*[Image: {}]*", alt)
    }
}

/// Rewrite relative asset references so they start at `assets/`.
///
/// `../../assets/a.png`, `./assets/a.png` and `chapter/assets/a.png` all
/// become `assets/a.png`. Remote and absolute targets are untouched.
pub fn normalize_asset_paths(content: &str) -> String {
    let marker = format!("{}/", ASSETS_DIR);
    image_target_pattern()
        .replace_all(content, |caps: &Captures| {
            let target = &caps[2];
            let rewritten = if target.starts_with("http://")
                || target.starts_with("https://")
                || target.starts_with('/')
                || target.starts_with(&marker)
            {
                target
            } else {
                match target.find(&marker) {
                    Some(pos) => &target[pos..],
                    None => target,
                }
            };
            format!("{}{}", &caps[1], rewritten)
        })
        .into_owned()
}

/// Per-job map from remote URL to its localized `assets/...` path.
///
/// A URL that failed is remembered as `None` and not fetched again.
pub struct RemoteAssetCache {
    assets_dir: PathBuf,
    fetcher: Arc<dyn AssetFetcher>,
    converter: String,
    default_extension: String,
    entries: HashMap<String, Option<String>>,
    downloaded: usize,
}

impl RemoteAssetCache {
    pub fn new(assets_dir: &Path, fetcher: Arc<dyn AssetFetcher>, config: &AssetsConfig) -> Self {
        Self {
            assets_dir: assets_dir.to_path_buf(),
            fetcher,
            converter: config.converter.clone(),
            default_extension: config.default_extension.trim_start_matches('.').to_string(),
            entries: HashMap::new(),
            downloaded: 0,
        }
    }

    /// Cached local path for `url`, if it was localized.
    pub fn get(&self, url: &str) -> Option<&str> {
        self.entries.get(url).and_then(|e| e.as_deref())
    }

    /// Localize every remote image in `content` and rewrite the references.
    pub async fn rewrite(&mut self, content: &str, log: &BuildLog) -> Result<String> {
        let urls: Vec<String> = remote_image_pattern()
            .captures_iter(content)
            .map(|caps| caps[2].to_string())
            .collect();
        for url in urls {
            if !self.entries.contains_key(&url) {
                let local = self.localize(&url, log).await?;
                self.entries.insert(url, local);
            }
        }

        Ok(remote_image_pattern()
            .replace_all(content, |caps: &Captures| match self.get(&caps[2]) {
                Some(local) => format!("![{}]({})", &caps[1], local),
                None => placeholder(&caps[1]),
            })
            .into_owned())
    }

    /// Download one URL. `Ok(None)` is a logged, non-fatal failure; `Err` is
    /// reserved for ledger write errors.
    async fn localize(&mut self, url: &str, log: &BuildLog) -> Result<Option<String>> {
        let ext = extension_for(url, &self.default_extension);
        self.downloaded += 1;
        let stem = format!("remote-image-{}", self.downloaded);

        let bytes = match self.fetcher.fetch(url).await {
            Ok(bytes) => bytes,
            Err(e) => {
                log.stderr(format!("Failed to download image {}: {:#}", url, e))
                    .await?;
                return Ok(None);
            }
        };

        if looks_like_html(&bytes) {
            log.stderr(format!(
                "Downloaded HTML instead of an image from {}, skipping",
                url
            ))
            .await?;
            return Ok(None);
        }
        if ext == "svg" && !is_valid_svg(&bytes) {
            log.stderr(format!("Invalid SVG content from {}, skipping", url))
                .await?;
            return Ok(None);
        }

        let file_name = format!("{}.{}", stem, ext);
        let path = self.assets_dir.join(&file_name);
        if let Err(e) = tokio::fs::write(&path, &bytes).await {
            log.stderr(format!("Failed to save image {}: {}", url, e))
                .await?;
            return Ok(None);
        }

        if ext != UNSUPPORTED_EXTENSION {
            log.stdout(format!("Downloaded image: {}", file_name)).await?;
            return Ok(Some(format!("{}/{}", ASSETS_DIR, file_name)));
        }

        let png_name = format!("{}.png", stem);
        let png_path = self.assets_dir.join(&png_name);
        let converted = self.convert(&path, &png_path).await;
        let _ = tokio::fs::remove_file(&path).await;
        match converted {
            Ok(()) => {
                log.stdout(format!("Converted {} to {}", file_name, png_name))
                    .await?;
                Ok(Some(format!("{}/{}", ASSETS_DIR, png_name)))
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&png_path).await;
                log.stderr(format!("Failed to convert image {}: {:#}", url, e))
                    .await?;
                Ok(None)
            }
        }
    }

    async fn convert(&self, input: &Path, output: &Path) -> Result<()> {
        let result = Command::new(&self.converter)
            .arg(input)
            .arg(output)
            .output()
            .await
            .with_context(|| format!("Failed to execute '{}'", self.converter))?;
        if !result.status.success() {
            anyhow::bail!(
                "{} exited with {}: {}",
                self.converter,
                result.status,
                String::from_utf8_lossy(&result.stderr).trim()
            );
        }
        if !tokio::fs::try_exists(output).await? {
            anyhow::bail!("{} produced no output", self.converter);
        }
        Ok(())
    }
}
