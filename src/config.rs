use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub server: ServerConfig,
    pub paths: PathsConfig,
    pub source: SourceConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub typesetter: TypesetterConfig,
    #[serde(default)]
    pub assets: AssetsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

/// Filesystem roots used by the build pipeline.
#[derive(Debug, Deserialize, Clone)]
pub struct PathsConfig {
    /// Where book checkouts live (`{books_dir}/{book_id}`).
    pub books_dir: PathBuf,
    /// Published output root (`{output_dir}/{book_id}/{book_id}.pdf`).
    pub output_dir: PathBuf,
    /// Parent of the isolated per-build working directories.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,
}

fn default_work_dir() -> PathBuf {
    std::env::temp_dir()
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    /// Organization whose repositories may be built.
    pub organization: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
}

fn default_base_url() -> String {
    "https://github.com".to_string()
}

impl SourceConfig {
    /// Clone URL for a logical book id: `{base_url}/{organization}/{book_id}.git`.
    pub fn repo_url(&self, book_id: &str) -> String {
        format!(
            "{}/{}/{}.git",
            self.base_url.trim_end_matches('/'),
            self.organization,
            book_id
        )
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct WebhookConfig {
    /// Shared secret for `X-Hub-Signature-256` verification. Unset disables it.
    #[serde(default)]
    pub secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GitConfig {
    #[serde(default = "default_git_program")]
    pub program: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            program: default_git_program(),
        }
    }
}

fn default_git_program() -> String {
    "git".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct TypesetterConfig {
    #[serde(default = "default_typesetter_program")]
    pub program: String,
    #[serde(default = "default_pdf_engine")]
    pub pdf_engine: Option<String>,
    #[serde(default = "default_toc_depth")]
    pub toc_depth: u32,
    /// Appended verbatim after the generated arguments.
    #[serde(default)]
    pub extra_args: Vec<String>,
    /// Passed as `-V key=value` pairs.
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl Default for TypesetterConfig {
    fn default() -> Self {
        Self {
            program: default_typesetter_program(),
            pdf_engine: default_pdf_engine(),
            toc_depth: default_toc_depth(),
            extra_args: Vec::new(),
            variables: BTreeMap::new(),
        }
    }
}

fn default_typesetter_program() -> String {
    "pandoc".to_string()
}
fn default_pdf_engine() -> Option<String> {
    Some("xelatex".to_string())
}
fn default_toc_depth() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct AssetsConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Raster converter invoked as `{converter} <input> <output>`.
    #[serde(default = "default_converter")]
    pub converter: String,
    #[serde(default = "default_extension")]
    pub default_extension: String,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            converter: default_converter(),
            default_extension: default_extension(),
        }
    }
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_converter() -> String {
    "convert".to_string()
}
fn default_extension() -> String {
    "png".to_string()
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.source.organization.trim().is_empty() {
        anyhow::bail!("source.organization must not be empty");
    }

    if config.typesetter.toc_depth == 0 {
        anyhow::bail!("typesetter.toc_depth must be >= 1");
    }

    if config.assets.timeout_secs == 0 {
        anyhow::bail!("assets.timeout_secs must be >= 1");
    }

    for (name, program) in [
        ("git.program", &config.git.program),
        ("typesetter.program", &config.typesetter.program),
        ("assets.converter", &config.assets.converter),
    ] {
        if program.trim().is_empty() {
            anyhow::bail!("{} must not be empty", name);
        }
    }

    let ext = config.assets.default_extension.trim_start_matches('.');
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        anyhow::bail!(
            "assets.default_extension '{}' is not a file extension",
            config.assets.default_extension
        );
    }

    Ok(())
}
