//! Book resolution and catalogue.
//!
//! A book is a checkout under `books_dir/{id}`. An optional `book.json` may
//! move the content root (`root`), set the display `title`, and define
//! `variables` substituted into chapters as `{{ book.<name> }}`.

use anyhow::Result;
use regex::{Captures, Regex};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::OnceLock;
use tracing::warn;

use crate::config::Config;
use crate::models::Book;
use crate::summary::MANIFEST_FILE;

pub const BOOK_CONFIG_FILE: &str = "book.json";
pub const SEARCH_INDEX_FILE: &str = "search-index.json";

/// Contents of `book.json`. Every field is optional.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct BookConfig {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub root: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
}

impl BookConfig {
    /// Load `{book_dir}/book.json`; a missing or malformed file is the default.
    pub async fn load(book_dir: &Path) -> Self {
        let path = book_dir.join(BOOK_CONFIG_FILE);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(c) => c,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str(&content) {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring malformed book config");
                Self::default()
            }
        }
    }

    /// Directory the manifest and chapter paths resolve against.
    ///
    /// A `root` that is absolute or climbs out of the checkout is ignored.
    pub fn root_dir(&self, book_dir: &Path) -> PathBuf {
        match self.root.as_deref().map(str::trim) {
            Some(root) if !root.is_empty() && root != "." => {
                join_within(book_dir, root).unwrap_or_else(|| {
                    warn!(book_dir = %book_dir.display(), root, "ignoring book root outside the checkout");
                    book_dir.to_path_buf()
                })
            }
            _ => book_dir.to_path_buf(),
        }
    }

    /// Configured title, else the id with dashes turned into spaces.
    pub fn display_title(&self, book_id: &str) -> String {
        match self.title.as_deref() {
            Some(t) if !t.trim().is_empty() => t.to_string(),
            _ => book_id.replace('-', " "),
        }
    }

    /// Title handed to the typesetter: the configured title, else the id as is.
    pub fn typeset_title(&self, book_id: &str) -> String {
        match self.title.as_deref() {
            Some(t) if !t.trim().is_empty() => t.to_string(),
            _ => book_id.to_string(),
        }
    }
}

/// Join a manifest-relative path onto `root`, or `None` when the path is
/// absolute or has a `..` component.
pub fn join_within(root: &Path, relative: &str) -> Option<PathBuf> {
    let relative = Path::new(relative);
    let contained = relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    contained.then(|| root.join(relative))
}

pub fn book_dir(config: &Config, book_id: &str) -> PathBuf {
    config.paths.books_dir.join(book_id)
}

/// `{output_dir}/{book_id}`
pub fn output_dir(config: &Config, book_id: &str) -> PathBuf {
    config.paths.output_dir.join(book_id)
}

/// `{output_dir}/{book_id}/{book_id}.pdf`
pub fn pdf_path(config: &Config, book_id: &str) -> PathBuf {
    output_dir(config, book_id).join(format!("{}.pdf", book_id))
}

pub fn search_index_path(config: &Config, book_id: &str) -> PathBuf {
    output_dir(config, book_id).join(SEARCH_INDEX_FILE)
}

/// Resolve a book by id. `None` when there is no checkout.
pub async fn resolve_book(config: &Config, book_id: &str) -> Result<Option<Book>> {
    if !is_valid_book_id(book_id) {
        return Ok(None);
    }
    let dir = book_dir(config, book_id);
    if !tokio::fs::try_exists(&dir).await? {
        return Ok(None);
    }

    let book_config = BookConfig::load(&dir).await;
    let has_compiled_output = tokio::fs::try_exists(pdf_path(config, book_id)).await?;

    Ok(Some(Book {
        id: book_id.to_string(),
        title: book_config.display_title(book_id),
        root_dir: book_config.root_dir(&dir),
        has_compiled_output,
    }))
}

/// Every checkout whose resolved root holds a manifest, sorted by title.
pub async fn list_books(config: &Config) -> Result<Vec<Book>> {
    let books_dir = &config.paths.books_dir;
    if !tokio::fs::try_exists(books_dir).await? {
        return Ok(Vec::new());
    }

    let mut books = Vec::new();
    let mut entries = tokio::fs::read_dir(books_dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_dir() {
            continue;
        }
        let id = entry.file_name().to_string_lossy().to_string();
        if let Some(book) = resolve_book(config, &id).await? {
            if tokio::fs::try_exists(book.root_dir.join(MANIFEST_FILE)).await? {
                books.push(book);
            }
        }
    }

    books.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
    Ok(books)
}

/// Book ids become directory names; reject anything that could escape.
pub fn is_valid_book_id(book_id: &str) -> bool {
    !book_id.is_empty()
        && book_id != "."
        && book_id != ".."
        && book_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

fn variable_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\{\{\s*book\.(\w+)\s*\}\}").expect("valid variable pattern")
    })
}

/// Replace `{{ book.name }}` with configured values; unknown names stay as-is.
pub fn replace_variables(content: &str, variables: &BTreeMap<String, String>) -> String {
    if variables.is_empty() {
        return content.to_string();
    }
    variable_pattern()
        .replace_all(content, |caps: &Captures| match variables.get(&caps[1]) {
            Some(value) => value.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
