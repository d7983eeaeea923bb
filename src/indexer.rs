//! Full-text search index over a book's chapters.
//!
//! Each chapter in reading order becomes one [`SearchDocument`]: markdown
//! syntax is stripped, and the title comes from the first `# ` heading (or
//! the file name). The inverted index has two fields, `title` (boosted) and
//! `body`, scored with BM25 per field and summed.
//!
//! The artifact is persisted as `{output_dir}/{book_id}/search-index.json`:
//!
//! ```json
//! { "index": { ... }, "documents": [{ "id", "path", "title", "chapter" }] }
//! ```
//!
//! Readers go through [`load_or_build`], which falls back to building (and
//! caching) the artifact when none is present.

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::OnceLock;
use tracing::{debug, warn};

use crate::book;
use crate::config::Config;
use crate::models::{Book, ChapterRef, SearchDocument};
use crate::summary;

pub const TITLE_BOOST: f64 = 10.0;
pub const MAX_RESULTS: usize = 10;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

fn pattern(cell: &'static OnceLock<Regex>, re: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(re).expect("valid markdown pattern"))
}

/// Strip markdown down to searchable text.
pub fn clean_markdown(content: &str) -> String {
    static IMAGE: OnceLock<Regex> = OnceLock::new();
    static LINK: OnceLock<Regex> = OnceLock::new();
    static HEADING: OnceLock<Regex> = OnceLock::new();
    static EMPHASIS: OnceLock<Regex> = OnceLock::new();

    let text = pattern(&IMAGE, r"!\[[^\]]*\]\([^)]*\)").replace_all(content, "");
    let text = pattern(&LINK, r"\[([^\]]+)\]\([^)]*\)").replace_all(&text, "$1");
    let text = pattern(&HEADING, r"(?m)^#+\s+").replace_all(&text, "");
    let text = pattern(&EMPHASIS, r"[*_`]").replace_all(&text, "");
    text.into_owned()
}

/// First level-1 heading, else the file name without `.md`.
pub fn extract_title(content: &str, path: &str) -> String {
    static TITLE: OnceLock<Regex> = OnceLock::new();
    if let Some(caps) = pattern(&TITLE, r"(?m)^#\s+(.+?)\s*$").captures(content) {
        return caps[1].to_string();
    }
    let name = path.rsplit('/').next().unwrap_or(path);
    name.strip_suffix(".md").unwrap_or(name).to_string()
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

/// One indexed field: per-document lengths plus term postings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct FieldIndex {
    boost: f64,
    lengths: Vec<u32>,
    average_length: f64,
    /// term → [(document, term frequency)]
    postings: BTreeMap<String, Vec<(usize, u32)>>,
}

impl FieldIndex {
    fn build<'a>(boost: f64, texts: impl Iterator<Item = &'a str>) -> Self {
        let mut field = FieldIndex {
            boost,
            ..Default::default()
        };
        for (doc, text) in texts.enumerate() {
            let tokens = tokenize(text);
            field.lengths.push(tokens.len() as u32);
            let mut counts: HashMap<String, u32> = HashMap::new();
            for token in tokens {
                *counts.entry(token).or_default() += 1;
            }
            for (term, tf) in counts {
                field.postings.entry(term).or_default().push((doc, tf));
            }
        }
        for postings in field.postings.values_mut() {
            postings.sort_unstable();
        }
        let total: u64 = field.lengths.iter().map(|&l| l as u64).sum();
        field.average_length = if field.lengths.is_empty() {
            0.0
        } else {
            total as f64 / field.lengths.len() as f64
        };
        field
    }

    /// Add BM25 contributions of every term starting with `prefix`.
    fn score_prefix(&self, prefix: &str, scores: &mut HashMap<usize, f64>) {
        let n = self.lengths.len() as f64;
        for (_, postings) in self
            .postings
            .range(prefix.to_string()..)
            .take_while(|(term, _)| term.starts_with(prefix))
        {
            let df = postings.len() as f64;
            let idf = (1.0 + (n - df + 0.5) / (df + 0.5)).ln();
            for &(doc, tf) in postings {
                let tf = tf as f64;
                let len = self.lengths.get(doc).copied().unwrap_or(0) as f64;
                let norm = if self.average_length > 0.0 {
                    1.0 - BM25_B + BM25_B * len / self.average_length
                } else {
                    1.0
                };
                let score = idf * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * norm);
                *scores.entry(doc).or_default() += self.boost * score;
            }
        }
    }
}

/// Serialized inverted index over the `title` and `body` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvertedIndex {
    title: FieldIndex,
    body: FieldIndex,
}

impl InvertedIndex {
    pub fn build(documents: &[SearchDocument]) -> Self {
        Self {
            title: FieldIndex::build(TITLE_BOOST, documents.iter().map(|d| d.title.as_str())),
            body: FieldIndex::build(1.0, documents.iter().map(|d| d.content.as_str())),
        }
    }

    /// Document positions and scores, best first.
    fn query(&self, query: &str) -> Vec<(usize, f64)> {
        let mut scores = HashMap::new();
        for term in tokenize(query) {
            self.title.score_prefix(&term, &mut scores);
            self.body.score_prefix(&term, &mut scores);
        }
        let mut ranked: Vec<(usize, f64)> = scores.into_iter().collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        ranked
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub id: String,
    pub path: String,
    pub title: String,
    pub chapter: Option<String>,
}

/// The persisted search artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchArtifact {
    pub index: InvertedIndex,
    pub documents: Vec<DocumentMeta>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub path: String,
    pub title: String,
    pub score: f64,
}

impl SearchArtifact {
    pub fn build(documents: &[SearchDocument]) -> Self {
        Self {
            index: InvertedIndex::build(documents),
            documents: documents
                .iter()
                .map(|d| DocumentMeta {
                    id: d.id.clone(),
                    path: d.path.clone(),
                    title: d.title.clone(),
                    chapter: d.chapter.clone(),
                })
                .collect(),
        }
    }

    /// Prefix search over every whitespace-separated term. Top
    /// [`MAX_RESULTS`] hits; an empty query matches nothing.
    pub fn search(&self, query: &str) -> Vec<SearchHit> {
        if query.trim().is_empty() {
            return Vec::new();
        }
        self.index
            .query(query)
            .into_iter()
            .filter_map(|(doc, score)| {
                self.documents.get(doc).map(|meta| SearchHit {
                    path: meta.path.clone(),
                    title: meta.title.clone(),
                    score,
                })
            })
            .take(MAX_RESULTS)
            .collect()
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let json = serde_json::to_vec(self)?;
        // Concurrent saves (a build and an on-demand search) each get their own file.
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| book::SEARCH_INDEX_FILE.to_string());
        let tmp = path.with_file_name(format!("{}.{}.tmp", file_name, uuid::Uuid::new_v4()));
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        if let Err(e) = tokio::fs::rename(&tmp, path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(e)
                .with_context(|| format!("Failed to move index into place: {}", path.display()));
        }
        Ok(())
    }

    /// `Ok(None)` when there is no artifact at `path`.
    pub async fn load(path: &Path) -> Result<Option<Self>> {
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()))
            }
        };
        let artifact = serde_json::from_slice(&bytes)
            .with_context(|| format!("Malformed search index: {}", path.display()))?;
        Ok(Some(artifact))
    }
}

/// Read each chapter into a [`SearchDocument`]. Unreadable chapters, and
/// paths leading outside `root`, are returned separately instead of failing
/// the whole index.
pub async fn collect_documents(
    root: &Path,
    chapters: &[ChapterRef],
) -> (Vec<SearchDocument>, Vec<String>) {
    let mut documents = Vec::new();
    let mut skipped = Vec::new();
    for chapter in chapters {
        let Some(path) = book::join_within(root, &chapter.path) else {
            warn!(path = %chapter.path, "skipping chapter outside the book");
            skipped.push(chapter.path.clone());
            continue;
        };
        match tokio::fs::read_to_string(&path).await {
            Ok(content) => documents.push(SearchDocument {
                id: chapter.path.clone(),
                path: chapter.path.clone(),
                title: extract_title(&content, &chapter.path),
                chapter: chapter.chapter.clone(),
                content: clean_markdown(&content),
            }),
            Err(e) => {
                warn!(path = %chapter.path, error = %e, "skipping unreadable chapter");
                skipped.push(chapter.path.clone());
            }
        }
    }
    (documents, skipped)
}

/// Outcome of one indexing run.
#[derive(Debug, Clone)]
pub struct IndexReport {
    pub documents: usize,
    pub skipped: Vec<String>,
    pub artifact: SearchArtifact,
}

/// Build the index for `book` and persist it next to the book's output.
pub async fn index_book(config: &Config, book: &Book) -> Result<IndexReport> {
    let navigation = summary::load_navigation(&book.root_dir).await;
    let chapters = summary::flatten(&navigation);
    let (documents, skipped) = collect_documents(&book.root_dir, &chapters).await;

    let artifact = SearchArtifact::build(&documents);
    artifact
        .save(&book::search_index_path(config, &book.id))
        .await?;
    debug!(book = %book.id, documents = documents.len(), "search index written");

    Ok(IndexReport {
        documents: documents.len(),
        skipped,
        artifact,
    })
}

/// Load the persisted artifact, building it on demand when absent or unreadable.
pub async fn load_or_build(config: &Config, book: &Book) -> Result<SearchArtifact> {
    let path = book::search_index_path(config, &book.id);
    match SearchArtifact::load(&path).await {
        Ok(Some(artifact)) => return Ok(artifact),
        Ok(None) => {}
        Err(e) => warn!(error = %format!("{:#}", e), "rebuilding search index"),
    }
    Ok(index_book(config, book).await?.artifact)
}

pub async fn search(config: &Config, book: &Book, query: &str) -> Result<Vec<SearchHit>> {
    if query.trim().is_empty() {
        return Ok(Vec::new());
    }
    Ok(load_or_build(config, book).await?.search(query))
}
