//! Navigation manifest (`SUMMARY.md`) parsing.
//!
//! The manifest is a constrained markdown outline:
//!
//! ```text
//! # Summary
//!
//! ## Part 1
//! * [Intro](a.md)
//!   * [Details](sub/b.md)
//! ```
//!
//! `##` lines open a header group, bulleted links are content items nested by
//! indentation ([`INDENT_WIDTH`] spaces per level), so `Details` above is a
//! child of `Intro`. Items at the same indentation are siblings. Anything
//! else is skipped.
//! The parsed tree always starts with a single introduction node pointing at
//! [`ROOT_DOCUMENT`].

use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;

use crate::models::{ChapterRef, ContentNode};

pub const MANIFEST_FILE: &str = "SUMMARY.md";
pub const ROOT_DOCUMENT: &str = "README.md";
pub const INTRODUCTION_TITLE: &str = "Introduction";
pub const INDENT_WIDTH: usize = 2;

fn item_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[*-]\s+\[([^\]]+)\]\(([^)]+)\)\s*$").expect("valid item pattern")
    })
}

fn header_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"^##\s+(.+?)\s*$").expect("valid header pattern"))
}

/// Where a finished top-level item lands: the root list or the current header.
struct Target {
    roots: Vec<ContentNode>,
    header: Option<ContentNode>,
}

impl Target {
    fn attach(&mut self, node: ContentNode) {
        match self.header.as_mut() {
            Some(header) => header.children.push(node),
            None => self.roots.push(node),
        }
    }

    fn close_header(&mut self) {
        if let Some(header) = self.header.take() {
            self.roots.push(header);
        }
    }
}

/// Pop every stack entry with `level >= min_level`, attaching each to the
/// entry below it (or to the target when the stack empties).
fn unwind(stack: &mut Vec<(usize, ContentNode)>, target: &mut Target, min_level: usize) {
    while stack.last().is_some_and(|(level, _)| *level >= min_level) {
        let Some((_, node)) = stack.pop() else { break };
        match stack.last_mut() {
            Some((_, parent)) => parent.children.push(node),
            None => target.attach(node),
        }
    }
}

fn indent_level(line: &str) -> usize {
    let width: usize = line
        .chars()
        .take_while(|c| c.is_whitespace())
        .map(|c| if c == '\t' { INDENT_WIDTH } else { 1 })
        .sum();
    width / INDENT_WIDTH
}

/// Parse manifest text into the ordered navigation tree.
pub fn parse_summary(content: &str) -> Vec<ContentNode> {
    let mut target = Target {
        roots: Vec::new(),
        header: None,
    };
    let mut stack: Vec<(usize, ContentNode)> = Vec::new();

    for raw in content.lines() {
        let trimmed = raw.trim();
        if trimmed.is_empty() || (trimmed.starts_with("# ") && !trimmed.starts_with("##")) {
            continue;
        }

        if let Some(caps) = header_pattern().captures(trimmed) {
            unwind(&mut stack, &mut target, 0);
            target.close_header();
            target.header = Some(ContentNode::header(&caps[1]));
            continue;
        }

        if let Some(caps) = item_pattern().captures(trimmed) {
            let path = caps[2].trim();
            if path.is_empty() {
                continue;
            }
            let level = indent_level(raw);
            unwind(&mut stack, &mut target, level);
            stack.push((level, ContentNode::item(&caps[1], path)));
        }
    }

    unwind(&mut stack, &mut target, 0);
    target.close_header();

    let mut items = target.roots;
    remove_root_document(&mut items);
    items.insert(0, ContentNode::item(INTRODUCTION_TITLE, ROOT_DOCUMENT));
    items
}

/// Drop nodes pointing at the root document; their children take their place.
fn remove_root_document(nodes: &mut Vec<ContentNode>) {
    let mut i = 0;
    while i < nodes.len() {
        if nodes[i].path.as_deref() == Some(ROOT_DOCUMENT) {
            let removed = nodes.remove(i);
            for (offset, child) in removed.children.into_iter().enumerate() {
                nodes.insert(i + offset, child);
            }
        } else {
            remove_root_document(&mut nodes[i].children);
            i += 1;
        }
    }
}

/// Read and parse `{book_root}/SUMMARY.md`.
///
/// An unreadable manifest yields an empty tree; callers treat that as
/// "no navigable content".
pub async fn load_navigation(book_root: &Path) -> Vec<ContentNode> {
    let manifest = book_root.join(MANIFEST_FILE);
    match tokio::fs::read_to_string(&manifest).await {
        Ok(content) => parse_summary(&content),
        Err(e) => {
            warn!(path = %manifest.display(), error = %e, "failed to read navigation manifest");
            Vec::new()
        }
    }
}

/// Pre-order traversal into `(path, chapter)` pairs.
///
/// This is the canonical reading order for indexing and assembly.
pub fn flatten(nodes: &[ContentNode]) -> Vec<ChapterRef> {
    fn walk(nodes: &[ContentNode], chapter: Option<&str>, top: bool, out: &mut Vec<ChapterRef>) {
        for node in nodes {
            let own_chapter = if node.is_header || (top && chapter.is_none()) {
                Some(node.title.as_str())
            } else {
                chapter
            };
            if let Some(path) = &node.path {
                let chapter = if node.path.as_deref() == Some(ROOT_DOCUMENT) && top {
                    None
                } else {
                    own_chapter
                };
                out.push(ChapterRef {
                    path: path.clone(),
                    chapter: chapter.map(str::to_string),
                });
            }
            walk(&node.children, own_chapter, false, out);
        }
    }

    let mut out = Vec::new();
    walk(nodes, None, true, &mut out);
    out
}

/// Flattened paths only.
pub fn file_paths(nodes: &[ContentNode]) -> Vec<String> {
    flatten(nodes).into_iter().map(|c| c.path).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn depth(nodes: &[ContentNode]) -> usize {
        nodes
            .iter()
            .map(|n| 1 + depth(&n.children))
            .max()
            .unwrap_or(0)
    }

    #[test]
    fn indented_item_nests_under_previous_item() {
        let manifest = "# Summary\n\n## Part 1\n* [Intro](a.md)\n  * [Details](sub/b.md)\n";
        let tree = parse_summary(manifest);

        assert_eq!(tree.len(), 2);
        assert_eq!(tree[0], ContentNode::item(INTRODUCTION_TITLE, ROOT_DOCUMENT));

        let part = &tree[1];
        assert!(part.is_header);
        assert_eq!(part.title, "Part 1");
        assert_eq!(part.path, None);
        assert_eq!(part.children.len(), 1);

        let intro = &part.children[0];
        assert_eq!(intro.title, "Intro");
        assert_eq!(intro.path.as_deref(), Some("a.md"));
        assert_eq!(intro.children, vec![ContentNode::item("Details", "sub/b.md")]);
    }

    #[test]
    fn same_indent_items_are_header_siblings() {
        let manifest = "## Part 1\n* [Intro](a.md)\n* [Details](sub/b.md)\n";
        let tree = parse_summary(manifest);

        let part = &tree[1];
        assert!(part.is_header);
        assert_eq!(
            part.children,
            vec![
                ContentNode::item("Intro", "a.md"),
                ContentNode::item("Details", "sub/b.md"),
            ]
        );
    }

    #[test]
    fn paths_with_spaces_are_kept() {
        let manifest = "* [Setup](getting started/setup guide.md )\n* [Empty]( )\n";
        let paths = file_paths(&parse_summary(manifest));
        assert_eq!(paths, vec!["README.md", "getting started/setup guide.md"]);
    }

    #[test]
    fn no_headers_gives_plain_list() {
        let manifest = "* [One](1.md)\n* [Two](2.md)\n  * [Two A](2a.md)\n* [Three](3.md)\n";
        let tree = parse_summary(manifest);

        let titles: Vec<&str> = tree.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(titles, vec![INTRODUCTION_TITLE, "One", "Two", "Three"]);
        assert!(tree.iter().all(|n| !n.is_header));
        assert_eq!(tree[2].children[0].path.as_deref(), Some("2a.md"));
    }

    #[test]
    fn root_document_appears_once_and_first() {
        let manifest = "## Start\n* [Readme](README.md)\n* [Next](next.md)\n  * [Again](README.md)\n";
        let tree = parse_summary(manifest);
        let paths = file_paths(&tree);

        assert_eq!(paths.first().map(String::as_str), Some(ROOT_DOCUMENT));
        assert_eq!(paths.iter().filter(|p| *p == ROOT_DOCUMENT).count(), 1);
        assert_eq!(paths, vec!["README.md", "next.md"]);
    }

    #[test]
    fn removed_root_document_keeps_its_children() {
        let manifest = "* [Readme](README.md)\n  * [Child](child.md)\n* [Other](other.md)\n";
        let paths = file_paths(&parse_summary(manifest));
        assert_eq!(paths, vec!["README.md", "child.md", "other.md"]);
    }

    #[test]
    fn depth_matches_indentation_levels() {
        let manifest = "* [L1](1.md)\n  * [L2](2.md)\n    * [L3](3.md)\n      * [L4](4.md)\n  * [L2b](2b.md)\n";
        let tree = parse_summary(manifest);
        // Skip the synthetic introduction node, which is a leaf.
        assert_eq!(depth(&tree[1..]), 4);
        let l1 = &tree[1];
        let child_titles: Vec<&str> = l1.children.iter().map(|n| n.title.as_str()).collect();
        assert_eq!(child_titles, vec!["L2", "L2b"]);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let manifest = "# Summary\nsome prose\n* not a link\n* [Ok](ok.md)\n*[bad](x.md)\n### deeper\n";
        let paths = file_paths(&parse_summary(manifest));
        assert_eq!(paths, vec!["README.md", "ok.md"]);
    }

    #[test]
    fn new_header_resets_nesting() {
        let manifest = "## A\n* [One](1.md)\n  * [Deep](d.md)\n## B\n  * [Orphan](o.md)\n";
        let tree = parse_summary(manifest);
        assert_eq!(tree.len(), 3);
        assert_eq!(tree[1].children.len(), 1);
        assert_eq!(tree[2].title, "B");
        assert_eq!(tree[2].children[0].path.as_deref(), Some("o.md"));
    }

    #[test]
    fn flatten_attributes_chapters() {
        let manifest = "## Basics\n* [Intro](a.md)\n  * [Details](b.md)\n";
        let flat = flatten(&parse_summary(manifest));
        assert_eq!(
            flat,
            vec![
                ChapterRef {
                    path: "README.md".to_string(),
                    chapter: None
                },
                ChapterRef {
                    path: "a.md".to_string(),
                    chapter: Some("Basics".to_string())
                },
                ChapterRef {
                    path: "b.md".to_string(),
                    chapter: Some("Basics".to_string())
                },
            ]
        );

        let flat = flatten(&parse_summary("* [Guide](g.md)\n  * [Step](s.md)\n"));
        assert_eq!(flat[1].chapter.as_deref(), Some("Guide"));
        assert_eq!(flat[2].chapter.as_deref(), Some("Guide"));
    }

    #[tokio::test]
    async fn missing_manifest_is_empty_tree() {
        let tmp = tempfile::TempDir::new().unwrap();
        assert!(load_navigation(tmp.path()).await.is_empty());
    }
}
