//! Shared fixtures: a local git "remote" holding one book, a config that
//! points at it, and a fake image fetcher.

#![allow(dead_code)]

use anyhow::Result;
use async_trait::async_trait;
use bindery::assets::AssetFetcher;
use bindery::config::Config;
use bindery::db;
use bindery::orchestrator::Orchestrator;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;

pub const BOOK: &str = "demo-book";

/// Writes a PNG-ish payload for every URL and counts calls.
pub struct StaticFetcher {
    pub calls: AtomicUsize,
}

#[async_trait]
impl AssetFetcher for StaticFetcher {
    async fn fetch(&self, _url: &str) -> Result<Vec<u8>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(b"\x89PNG\r\n\x1a\nfake".to_vec())
    }
}

pub fn git(dir: &Path, args: &[&str]) {
    let status = Command::new("git")
        .args([
            "-c",
            "user.name=Bindery Test",
            "-c",
            "user.email=test@example.com",
            "-c",
            "init.defaultBranch=main",
        ])
        .args(args)
        .current_dir(dir)
        .status()
        .unwrap();
    assert!(status.success(), "git {:?} failed", args);
}

pub fn write_script(path: &Path, body: &str) {
    fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    let mut perms = fs::metadata(path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(path, perms).unwrap();
}

/// A remote repository `{root}/remotes/acme/demo-book.git` with three chapters.
pub fn create_origin(root: &Path) -> PathBuf {
    let origin = root.join("remotes/acme").join(format!("{}.git", BOOK));
    fs::create_dir_all(origin.join("chapters")).unwrap();
    fs::create_dir_all(origin.join("assets")).unwrap();

    fs::write(
        origin.join("SUMMARY.md"),
        "# Summary\n\n* [Readme](README.md)\n\n## Basics\n* [Ownership](chapters/ownership.md)\n  * [Borrowing](chapters/borrowing.md)\n* [Ghost](chapters/ghost.md)\n",
    )
    .unwrap();
    fs::write(origin.join("README.md"), "# Demo Book\n\nWelcome to {{ book.edition }}.\n").unwrap();
    fs::write(
        origin.join("chapters/ownership.md"),
        "# Ownership\n\nEvery value has an owner.\n\n![diagram](../assets/owner.png)\n![remote](https://img.example.com/a.png)\n",
    )
    .unwrap();
    fs::write(
        origin.join("chapters/borrowing.md"),
        "# Borrowing\n\nReferences borrow values.\n\n![remote again](https://img.example.com/a.png)\n",
    )
    .unwrap();
    fs::write(origin.join("assets/owner.png"), b"png").unwrap();
    fs::write(
        origin.join("book.json"),
        r#"{"title": "The Demo Book", "variables": {"edition": "the second edition"}}"#,
    )
    .unwrap();

    git(&origin, &["init", "-q"]);
    git(&origin, &["add", "."]);
    git(&origin, &["commit", "-q", "-m", "initial"]);
    origin
}

/// Config pointing at the local remotes and a typesetter script.
pub fn config_for(root: &Path, typesetter: &Path) -> Config {
    let text = format!(
        r#"
[db]
path = "{root}/data/bindery.sqlite"

[server]
bind = "127.0.0.1:0"

[paths]
books_dir = "{root}/books"
output_dir = "{root}/static"
work_dir = "{root}/work"

[source]
organization = "acme"
base_url = "{root}/remotes"

[typesetter]
program = "{typesetter}"

[assets]
converter = "cp"
"#,
        root = root.display(),
        typesetter = typesetter.display()
    );
    let config: Config = toml::from_str(&text).unwrap();
    bindery::config::validate(&config).unwrap();
    config
}

pub async fn setup(typesetter_body: &str) -> (TempDir, Arc<Orchestrator>, Arc<StaticFetcher>) {
    let tmp = TempDir::new().unwrap();
    create_origin(tmp.path());
    let script = tmp.path().join("typeset.sh");
    write_script(&script, typesetter_body);
    fs::create_dir_all(tmp.path().join("work")).unwrap();

    let config = Arc::new(config_for(tmp.path(), &script));
    let store = db::open_store(&config).await.unwrap();
    let fetcher = Arc::new(StaticFetcher {
        calls: AtomicUsize::new(0),
    });
    let orchestrator = Orchestrator::new(config, store, fetcher.clone());
    (tmp, orchestrator, fetcher)
}

/// Copies the combined document to the output; warns on stderr; exits 3.
pub const WARNING_TYPESETTER: &str = r#"echo "typesetting $1"
echo "[WARNING] Missing character" >&2
printf 'no trailing newline'
cp "$1" "$3"
exit 3"#;

pub const FAILING_TYPESETTER: &str = r#"echo "Error producing PDF." >&2
exit 43"#;
