//! # Bindery CLI (`bindery`)
//!
//! ## Usage
//!
//! ```bash
//! bindery --config ./config/bindery.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bindery init` | Create the SQLite database and run schema migrations |
//! | `bindery serve` | Start the HTTP server |
//! | `bindery books` | List books with a navigation manifest |
//! | `bindery build <book>` | Sync, index and typeset one book in the foreground |
//! | `bindery builds` | List build records |
//! | `bindery logs <id>` | Print a build's log ledger |
//! | `bindery search <book> "<query>"` | Search one book |
//!
//! Log verbosity follows `RUST_LOG` (default `info`).

use bindery::{commands, config, migrate, server};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// Bindery: builds searchable PDFs from markdown book repositories.
#[derive(Parser)]
#[command(name = "bindery", version)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/bindery.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Start the HTTP server on `[server].bind`.
    Serve,

    /// List books found under `[paths].books_dir`.
    Books,

    /// Run one build in the foreground, streaming its log.
    ///
    /// Exits non-zero when the build fails.
    Build {
        /// Book id (repository name within the configured organization).
        book_id: String,

        /// Identity recorded on the build record.
        #[arg(long)]
        triggered_by: Option<String>,
    },

    /// List build records, newest first.
    Builds {
        /// Only builds of this book.
        #[arg(long)]
        book: Option<String>,

        /// Only the newest build of each book.
        #[arg(long)]
        latest: bool,
    },

    /// Print the persisted log of a build.
    Logs {
        /// Build id.
        build_id: i64,
    },

    /// Search a book's chapters.
    Search {
        book_id: String,
        query: String,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
        Commands::Books => {
            commands::run_books(&cfg).await?;
        }
        Commands::Build {
            book_id,
            triggered_by,
        } => {
            commands::run_build(&cfg, &book_id, triggered_by).await?;
        }
        Commands::Builds { book, latest } => {
            commands::run_builds(&cfg, book.as_deref(), latest).await?;
        }
        Commands::Logs { build_id } => {
            commands::run_logs(&cfg, build_id).await?;
        }
        Commands::Search { book_id, query } => {
            commands::run_search(&cfg, &book_id, &query).await?;
        }
    }

    Ok(())
}
