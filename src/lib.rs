//! # Bindery
//!
//! Build service for markdown books: syncs a book's git repository, builds a
//! full-text search index, and typesets the chapters into one PDF, while
//! streaming every build's progress live and persisting it as an ordered log.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────┐   ┌───────────────┐   ┌──────────────┐
//! │ trigger  │──▶│ repo_sync │──▶│ indexer       │──▶│ BuildStore   │
//! │ CLI/HTTP │   │ (git)     │   │ assemble→     │   │ (SQLite)     │
//! └──────────┘   └───────────┘   │   render      │   └──────┬───────┘
//!                                └───────────────┘          │
//!                                        LogBus ◀───────────┘
//!                                          │
//!                                   SSE / CLI stream
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`summary`] | `SUMMARY.md` navigation parsing and flattening |
//! | [`book`] | Book resolution, catalogue, `book.json` |
//! | [`repo_sync`] | Clone / pull with self-healing |
//! | [`assets`] | Remote image cache and asset path rewriting |
//! | [`assemble`] | Chapter concatenation into one document |
//! | [`indexer`] | Search index build, persistence and query |
//! | [`render`] | Typesetter invocation and output capture |
//! | [`events`] | Live log distribution |
//! | [`orchestrator`] | Build sequencing |
//! | [`store`] | Build record and log persistence |
//! | [`webhook`] | Push webhook evaluation and signatures |
//! | [`server`] | HTTP API |
//! | [`commands`] | CLI command implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod assemble;
pub mod assets;
pub mod book;
pub mod commands;
pub mod config;
pub mod db;
pub mod events;
pub mod indexer;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod render;
pub mod repo_sync;
pub mod server;
pub mod store;
pub mod summary;
pub mod webhook;
