//! # Code Recall
//!
//! A per-workspace semantic code index. Source trees are crawled, split
//! into overlapping line chunks, embedded, and stored in one SQLite file
//! per workspace; queries return chunks ranked by meaning.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌───────────┐   ┌──────────────┐
//! │  Crawl   │──▶│  Index   │──▶│  Embed    │──▶│   SQLite     │
//! │ + ignore │   │ chunk+tx │   │ queue     │   │ per workspace│
//! └──────────┘   └──────────┘   └───────────┘   └──────┬───────┘
//!                                                      │
//!                      ┌───────────────────────────────┤
//!                      ▼                               ▼
//!                ┌───────────┐                  ┌─────────────┐
//!                │  Vector   │─────────────────▶│  Ranking    │
//!                │  search   │                  │  composite  │
//!                └───────────┘                  └─────────────┘
//! ```
//!
//! [`engine::Engine`] ties the stages together and enforces the lifecycle:
//! pause/resume, rebuild, vector backfill, budgets and debounced watcher
//! flushes.
//!
//! ## Quick Start
//!
//! ```bash
//! recall --config recall.toml index my-ws ~/src/project
//! recall --config recall.toml query my-ws "parse the config file"
//! recall --config recall.toml status my-ws
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Storage error taxonomy |
//! | [`db`] | Store handle, transactions, busy retries |
//! | [`schema`] | Schema creation and migrations |
//! | [`crawl`] | Workspace walk, ignore rules, reconciliation |
//! | [`chunk`] | Line-window chunking |
//! | [`indexer`] | Incremental, transactional indexing |
//! | [`embedding`] | Embedding runtimes with a hash fallback |
//! | [`embed_queue`] | Stale-chunk embedding queue |
//! | [`vector_search`] | Native and linear-scan nearest neighbours |
//! | [`ranking`] | Composite scoring |
//! | [`backfill`] | Legacy vector conversion |
//! | [`control`] | Lifecycle state and concurrency guards |
//! | [`scheduler`] | Debounced one-shot tasks |
//! | [`engine`] | Public engine API |
//! | [`models`] | Shared data types |

pub mod backfill;
pub mod chunk;
pub mod config;
pub mod control;
pub mod crawl;
pub mod db;
pub mod embed_queue;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod indexer;
pub mod models;
pub mod ranking;
pub mod scheduler;
pub mod schema;
pub mod vector_search;
