//! # Maintenance Intelligence
//!
//! Turns free-text maintenance records into structured, searchable failure
//! intelligence while keeping calls to paid AI services to a minimum.
//!
//! Documents are fingerprinted and extracted once per distinct text and
//! extractor version. Failure descriptions are filtered, deduplicated and
//! batched before embedding. Embedded failures are searchable by
//! similarity and clustered into recurring patterns.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌───────────────┐   ┌─────────────┐
//! │ Document │──▶│ Orchestrator  │──▶│ Extraction  │
//! │  (text)  │   │ fingerprint + │◀──│   Cache     │
//! └──────────┘   │ retry/backoff │   └─────────────┘
//!                └──────┬────────┘
//!                       │ failure events
//!                       ▼
//!                ┌───────────────┐   ┌─────────────┐   ┌──────────────┐
//!                │   Batcher     │──▶│ Similarity  │──▶│   Pattern    │
//!                │ filter/dedup/ │   │   Index     │   │  Detector    │
//!                │ batch/dispatch│   │  (SQLite)   │   │ (union-find) │
//!                └───────────────┘   └─────────────┘   └──────────────┘
//!                        every external call ─▶ CostLedger
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! mintel init                                   # create database
//! mintel ingest records/*.txt --plant north-mill
//! mintel search "bearing overheating" --limit 5
//! mintel patterns detect --days 90
//! mintel costs                                  # spend and avoided calls
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing and validation |
//! | [`models`] | Documents, extractions, failure events and patterns |
//! | [`error`] | Service and per-item failure taxonomy |
//! | [`fingerprint`] | Normalized content digests |
//! | [`ledger`] | Cost accounting and throttle tiers |
//! | [`cache`] | Extraction cache keyed by fingerprint and extractor version |
//! | [`extractor`] | Structured extraction service clients |
//! | [`orchestrator`] | Cache-first extraction with retry and validation |
//! | [`embedding`] | Embedding service clients and vector utilities |
//! | [`batcher`] | Filtering, dedup and bounded batch dispatch |
//! | [`store`] | Persistence trait with SQLite and in-memory backends |
//! | [`index`] | Nearest-neighbour queries over failure vectors |
//! | [`patterns`] | Similarity clustering and the periodic runner |
//! | [`pipeline`] | Document worker pool and retry entry point |
//! | [`commands`] | `mintel` subcommand implementations |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema creation |

pub mod batcher;
pub mod cache;
pub mod commands;
pub mod config;
pub mod db;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod fingerprint;
pub mod index;
pub mod ledger;
pub mod migrate;
pub mod models;
pub mod orchestrator;
pub mod patterns;
pub mod pipeline;
pub mod store;
