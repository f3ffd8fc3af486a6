//! # eCFR Harness
//!
//! Resumable ingestion of the electronic Code of Federal Regulations (eCFR)
//! with readability metrics for every stored document version.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────────┐   ┌──────────┐   ┌────────────────┐
//! │ eCFR API    │──▶│ Ingestion        │──▶│  Store   │──▶│ Metrics engine │
//! │ search/full │   │ cursor + workers │   │ (SQLite) │   │ TextAnalyzer   │
//! └─────────────┘   └──────────────────┘   └──────────┘   └────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! ecfr init                                   # create database
//! ecfr agencies refresh                       # load the agency list
//! ecfr sync environmental-protection-agency   # crawl (resumable)
//! ecfr retry-failed environmental-protection-agency
//! ecfr metrics compute --workers 4
//! ecfr metrics show T40CIP52
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | API payloads and stored records |
//! | [`corpus`] | eCFR HTTP client with retry and date recovery |
//! | [`cursor`] | Per-agency pagination cursor |
//! | [`extract`] | XML to plain text |
//! | [`readability`] | Text counters and readability formulas |
//! | [`ingest`] | Ingestion orchestrator |
//! | [`metrics`] | Metrics computation engine |
//! | [`store`] | Storage trait, SQLite and in-memory backends |
//! | [`agencies`] | Agency catalogue refresh |
//! | [`stats`] | Database overview |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod agencies;
pub mod config;
pub mod corpus;
pub mod cursor;
pub mod db;
pub mod extract;
pub mod ingest;
pub mod metrics;
pub mod migrate;
pub mod models;
pub mod progress;
pub mod readability;
pub mod stats;
pub mod store;
