//! Readability metrics computation.
//!
//! Finds every document version that has stored content but no metrics
//! snapshot yet, splits the list into contiguous batches (one per worker
//! task) and runs [`TextAnalyzer`] over each. Snapshots are write-once per
//! `(document, metrics_date)`: a second computation for the same key
//! returns the stored row unchanged, even when two workers race.
//!
//! Per-item failures are collected in [`MetricsRun::errors`] and never stop
//! the run.

use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::models::{ContentSource, DateRange, Document, HistoricalMetrics};
use crate::readability::TextAnalyzer;
use crate::store::{InsertOutcome, MetricsFilter, PendingMetrics, SqliteStore, Store};

/// Upper bound on metrics workers.
pub const MAX_WORKERS: usize = 10;

#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("invalid content: {0}")]
    InvalidInput(String),

    #[error("no analyzable content")]
    MissingContent,

    #[error("store error: {0}")]
    Store(#[from] anyhow::Error),
}

/// One successfully computed (or already present) snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsResult {
    pub success: bool,
    /// Row id of the document.
    pub document_id: String,
    /// Derived identity such as `T40CIP52`.
    pub document_key: String,
    pub title: String,
    pub content_source: Option<ContentSource>,
    /// `false` when an existing snapshot was returned.
    pub created: bool,
    pub metrics: HistoricalMetrics,
}

/// One item that could not be computed.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsFailure {
    pub document_id: String,
    pub title: String,
    pub error: String,
}

/// Aggregate outcome of [`MetricsEngine::compute_metrics`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsRun {
    pub total_processed: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub results: Vec<MetricsResult>,
    pub errors: Vec<MetricsFailure>,
}

impl MetricsRun {
    fn push(&mut self, outcome: std::result::Result<MetricsResult, MetricsFailure>) {
        self.total_processed += 1;
        match outcome {
            Ok(result) => {
                self.success_count += 1;
                self.results.push(result);
            }
            Err(failure) => {
                self.error_count += 1;
                self.errors.push(failure);
            }
        }
    }
}

/// Clamp the requested worker count to `[1, MAX_WORKERS]` and to `items`.
pub fn worker_count(requested: usize, items: usize) -> usize {
    requested.clamp(1, MAX_WORKERS).min(items.max(1))
}

/// Computes and stores metrics snapshots. Clones share the store.
#[derive(Clone)]
pub struct MetricsEngine {
    store: Arc<dyn Store>,
    analyzer: TextAnalyzer,
}

impl MetricsEngine {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            analyzer: TextAnalyzer::new(),
        }
    }

    /// Compute every pending snapshot matching `filter` on up to `workers`
    /// tasks.
    pub async fn compute_metrics(&self, filter: &MetricsFilter, workers: usize) -> Result<MetricsRun> {
        let pending = self.store.pending_metrics(filter).await?;
        let mut run = MetricsRun::default();
        if pending.is_empty() {
            info!("no documents need metrics");
            return Ok(run);
        }

        let workers = worker_count(workers, pending.len());
        let batch_size = pending.len().div_ceil(workers);
        info!(pending = pending.len(), workers, batch_size, "computing metrics");

        let mut handles = Vec::with_capacity(workers);
        for (worker_id, batch) in pending.chunks(batch_size).enumerate() {
            let engine = self.clone();
            let batch = batch.to_vec();
            let fallback: Vec<(String, String)> = batch
                .iter()
                .map(|p| (p.document.id.clone(), p.document.title.clone()))
                .collect();
            let handle = tokio::spawn(async move {
                let mut outcomes = Vec::with_capacity(batch.len());
                for item in &batch {
                    outcomes.push(engine.process_pending(item).await);
                }
                debug!(worker_id, items = outcomes.len(), "metrics worker done");
                outcomes
            });
            handles.push((handle, fallback));
        }

        for (handle, fallback) in handles {
            match handle.await {
                Ok(outcomes) => outcomes.into_iter().for_each(|o| run.push(o)),
                Err(e) => {
                    error!(error = %e, "metrics worker panicked");
                    for (document_id, title) in fallback {
                        run.push(Err(MetricsFailure {
                            document_id,
                            title,
                            error: format!("worker failed: {}", e),
                        }));
                    }
                }
            }
        }

        info!(
            total = run.total_processed,
            succeeded = run.success_count,
            failed = run.error_count,
            "metrics computation finished"
        );
        Ok(run)
    }

    async fn process_pending(
        &self,
        item: &PendingMetrics,
    ) -> std::result::Result<MetricsResult, MetricsFailure> {
        let failure = |e: MetricsError| MetricsFailure {
            document_id: item.document.id.clone(),
            title: item.document.title.clone(),
            error: e.to_string(),
        };
        let (text, source) = item
            .content
            .analyzable_text()
            .ok_or(MetricsError::MissingContent)
            .map_err(failure)?;
        let mut result = self
            .compute_for_document(&item.document, text, item.content.version_date)
            .await
            .map_err(failure)?;
        result.content_source = Some(source);
        Ok(result)
    }

    /// Compute and store the snapshot for one document version.
    ///
    /// Returns the stored row unchanged when the key already exists.
    pub async fn compute_for_document(
        &self,
        document: &Document,
        text: &str,
        metrics_date: NaiveDate,
    ) -> std::result::Result<MetricsResult, MetricsError> {
        if text.trim().is_empty() {
            return Err(MetricsError::InvalidInput(
                "content must be a non-empty string".to_string(),
            ));
        }

        let result = |metrics: HistoricalMetrics, created: bool| MetricsResult {
            success: true,
            document_id: document.id.clone(),
            document_key: document.document_id.clone(),
            title: document.title.clone(),
            content_source: None,
            created,
            metrics,
        };

        if let Some(existing) = self.store.find_metrics(&document.id, metrics_date).await? {
            return Ok(result(existing, false));
        }

        let m = self.analyzer.analyze(text);
        let snapshot = HistoricalMetrics {
            id: Uuid::new_v4().to_string(),
            document_id: document.id.clone(),
            agency_id: document.agency_id,
            metrics_date,
            word_count: m.word_count as i64,
            sentence_count: m.sentence_count as i64,
            paragraph_count: m.paragraph_count as i64,
            flesch_reading_ease: m.flesch_reading_ease,
            smog_index: m.smog_index,
            automated_readability_index: m.automated_readability_index,
            combined_score: m.combined_score,
            created_at: Utc::now().timestamp(),
        };

        Ok(match self.store.insert_metrics(&snapshot).await? {
            InsertOutcome::Inserted(row) => result(row, true),
            InsertOutcome::Existing(row) => result(row, false),
        })
    }

    /// Snapshots of one document, newest first.
    pub async fn document_metrics(
        &self,
        document_id: &str,
        range: &DateRange,
    ) -> Result<Vec<HistoricalMetrics>> {
        self.store.metrics_for_document(document_id, range).await
    }
}

/// `ecfr metrics compute`.
pub async fn run_compute(
    config: &Config,
    agency: Option<&str>,
    range: DateRange,
    workers: Option<usize>,
    limit: Option<usize>,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = compute_with_pool(&pool, config, agency, range, workers, limit).await;
    pool.close().await;
    result
}

async fn compute_with_pool(
    pool: &SqlitePool,
    config: &Config,
    agency: Option<&str>,
    range: DateRange,
    workers: Option<usize>,
    limit: Option<usize>,
) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));

    let agency_id = match agency {
        Some(slug) => match store.find_agency(slug).await? {
            Some(a) => Some(a.id),
            None => bail!("Unknown agency: '{}'", slug),
        },
        None => None,
    };
    let filter = MetricsFilter {
        agency_id,
        range,
        limit,
    };

    let engine = MetricsEngine::new(store);
    let run = engine
        .compute_metrics(&filter, workers.unwrap_or(config.metrics.workers))
        .await?;

    println!("metrics compute");
    println!("  processed: {}", run.total_processed);
    println!("  succeeded: {}", run.success_count);
    println!("  failed: {}", run.error_count);
    for failure in &run.errors {
        println!("  error: {} ({}): {}", failure.title, failure.document_id, failure.error);
    }

    Ok(())
}

/// `ecfr metrics show <document>`: accepts a row id or a derived key.
pub async fn run_show(config: &Config, document: &str, range: DateRange) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = show_with_pool(&pool, document, range).await;
    pool.close().await;
    result
}

async fn show_with_pool(pool: &SqlitePool, document: &str, range: DateRange) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));

    let documents = match store.get_document(document).await? {
        Some(d) => vec![d],
        None => store.documents_by_key(document).await?,
    };
    if documents.is_empty() {
        bail!("No document found for '{}'", document);
    }

    let engine = MetricsEngine::new(store);
    for doc in &documents {
        let snapshots = engine.document_metrics(&doc.id, &range).await?;
        println!("{}  {}  (agency {})", doc.document_id, doc.title, doc.agency_id);
        if snapshots.is_empty() {
            println!("  no metrics");
            continue;
        }
        println!(
            "  {:<10} {:>8} {:>9} {:>7} {:>8} {:>8} {:>8} {:>9}",
            "DATE", "WORDS", "SENTENCES", "PARAS", "FLESCH", "SMOG", "ARI", "COMBINED"
        );
        for m in &snapshots {
            println!(
                "  {:<10} {:>8} {:>9} {:>7} {:>8.2} {:>8.2} {:>8.2} {:>9.2}",
                m.metrics_date,
                m.word_count,
                m.sentence_count,
                m.paragraph_count,
                m.flesch_reading_ease,
                m.smog_index,
                m.automated_readability_index,
                m.combined_score
            );
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;

    fn document() -> Document {
        Document {
            id: "doc-1".to_string(),
            document_id: "T40CIP52".to_string(),
            agency_id: 1,
            title: "Title 40 Chapter I Part 52".to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }

    #[test]
    fn worker_count_is_clamped() {
        assert_eq!(worker_count(0, 5), 1);
        assert_eq!(worker_count(50, 100), MAX_WORKERS);
        assert_eq!(worker_count(5, 3), 3);
        assert_eq!(worker_count(5, 0), 1);
    }

    #[tokio::test]
    async fn blank_content_is_rejected_before_any_write() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MetricsEngine::new(store.clone());
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let err = engine
            .compute_for_document(&document(), "   ", date)
            .await
            .unwrap_err();
        assert!(matches!(err, MetricsError::InvalidInput(_)));
        assert!(store.find_metrics("doc-1", date).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_computation_returns_existing_row() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MetricsEngine::new(store);
        let date = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();

        let first = engine
            .compute_for_document(&document(), "The cat sat. The dog ran.", date)
            .await
            .unwrap();
        let second = engine
            .compute_for_document(&document(), "Completely different text here.", date)
            .await
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.metrics, second.metrics);
        assert_eq!(second.metrics.word_count, 6);
    }

    #[tokio::test]
    async fn document_metrics_newest_first() {
        let store = Arc::new(InMemoryStore::new());
        let engine = MetricsEngine::new(store);
        for day in [3, 1, 2] {
            let date = NaiveDate::from_ymd_opt(2024, 1, day).unwrap();
            engine
                .compute_for_document(&document(), "Some text.", date)
                .await
                .unwrap();
        }
        let all = engine
            .document_metrics("doc-1", &DateRange::default())
            .await
            .unwrap();
        let days: Vec<u32> = all.iter().map(|m| chrono::Datelike::day(&m.metrics_date)).collect();
        assert_eq!(days, vec![3, 2, 1]);

        let since = DateRange::new(NaiveDate::from_ymd_opt(2024, 1, 2), None);
        assert_eq!(engine.document_metrics("doc-1", &since).await.unwrap().len(), 2);
    }
}
