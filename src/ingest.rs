//! Ingestion pipeline orchestration.
//!
//! Coordinates the crawl of one agency: count → search page by page →
//! upsert descriptors → fetch content → store it once per version →
//! materialize documents. Progress is tracked by a [`FetchProgress`]
//! cursor so an interrupted run resumes at the first page it did not
//! finish.
//!
//! # Modes
//!
//! - **Sequential**: pages in order; the cursor advances after each page's
//!   writes are stored.
//! - **Concurrent**: the remaining pages are split into contiguous ranges,
//!   one per worker task. The cursor jumps to the end only once every
//!   worker finished every page; otherwise it stays where it was and the
//!   next run repeats the range (the write-once tables absorb the repeats).
//!
//! A page that comes back empty before the last page means the search
//! request soft-failed. The run stops there without advancing so a later
//! resume retries it. An empty last page is finished as is: the count
//! promised more results than the search serves, and waiting on it would
//! stall the cursor.
//!
//! Per-descriptor content failures never abort a page: the descriptor is
//! marked as errored and picked up by [`IngestionOrchestrator::retry_failed`].
//! Store failures do abort the page, which is then not advanced past.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{Config, IngestConfig};
use crate::corpus::{ContentFetch, ContentLocator, CorpusClient, CorpusSource};
use crate::cursor::{FetchProgress, StartRequest};
use crate::db;
use crate::extract::extract_xml_text;
use crate::models::{Agency, DateRange, DocumentContent, ProcessingStatus, SearchDescriptor};
use crate::progress::{NoProgress, ProgressMode, SyncProgressEvent, SyncProgressReporter};
use crate::store::{InsertOutcome, SqliteStore, Store};

/// Caller-tunable knobs for one crawl.
#[derive(Debug, Clone)]
pub struct IngestOptions {
    pub per_page: u32,
    pub workers: usize,
    pub target_year: Option<i32>,
    pub start_page: Option<u32>,
    pub reset: bool,
    /// Explicit bounds; each one overrides the matching year bound.
    pub range: DateRange,
    pub concurrent: bool,
}

impl IngestOptions {
    pub fn from_config(config: &IngestConfig) -> Self {
        Self {
            per_page: config.per_page,
            workers: config.workers,
            target_year: None,
            start_page: None,
            reset: false,
            range: DateRange::default(),
            concurrent: false,
        }
    }
}

/// Outcome of a crawl or retry pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct IngestSummary {
    pub agency: String,
    pub total_count: u64,
    pub pages_processed: u32,
    pub descriptors_seen: u64,
    pub contents_added: u64,
    pub contents_skipped: u64,
    pub documents_created: u64,
    /// Descriptors whose hierarchy lacks a title or chapter.
    pub not_fetchable: u64,
    pub failed: u64,
    pub complete: bool,
    pub cancelled: bool,
}

impl IngestSummary {
    fn for_agency(agency: &str) -> Self {
        Self {
            agency: agency.to_string(),
            ..Default::default()
        }
    }

    fn absorb(&mut self, other: &IngestSummary) {
        self.pages_processed += other.pages_processed;
        self.descriptors_seen += other.descriptors_seen;
        self.contents_added += other.contents_added;
        self.contents_skipped += other.contents_skipped;
        self.documents_created += other.documents_created;
        self.not_fetchable += other.not_fetchable;
        self.failed += other.failed;
        self.cancelled |= other.cancelled;
    }
}

enum PageOutcome {
    Done(IngestSummary),
    /// Search soft-failed; nothing was written.
    Empty,
    /// Cancelled between items; partial counts, page not finished.
    Cancelled(IngestSummary),
}

struct WorkerReport {
    summary: IngestSummary,
    unfinished_pages: Vec<u32>,
}

/// Drives the crawl. Cheap to clone; clones share the store, the corpus
/// source, the reporter and the cancellation token.
#[derive(Clone)]
pub struct IngestionOrchestrator {
    store: Arc<dyn Store>,
    corpus: Arc<dyn CorpusSource>,
    reporter: Arc<dyn SyncProgressReporter>,
    cancel: CancellationToken,
}

impl IngestionOrchestrator {
    pub fn new(store: Arc<dyn Store>, corpus: Arc<dyn CorpusSource>) -> Self {
        Self {
            store,
            corpus,
            reporter: Arc::new(NoProgress),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn SyncProgressReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    async fn require_agency(&self, slug: &str) -> Result<Agency> {
        match self.store.find_agency(slug).await? {
            Some(agency) => Ok(agency),
            None => bail!(
                "Unknown agency: '{}'. Run `ecfr agencies refresh` to load the agency list.",
                slug
            ),
        }
    }

    /// Start a crawl for `agency_slug`, or resume the one in progress.
    pub async fn start_or_resume(
        &self,
        agency_slug: &str,
        opts: &IngestOptions,
    ) -> Result<IngestSummary> {
        if opts.per_page == 0 {
            bail!("per_page must be >= 1");
        }
        let agency = self.require_agency(agency_slug).await?;
        let mut summary = IngestSummary::for_agency(&agency.slug);

        let existing = self.store.get_progress(agency.id).await?;
        if let Some(done) = existing.as_ref().filter(|p| p.is_complete() && !opts.reset) {
            info!(agency = %agency.slug, pages = done.current_page, "crawl already complete");
            summary.total_count = done.total_count;
            summary.complete = true;
            return Ok(summary);
        }

        let stored_year = existing
            .as_ref()
            .filter(|_| !opts.reset)
            .and_then(|p| p.target_year);
        let target_year = opts.target_year.or(stored_year);
        let range = effective_range(&opts.range, target_year);

        self.reporter.report(SyncProgressEvent::Counting {
            agency: agency.slug.clone(),
        });
        let total_count = self.corpus.get_count(&agency.slug, &range).await;
        if total_count == 0 {
            warn!(agency = %agency.slug, "corpus reports no results; nothing to crawl");
            return Ok(summary);
        }
        summary.total_count = total_count;

        let request = StartRequest {
            total_count,
            per_page: opts.per_page,
            start_page: opts.start_page,
            target_year,
            reset: opts.reset,
        };
        let mut progress = FetchProgress::start_or_resume(existing, agency.id, &request, now());
        self.store.save_progress(&progress).await?;

        info!(
            agency = %agency.slug,
            total = total_count,
            pages = progress.total_pages(),
            from_page = progress.current_page,
            year = ?target_year,
            concurrent = opts.concurrent,
            "starting crawl"
        );

        if opts.concurrent && opts.workers > 1 {
            self.run_concurrent(&agency, &mut progress, opts.workers, &range, &mut summary)
                .await?;
        } else {
            self.run_sequential(&agency, &mut progress, &range, &mut summary)
                .await?;
        }

        summary.complete = progress.is_complete();
        Ok(summary)
    }

    async fn run_sequential(
        &self,
        agency: &Agency,
        progress: &mut FetchProgress,
        range: &DateRange,
        summary: &mut IngestSummary,
    ) -> Result<()> {
        let total_pages = progress.total_pages();
        if progress.remaining_pages().is_empty() {
            progress.complete(now());
            return self.store.save_progress(progress).await;
        }
        for page in progress.remaining_pages() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            let outcome = self
                .process_page(agency, page, progress.per_page, total_pages, range)
                .await
                .with_context(|| format!("page {} failed; progress not advanced", page))?;

            match outcome {
                PageOutcome::Done(page_summary) => {
                    summary.absorb(&page_summary);
                    progress.advance(now());
                    self.store.save_progress(progress).await?;
                    self.reporter.report(SyncProgressEvent::Page {
                        agency: agency.slug.clone(),
                        page: page + 1,
                        total_pages,
                        descriptors: page_summary.descriptors_seen,
                    });
                }
                PageOutcome::Empty => {
                    warn!(agency = %agency.slug, page, "page came back empty; stopping for a later resume");
                    break;
                }
                PageOutcome::Cancelled(partial) => {
                    summary.absorb(&partial);
                    summary.cancelled = true;
                    break;
                }
            }
        }
        Ok(())
    }

    async fn run_concurrent(
        &self,
        agency: &Agency,
        progress: &mut FetchProgress,
        workers: usize,
        range: &DateRange,
        summary: &mut IngestSummary,
    ) -> Result<()> {
        let pages: Vec<u32> = progress.remaining_pages().collect();
        if pages.is_empty() {
            progress.complete(now());
            self.store.save_progress(progress).await?;
            return Ok(());
        }
        let workers = workers.clamp(1, pages.len());
        let batch_size = pages.len().div_ceil(workers);
        let per_page = progress.per_page;
        let total_pages = progress.total_pages();

        let mut handles = Vec::with_capacity(workers);
        for (worker_id, batch) in pages.chunks(batch_size).enumerate() {
            let worker = self.clone();
            let agency = agency.clone();
            let batch = batch.to_vec();
            let range = *range;
            debug!(worker_id, first = batch[0], count = batch.len(), "spawning crawl worker");
            handles.push(tokio::spawn(async move {
                worker
                    .run_pages(&agency, &batch, per_page, total_pages, &range)
                    .await
            }));
        }

        let mut unfinished = 0usize;
        let mut first_error = None;
        for joined in futures::future::join_all(handles).await {
            match joined {
                Ok(Ok(report)) => {
                    summary.absorb(&report.summary);
                    unfinished += report.unfinished_pages.len();
                }
                Ok(Err(e)) => {
                    error!(agency = %agency.slug, error = %e, "crawl worker failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(agency = %agency.slug, error = %e, "crawl worker panicked");
                    first_error.get_or_insert(anyhow::anyhow!("crawl worker panicked: {}", e));
                }
            }
        }

        if let Some(e) = first_error {
            return Err(e.context("concurrent crawl failed; progress not advanced"));
        }
        if unfinished > 0 || summary.cancelled {
            warn!(
                agency = %agency.slug,
                unfinished,
                "concurrent crawl left pages unfinished; progress not advanced"
            );
            return Ok(());
        }

        progress.complete(now());
        self.store.save_progress(progress).await?;
        Ok(())
    }

    async fn run_pages(
        &self,
        agency: &Agency,
        pages: &[u32],
        per_page: u32,
        total_pages: u32,
        range: &DateRange,
    ) -> Result<WorkerReport> {
        let mut report = WorkerReport {
            summary: IngestSummary::for_agency(&agency.slug),
            unfinished_pages: Vec::new(),
        };
        for (i, &page) in pages.iter().enumerate() {
            if self.cancel.is_cancelled() {
                report.summary.cancelled = true;
                report.unfinished_pages.extend_from_slice(&pages[i..]);
                break;
            }
            match self
                .process_page(agency, page, per_page, total_pages, range)
                .await?
            {
                PageOutcome::Done(page_summary) => {
                    report.summary.absorb(&page_summary);
                    self.reporter.report(SyncProgressEvent::Page {
                        agency: agency.slug.clone(),
                        page: page + 1,
                        total_pages,
                        descriptors: page_summary.descriptors_seen,
                    });
                }
                PageOutcome::Empty => {
                    warn!(agency = %agency.slug, page, "page came back empty");
                    report.unfinished_pages.push(page);
                }
                PageOutcome::Cancelled(partial) => {
                    report.summary.absorb(&partial);
                    report.summary.cancelled = true;
                    report.unfinished_pages.extend_from_slice(&pages[i..]);
                    break;
                }
            }
        }
        Ok(report)
    }

    async fn process_page(
        &self,
        agency: &Agency,
        page: u32,
        per_page: u32,
        total_pages: u32,
        range: &DateRange,
    ) -> Result<PageOutcome> {
        let results = self
            .corpus
            .search_documents(&agency.slug, page, per_page, range)
            .await
            .results;
        let mut summary = IngestSummary::for_agency(&agency.slug);
        if results.is_empty() {
            if page + 1 < total_pages {
                return Ok(PageOutcome::Empty);
            }
            debug!(agency = %agency.slug, page, "last page came back empty; count overstated");
            summary.pages_processed = 1;
            return Ok(PageOutcome::Done(summary));
        }

        for result in &results {
            if self.cancel.is_cancelled() {
                return Ok(PageOutcome::Cancelled(summary));
            }
            let descriptor = self.store.upsert_descriptor(agency.id, result).await?;
            summary.descriptors_seen += 1;
            self.process_descriptor(&descriptor, &mut summary).await?;
        }
        summary.pages_processed = 1;
        debug!(agency = %agency.slug, page, results = results.len(), "page stored");
        Ok(PageOutcome::Done(summary))
    }

    /// Fetch and store one descriptor's content, then settle its status.
    async fn process_descriptor(
        &self,
        descriptor: &SearchDescriptor,
        summary: &mut IngestSummary,
    ) -> Result<()> {
        self.store
            .set_descriptor_status(&descriptor.id, ProcessingStatus::Processing)
            .await?;

        let title = match (&descriptor.hierarchy.title, &descriptor.hierarchy.chapter) {
            (Some(title), Some(_)) => title.clone(),
            _ => {
                debug!(
                    structure_index = descriptor.structure_index,
                    "hierarchy lacks title or chapter; nothing to fetch"
                );
                summary.not_fetchable += 1;
                return self
                    .store
                    .set_descriptor_status(&descriptor.id, ProcessingStatus::Completed)
                    .await;
            }
        };

        let requested = descriptor.content_date(Utc::now().date_naive());
        let locator = ContentLocator::from(&descriptor.hierarchy);
        match self.corpus.get_content(requested, &title, &locator).await {
            ContentFetch::Found { text, version_date } => {
                self.store_content(descriptor, text, version_date, summary)
                    .await?;
                self.store
                    .set_descriptor_status(&descriptor.id, ProcessingStatus::Completed)
                    .await
            }
            ContentFetch::NotFound => {
                warn!(
                    structure_index = descriptor.structure_index,
                    title = %title,
                    date = %requested,
                    "content unavailable; descriptor marked as failed"
                );
                summary.failed += 1;
                self.store
                    .set_descriptor_status(&descriptor.id, ProcessingStatus::Error)
                    .await
            }
        }
    }

    async fn store_content(
        &self,
        descriptor: &SearchDescriptor,
        raw_xml: String,
        version_date: chrono::NaiveDate,
        summary: &mut IngestSummary,
    ) -> Result<()> {
        if self
            .store
            .find_content(&descriptor.id, version_date)
            .await?
            .is_some()
        {
            summary.contents_skipped += 1;
            if descriptor.document_ref.is_none() {
                self.materialize_document(descriptor, summary).await?;
            }
            return Ok(());
        }

        let processed_text = match extract_xml_text(&raw_xml) {
            Ok(text) if !text.is_empty() => Some(text),
            Ok(_) => None,
            Err(e) => {
                warn!(descriptor = %descriptor.id, error = %e, "keeping raw markup only");
                None
            }
        };
        let content = DocumentContent {
            id: Uuid::new_v4().to_string(),
            descriptor_id: descriptor.id.clone(),
            agency_id: descriptor.agency_id,
            version_date,
            content_hash: hash_text(&raw_xml),
            raw_xml,
            processed_text,
            created_at: now(),
        };

        match self.store.insert_content(&content).await? {
            InsertOutcome::Inserted(_) => {
                summary.contents_added += 1;
                self.materialize_document(descriptor, summary).await
            }
            InsertOutcome::Existing(_) => {
                summary.contents_skipped += 1;
                if descriptor.document_ref.is_none() {
                    self.materialize_document(descriptor, summary).await?;
                }
                Ok(())
            }
        }
    }

    async fn materialize_document(
        &self,
        descriptor: &SearchDescriptor,
        summary: &mut IngestSummary,
    ) -> Result<()> {
        let Some(key) = descriptor.hierarchy.document_id() else {
            return Ok(());
        };
        let outcome = self
            .store
            .touch_document(descriptor.agency_id, &key, &descriptor.hierarchy.label())
            .await?;
        if outcome.is_inserted() {
            summary.documents_created += 1;
        }
        let document = outcome.get();
        if descriptor.document_ref.as_deref() != Some(document.id.as_str()) {
            self.store
                .link_descriptor(&descriptor.id, &document.id)
                .await?;
        }
        Ok(())
    }

    async fn retry_descriptor(
        &self,
        descriptor: &SearchDescriptor,
        summary: &mut IngestSummary,
    ) -> Result<()> {
        self.store
            .set_descriptor_status(&descriptor.id, ProcessingStatus::Pending)
            .await?;
        self.process_descriptor(descriptor, summary).await
    }

    /// Re-run the content step for every errored descriptor of an agency,
    /// pausing `delay` between items.
    pub async fn retry_failed(&self, agency_slug: &str, delay: Duration) -> Result<IngestSummary> {
        let agency = self.require_agency(agency_slug).await?;
        let mut summary = IngestSummary::for_agency(&agency.slug);

        let failed = self
            .store
            .descriptors_with_status(agency.id, ProcessingStatus::Error)
            .await?;
        let total = failed.len() as u64;
        info!(agency = %agency.slug, failed = total, "retrying failed descriptors");

        for (i, descriptor) in failed.iter().enumerate() {
            if self.cancel.is_cancelled() {
                summary.cancelled = true;
                break;
            }
            if i > 0 && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            summary.descriptors_seen += 1;
            let attempt = self.retry_descriptor(descriptor, &mut summary).await;
            if let Err(e) = attempt {
                error!(descriptor = %descriptor.id, error = %e, "retry failed");
                summary.failed += 1;
                // Keep it selectable by the next retry pass.
                if let Err(e) = self
                    .store
                    .set_descriptor_status(&descriptor.id, ProcessingStatus::Error)
                    .await
                {
                    warn!(descriptor = %descriptor.id, error = %e, "could not mark descriptor as failed");
                }
            }
            self.reporter.report(SyncProgressEvent::Retrying {
                agency: agency.slug.clone(),
                n: i as u64 + 1,
                total,
            });
        }
        Ok(summary)
    }
}

/// Combine explicit bounds with a year window; explicit bounds win.
pub fn effective_range(explicit: &DateRange, target_year: Option<i32>) -> DateRange {
    let year = target_year.map(DateRange::for_year).unwrap_or_default();
    DateRange::new(
        explicit.since.or(year.since),
        explicit.until.or(year.until),
    )
}

fn hash_text(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

fn now() -> i64 {
    Utc::now().timestamp()
}

/// `ecfr sync <agency>`: crawl with the configured store and client.
pub async fn run_sync(
    config: &Config,
    agency: &str,
    opts: &IngestOptions,
    progress: ProgressMode,
) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = sync_with_pool(&pool, config, agency, opts, progress).await;
    pool.close().await;
    result
}

async fn sync_with_pool(
    pool: &SqlitePool,
    config: &Config,
    agency: &str,
    opts: &IngestOptions,
    progress: ProgressMode,
) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let corpus: Arc<dyn CorpusSource> = Arc::new(CorpusClient::new(&config.corpus)?);
    let orchestrator = IngestionOrchestrator::new(store, corpus)
        .with_reporter(Arc::from(progress.reporter()));
    cancel_on_ctrl_c(orchestrator.cancellation_token());

    let summary = orchestrator.start_or_resume(agency, opts).await?;

    println!("sync {}", summary.agency);
    println!("  total results: {}", summary.total_count);
    println!("  pages processed: {}", summary.pages_processed);
    println!("  descriptors: {}", summary.descriptors_seen);
    println!("  contents added: {}", summary.contents_added);
    println!("  contents skipped: {}", summary.contents_skipped);
    println!("  documents created: {}", summary.documents_created);
    println!("  not fetchable: {}", summary.not_fetchable);
    println!("  failed: {}", summary.failed);
    if summary.cancelled {
        println!("cancelled");
    } else if summary.complete {
        println!("ok");
    } else {
        println!("incomplete (run again to resume)");
    }

    Ok(())
}

/// `ecfr retry-failed <agency>`.
pub async fn run_retry_failed(config: &Config, agency: &str, progress: ProgressMode) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = retry_failed_with_pool(&pool, config, agency, progress).await;
    pool.close().await;
    result
}

async fn retry_failed_with_pool(
    pool: &SqlitePool,
    config: &Config,
    agency: &str,
    progress: ProgressMode,
) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let corpus: Arc<dyn CorpusSource> = Arc::new(CorpusClient::new(&config.corpus)?);
    let orchestrator = IngestionOrchestrator::new(store, corpus)
        .with_reporter(Arc::from(progress.reporter()));
    cancel_on_ctrl_c(orchestrator.cancellation_token());

    let delay = Duration::from_millis(config.ingest.retry_delay_ms);
    let summary = orchestrator.retry_failed(agency, delay).await?;

    println!("retry-failed {}", summary.agency);
    println!("  retried: {}", summary.descriptors_seen);
    println!("  contents added: {}", summary.contents_added);
    println!("  contents skipped: {}", summary.contents_skipped);
    println!("  documents created: {}", summary.documents_created);
    println!("  still failing: {}", summary.failed);
    println!("{}", if summary.cancelled { "cancelled" } else { "ok" });

    Ok(())
}

fn cancel_on_ctrl_c(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; finishing the current item");
            token.cancel();
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    #[test]
    fn explicit_bounds_override_year() {
        let explicit = DateRange::new(NaiveDate::from_ymd_opt(2024, 6, 1), None);
        let range = effective_range(&explicit, Some(2024));
        assert_eq!(range.since, NaiveDate::from_ymd_opt(2024, 6, 1));
        assert_eq!(range.until, NaiveDate::from_ymd_opt(2025, 1, 1));

        assert!(effective_range(&DateRange::default(), None).is_empty());
    }

    #[test]
    fn content_hash_is_stable() {
        assert_eq!(hash_text("abc"), hash_text("abc"));
        assert_ne!(hash_text("abc"), hash_text("abd"));
        assert_eq!(hash_text("").len(), 64);
    }

    #[test]
    fn summaries_accumulate() {
        let mut total = IngestSummary::for_agency("epa");
        let page = IngestSummary {
            pages_processed: 1,
            descriptors_seen: 20,
            contents_added: 18,
            failed: 2,
            ..IngestSummary::for_agency("epa")
        };
        total.absorb(&page);
        total.absorb(&page);
        assert_eq!(total.pages_processed, 2);
        assert_eq!(total.descriptors_seen, 40);
        assert_eq!(total.contents_added, 36);
        assert_eq!(total.failed, 4);
    }
}
