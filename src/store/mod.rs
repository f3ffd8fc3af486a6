//! Storage abstraction for the ingestion and metrics pipelines.
//!
//! The [`Store`] trait defines every persistence operation the orchestrator
//! and the metrics engine need, so both run unchanged against SQLite
//! ([`SqliteStore`]) or the in-memory backend ([`InMemoryStore`]) used in
//! tests.
//!
//! Inserts into the two write-once tables (contents and metrics) never fail
//! on a duplicate key. They resolve to [`InsertOutcome::Existing`] carrying
//! the row that won, so concurrent workers racing on the same key all see
//! one consistent result.
//!
//! Implementations must be `Send + Sync`; workers hold their own
//! `Arc<dyn Store>` handle.

pub mod memory;
pub mod sqlite;

use anyhow::Result;
use async_trait::async_trait;
use chrono::NaiveDate;

use crate::cursor::FetchProgress;
use crate::models::{
    Agency, AgencyRecord, DateRange, Document, DocumentContent, HistoricalMetrics,
    ProcessingStatus, SearchDescriptor, SearchResult,
};

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;

/// Result of a write-once insert.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome<T> {
    /// The row was written by this call.
    Inserted(T),
    /// A row with the same key already existed; it is returned unchanged.
    Existing(T),
}

impl<T> InsertOutcome<T> {
    pub fn is_inserted(&self) -> bool {
        matches!(self, InsertOutcome::Inserted(_))
    }

    pub fn get(&self) -> &T {
        match self {
            InsertOutcome::Inserted(v) | InsertOutcome::Existing(v) => v,
        }
    }

    pub fn into_inner(self) -> T {
        match self {
            InsertOutcome::Inserted(v) | InsertOutcome::Existing(v) => v,
        }
    }
}

/// Filters for metrics discovery.
#[derive(Debug, Clone, Default)]
pub struct MetricsFilter {
    pub agency_id: Option<i64>,
    /// Applied to the content's version date, both bounds inclusive.
    pub range: DateRange,
    pub limit: Option<usize>,
}

/// A document paired with the content version that still needs metrics.
#[derive(Debug, Clone)]
pub struct PendingMetrics {
    pub document: Document,
    pub content: DocumentContent,
}

/// Row counts reported by `ecfr stats`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreCounts {
    pub agencies: i64,
    pub descriptors_pending: i64,
    pub descriptors_processing: i64,
    pub descriptors_completed: i64,
    pub descriptors_error: i64,
    pub contents: i64,
    pub documents: i64,
    pub metrics: i64,
}

/// Abstract storage backend.
///
/// # Operations
///
/// | Area | Methods |
/// |------|---------|
/// | Agencies | [`upsert_agency`](Store::upsert_agency), [`find_agency`](Store::find_agency), [`list_agencies`](Store::list_agencies) |
/// | Cursor | [`get_progress`](Store::get_progress), [`save_progress`](Store::save_progress), [`list_progress`](Store::list_progress) |
/// | Descriptors | [`upsert_descriptor`](Store::upsert_descriptor), [`set_descriptor_status`](Store::set_descriptor_status), [`link_descriptor`](Store::link_descriptor), [`descriptors_with_status`](Store::descriptors_with_status) |
/// | Contents | [`find_content`](Store::find_content), [`insert_content`](Store::insert_content) |
/// | Documents | [`touch_document`](Store::touch_document), [`get_document`](Store::get_document), [`documents_by_key`](Store::documents_by_key) |
/// | Metrics | [`pending_metrics`](Store::pending_metrics), [`find_metrics`](Store::find_metrics), [`insert_metrics`](Store::insert_metrics), [`metrics_for_document`](Store::metrics_for_document) |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert or refresh an agency by slug.
    async fn upsert_agency(&self, record: &AgencyRecord) -> Result<Agency>;

    async fn find_agency(&self, slug: &str) -> Result<Option<Agency>>;

    async fn list_agencies(&self) -> Result<Vec<Agency>>;

    async fn get_progress(&self, agency_id: i64) -> Result<Option<FetchProgress>>;

    /// Write the agency's cursor, replacing any previous record.
    async fn save_progress(&self, progress: &FetchProgress) -> Result<()>;

    async fn list_progress(&self) -> Result<Vec<FetchProgress>>;

    /// Insert a descriptor for `(agency_id, result.structure_index)` or merge
    /// the result's updatable fields into the existing one.
    async fn upsert_descriptor(
        &self,
        agency_id: i64,
        result: &SearchResult,
    ) -> Result<SearchDescriptor>;

    async fn set_descriptor_status(&self, id: &str, status: ProcessingStatus) -> Result<()>;

    /// Point a descriptor at the document row it materialized.
    async fn link_descriptor(&self, id: &str, document_ref: &str) -> Result<()>;

    /// Descriptors of an agency in a given state, by structure index.
    async fn descriptors_with_status(
        &self,
        agency_id: i64,
        status: ProcessingStatus,
    ) -> Result<Vec<SearchDescriptor>>;

    async fn find_content(
        &self,
        descriptor_id: &str,
        version_date: NaiveDate,
    ) -> Result<Option<DocumentContent>>;

    /// Write-once insert keyed by `(descriptor_id, version_date)`.
    async fn insert_content(
        &self,
        content: &DocumentContent,
    ) -> Result<InsertOutcome<DocumentContent>>;

    /// Create the document for `(document_id, agency_id)` or bump its
    /// `updated_at`.
    async fn touch_document(
        &self,
        agency_id: i64,
        document_id: &str,
        title: &str,
    ) -> Result<InsertOutcome<Document>>;

    async fn get_document(&self, id: &str) -> Result<Option<Document>>;

    /// Documents whose derived identity is `document_id`, across agencies.
    async fn documents_by_key(&self, document_id: &str) -> Result<Vec<Document>>;

    /// Document/content pairs with analyzable text and no snapshot for the
    /// content's version date. At most one pair per `(document, version)`:
    /// the earliest stored content wins.
    async fn pending_metrics(&self, filter: &MetricsFilter) -> Result<Vec<PendingMetrics>>;

    async fn find_metrics(
        &self,
        document_id: &str,
        metrics_date: NaiveDate,
    ) -> Result<Option<HistoricalMetrics>>;

    /// Write-once insert keyed by `(document_id, metrics_date)`.
    async fn insert_metrics(
        &self,
        metrics: &HistoricalMetrics,
    ) -> Result<InsertOutcome<HistoricalMetrics>>;

    /// Snapshots for one document, newest first. Both bounds of `range`
    /// are inclusive.
    async fn metrics_for_document(
        &self,
        document_id: &str,
        range: &DateRange,
    ) -> Result<Vec<HistoricalMetrics>>;

    async fn counts(&self) -> Result<StoreCounts>;
}

pub(crate) fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}
