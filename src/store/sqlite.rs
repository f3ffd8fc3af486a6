//! SQLite-backed [`Store`] implementation.
//!
//! Write-once tables use `INSERT … ON CONFLICT DO NOTHING` and then read the
//! row back by its unique key, so a lost race surfaces as
//! [`InsertOutcome::Existing`] instead of a constraint error. Dates are
//! stored as `YYYY-MM-DD` text, timestamps as Unix seconds and JSON payloads
//! as text.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::cursor::{CompletionState, FetchProgress};
use crate::models::{
    Agency, AgencyRecord, DateRange, Document, DocumentContent, HistoricalMetrics, Hierarchy,
    ProcessingStatus, SearchDescriptor, SearchResult,
};

use super::{
    now_ts, InsertOutcome, MetricsFilter, PendingMetrics, Store, StoreCounts,
};

/// SQLite implementation of the [`Store`] trait.
///
/// Cloning is cheap: clones share the pool, and every query checks out its
/// own connection, so each worker can hold its own handle.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const DATE_FORMAT: &str = "%Y-%m-%d";

fn fmt_date(date: NaiveDate) -> String {
    date.format(DATE_FORMAT).to_string()
}

fn parse_date(text: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(text, DATE_FORMAT)
        .with_context(|| format!("invalid stored date: {}", text))
}

fn parse_opt_date(text: Option<String>) -> Result<Option<NaiveDate>> {
    text.as_deref().map(parse_date).transpose()
}

fn parse_json(text: &str) -> Value {
    serde_json::from_str(text).unwrap_or(Value::Null)
}

fn agency_from_row(row: &SqliteRow) -> Result<Agency> {
    Ok(Agency {
        id: row.try_get("id")?,
        slug: row.try_get("slug")?,
        name: row.try_get("name")?,
        short_name: row.try_get("short_name")?,
        display_name: row.try_get("display_name")?,
        sortable_name: row.try_get("sortable_name")?,
        children: parse_json(&row.try_get::<String, _>("children_json")?),
        cfr_references: parse_json(&row.try_get::<String, _>("cfr_references_json")?),
    })
}

fn progress_from_row(row: &SqliteRow) -> Result<FetchProgress> {
    let total: i64 = row.try_get("total_count")?;
    let per_page: i64 = row.try_get("per_page")?;
    let current: i64 = row.try_get("current_page")?;
    Ok(FetchProgress {
        agency_id: row.try_get("agency_id")?,
        total_count: u64::try_from(total).unwrap_or(0),
        per_page: u32::try_from(per_page).unwrap_or(0),
        current_page: u32::try_from(current).unwrap_or(0),
        state: CompletionState::from_i64(row.try_get("is_complete")?),
        target_year: row.try_get("target_year")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn descriptor_from_row(row: &SqliteRow) -> Result<SearchDescriptor> {
    let hierarchy: Hierarchy =
        serde_json::from_str(&row.try_get::<String, _>("hierarchy_json")?).unwrap_or_default();
    Ok(SearchDescriptor {
        id: row.try_get("id")?,
        agency_id: row.try_get("agency_id")?,
        structure_index: row.try_get("structure_index")?,
        starts_on: parse_opt_date(row.try_get("starts_on")?)?,
        ends_on: parse_opt_date(row.try_get("ends_on")?)?,
        kind: row.try_get("type")?,
        hierarchy,
        hierarchy_headings: parse_json(&row.try_get::<String, _>("hierarchy_headings_json")?),
        headings: parse_json(&row.try_get::<String, _>("headings_json")?),
        full_text_excerpt: row.try_get("full_text_excerpt")?,
        score: row.try_get("score")?,
        reserved: row.try_get("reserved")?,
        removed: row.try_get("removed")?,
        change_types: parse_json(&row.try_get::<String, _>("change_types_json")?),
        processing_status: ProcessingStatus::from_i64(row.try_get("processing_status")?),
        document_ref: row.try_get("document_ref")?,
    })
}

fn content_from_row(row: &SqliteRow) -> Result<DocumentContent> {
    Ok(DocumentContent {
        id: row.try_get("id")?,
        descriptor_id: row.try_get("descriptor_id")?,
        agency_id: row.try_get("agency_id")?,
        version_date: parse_date(&row.try_get::<String, _>("version_date")?)?,
        raw_xml: row.try_get("raw_xml")?,
        processed_text: row.try_get("processed_text")?,
        content_hash: row.try_get("content_hash")?,
        created_at: row.try_get("created_at")?,
    })
}

fn document_from_row(row: &SqliteRow) -> Result<Document> {
    Ok(Document {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        agency_id: row.try_get("agency_id")?,
        title: row.try_get("title")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn metrics_from_row(row: &SqliteRow) -> Result<HistoricalMetrics> {
    Ok(HistoricalMetrics {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        agency_id: row.try_get("agency_id")?,
        metrics_date: parse_date(&row.try_get::<String, _>("metrics_date")?)?,
        word_count: row.try_get("word_count")?,
        sentence_count: row.try_get("sentence_count")?,
        paragraph_count: row.try_get("paragraph_count")?,
        flesch_reading_ease: row.try_get("flesch_reading_ease")?,
        smog_index: row.try_get("smog_index")?,
        automated_readability_index: row.try_get("automated_readability_index")?,
        combined_score: row.try_get("combined_score")?,
        created_at: row.try_get("created_at")?,
    })
}

impl SqliteStore {
    async fn descriptor_by_key(
        &self,
        agency_id: i64,
        structure_index: i64,
    ) -> Result<SearchDescriptor> {
        let row = sqlx::query(
            "SELECT * FROM search_descriptors WHERE agency_id = ? AND structure_index = ?",
        )
        .bind(agency_id)
        .bind(structure_index)
        .fetch_one(&self.pool)
        .await?;
        descriptor_from_row(&row)
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn upsert_agency(&self, record: &AgencyRecord) -> Result<Agency> {
        sqlx::query(
            r#"
            INSERT INTO agencies (slug, name, short_name, display_name, sortable_name,
                                  children_json, cfr_references_json)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(slug) DO UPDATE SET
                name = excluded.name,
                short_name = excluded.short_name,
                display_name = excluded.display_name,
                sortable_name = excluded.sortable_name,
                children_json = excluded.children_json,
                cfr_references_json = excluded.cfr_references_json
            "#,
        )
        .bind(&record.slug)
        .bind(record.resolved_name())
        .bind(&record.short_name)
        .bind(&record.display_name)
        .bind(&record.sortable_name)
        .bind(serde_json::to_string(&record.children)?)
        .bind(serde_json::to_string(&record.normalized_references())?)
        .execute(&self.pool)
        .await?;

        let row = sqlx::query("SELECT * FROM agencies WHERE slug = ?")
            .bind(&record.slug)
            .fetch_one(&self.pool)
            .await?;
        agency_from_row(&row)
    }

    async fn find_agency(&self, slug: &str) -> Result<Option<Agency>> {
        let row = sqlx::query("SELECT * FROM agencies WHERE slug = ?")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(agency_from_row).transpose()
    }

    async fn list_agencies(&self) -> Result<Vec<Agency>> {
        let rows = sqlx::query("SELECT * FROM agencies ORDER BY slug")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(agency_from_row).collect()
    }

    async fn get_progress(&self, agency_id: i64) -> Result<Option<FetchProgress>> {
        let row = sqlx::query("SELECT * FROM fetch_progress WHERE agency_id = ?")
            .bind(agency_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(progress_from_row).transpose()
    }

    async fn save_progress(&self, progress: &FetchProgress) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO fetch_progress (agency_id, total_count, per_page, current_page,
                                        is_complete, target_year, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(agency_id) DO UPDATE SET
                total_count = excluded.total_count,
                per_page = excluded.per_page,
                current_page = excluded.current_page,
                is_complete = excluded.is_complete,
                target_year = excluded.target_year,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(progress.agency_id)
        .bind(i64::try_from(progress.total_count).unwrap_or(i64::MAX))
        .bind(i64::from(progress.per_page))
        .bind(i64::from(progress.current_page))
        .bind(progress.state.as_i64())
        .bind(progress.target_year)
        .bind(progress.created_at)
        .bind(progress.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_progress(&self) -> Result<Vec<FetchProgress>> {
        let rows = sqlx::query("SELECT * FROM fetch_progress ORDER BY agency_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(progress_from_row).collect()
    }

    async fn upsert_descriptor(
        &self,
        agency_id: i64,
        result: &SearchResult,
    ) -> Result<SearchDescriptor> {
        let d = SearchDescriptor::from_result(Uuid::new_v4().to_string(), agency_id, result);
        sqlx::query(
            r#"
            INSERT INTO search_descriptors (id, agency_id, structure_index, starts_on, ends_on,
                type, hierarchy_json, hierarchy_headings_json, headings_json, full_text_excerpt,
                score, reserved, removed, change_types_json, processing_status, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(agency_id, structure_index) DO UPDATE SET
                starts_on = excluded.starts_on,
                ends_on = excluded.ends_on,
                type = excluded.type,
                hierarchy_json = excluded.hierarchy_json,
                hierarchy_headings_json = excluded.hierarchy_headings_json,
                headings_json = excluded.headings_json,
                full_text_excerpt = excluded.full_text_excerpt,
                score = excluded.score,
                reserved = excluded.reserved,
                removed = excluded.removed,
                change_types_json = excluded.change_types_json,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&d.id)
        .bind(d.agency_id)
        .bind(d.structure_index)
        .bind(d.starts_on.map(fmt_date))
        .bind(d.ends_on.map(fmt_date))
        .bind(&d.kind)
        .bind(serde_json::to_string(&d.hierarchy)?)
        .bind(serde_json::to_string(&d.hierarchy_headings)?)
        .bind(serde_json::to_string(&d.headings)?)
        .bind(&d.full_text_excerpt)
        .bind(d.score)
        .bind(d.reserved)
        .bind(d.removed)
        .bind(serde_json::to_string(&d.change_types)?)
        .bind(d.processing_status.as_i64())
        .bind(now_ts())
        .execute(&self.pool)
        .await?;

        self.descriptor_by_key(agency_id, result.structure_index)
            .await
    }

    async fn set_descriptor_status(&self, id: &str, status: ProcessingStatus) -> Result<()> {
        sqlx::query(
            "UPDATE search_descriptors SET processing_status = ?, updated_at = ? WHERE id = ?",
        )
        .bind(status.as_i64())
        .bind(now_ts())
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn link_descriptor(&self, id: &str, document_ref: &str) -> Result<()> {
        sqlx::query("UPDATE search_descriptors SET document_ref = ? WHERE id = ?")
            .bind(document_ref)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn descriptors_with_status(
        &self,
        agency_id: i64,
        status: ProcessingStatus,
    ) -> Result<Vec<SearchDescriptor>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM search_descriptors
            WHERE agency_id = ? AND processing_status = ?
            ORDER BY structure_index
            "#,
        )
        .bind(agency_id)
        .bind(status.as_i64())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(descriptor_from_row).collect()
    }

    async fn find_content(
        &self,
        descriptor_id: &str,
        version_date: NaiveDate,
    ) -> Result<Option<DocumentContent>> {
        let row = sqlx::query(
            "SELECT * FROM document_contents WHERE descriptor_id = ? AND version_date = ?",
        )
        .bind(descriptor_id)
        .bind(fmt_date(version_date))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(content_from_row).transpose()
    }

    async fn insert_content(
        &self,
        content: &DocumentContent,
    ) -> Result<InsertOutcome<DocumentContent>> {
        let written = sqlx::query(
            r#"
            INSERT INTO document_contents (id, descriptor_id, agency_id, version_date,
                                           raw_xml, processed_text, content_hash, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(descriptor_id, version_date) DO NOTHING
            "#,
        )
        .bind(&content.id)
        .bind(&content.descriptor_id)
        .bind(content.agency_id)
        .bind(fmt_date(content.version_date))
        .bind(&content.raw_xml)
        .bind(&content.processed_text)
        .bind(&content.content_hash)
        .bind(content.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if written == 1 {
            return Ok(InsertOutcome::Inserted(content.clone()));
        }
        let existing = self
            .find_content(&content.descriptor_id, content.version_date)
            .await?
            .context("content conflict but no existing row")?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn touch_document(
        &self,
        agency_id: i64,
        document_id: &str,
        title: &str,
    ) -> Result<InsertOutcome<Document>> {
        let now = now_ts();
        let written = sqlx::query(
            r#"
            INSERT INTO documents (id, document_id, agency_id, title, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id, agency_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4().to_string())
        .bind(document_id)
        .bind(agency_id)
        .bind(title)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if written == 0 {
            sqlx::query(
                "UPDATE documents SET updated_at = ? WHERE document_id = ? AND agency_id = ?",
            )
            .bind(now)
            .bind(document_id)
            .bind(agency_id)
            .execute(&self.pool)
            .await?;
        }

        let row = sqlx::query("SELECT * FROM documents WHERE document_id = ? AND agency_id = ?")
            .bind(document_id)
            .bind(agency_id)
            .fetch_one(&self.pool)
            .await?;
        let document = document_from_row(&row)?;
        Ok(if written == 1 {
            InsertOutcome::Inserted(document)
        } else {
            InsertOutcome::Existing(document)
        })
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        let row = sqlx::query("SELECT * FROM documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(document_from_row).transpose()
    }

    async fn documents_by_key(&self, document_id: &str) -> Result<Vec<Document>> {
        let rows = sqlx::query("SELECT * FROM documents WHERE document_id = ? ORDER BY agency_id")
            .bind(document_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(document_from_row).collect()
    }

    async fn pending_metrics(&self, filter: &MetricsFilter) -> Result<Vec<PendingMetrics>> {
        let since = filter.range.since.map(fmt_date);
        let until = filter.range.until.map(fmt_date);
        let rows = sqlx::query(
            r#"
            SELECT
                d.id AS doc_id, d.document_id AS doc_key, d.agency_id AS doc_agency_id,
                d.title AS doc_title, d.created_at AS doc_created_at,
                d.updated_at AS doc_updated_at,
                c.*
            FROM documents d
            JOIN search_descriptors s ON s.document_ref = d.id
            JOIN document_contents c ON c.descriptor_id = s.id
            WHERE (TRIM(COALESCE(c.processed_text, '')) <> '' OR TRIM(c.raw_xml) <> '')
              AND NOT EXISTS (
                  SELECT 1 FROM historical_metrics m
                  WHERE m.document_id = d.id AND m.metrics_date = c.version_date
              )
              AND (? IS NULL OR d.agency_id = ?)
              AND (? IS NULL OR c.version_date >= ?)
              AND (? IS NULL OR c.version_date <= ?)
            ORDER BY d.id, c.version_date, c.created_at, c.id
            "#,
        )
        .bind(filter.agency_id)
        .bind(filter.agency_id)
        .bind(&since)
        .bind(&since)
        .bind(&until)
        .bind(&until)
        .fetch_all(&self.pool)
        .await?;

        let limit = filter.limit.unwrap_or(usize::MAX);
        let mut pending: Vec<PendingMetrics> = Vec::new();
        for row in &rows {
            let content = content_from_row(row)?;
            let doc_id: String = row.try_get("doc_id")?;
            // Rows are ordered so the first per (document, version) is the earliest.
            if pending.last().is_some_and(|p| {
                p.document.id == doc_id && p.content.version_date == content.version_date
            }) {
                continue;
            }
            if pending.len() >= limit {
                break;
            }
            let document = Document {
                id: doc_id,
                document_id: row.try_get("doc_key")?,
                agency_id: row.try_get("doc_agency_id")?,
                title: row.try_get("doc_title")?,
                created_at: row.try_get("doc_created_at")?,
                updated_at: row.try_get("doc_updated_at")?,
            };
            pending.push(PendingMetrics { document, content });
        }
        Ok(pending)
    }

    async fn find_metrics(
        &self,
        document_id: &str,
        metrics_date: NaiveDate,
    ) -> Result<Option<HistoricalMetrics>> {
        let row = sqlx::query(
            "SELECT * FROM historical_metrics WHERE document_id = ? AND metrics_date = ?",
        )
        .bind(document_id)
        .bind(fmt_date(metrics_date))
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(metrics_from_row).transpose()
    }

    async fn insert_metrics(
        &self,
        metrics: &HistoricalMetrics,
    ) -> Result<InsertOutcome<HistoricalMetrics>> {
        let written = sqlx::query(
            r#"
            INSERT INTO historical_metrics (id, document_id, agency_id, metrics_date,
                word_count, sentence_count, paragraph_count, flesch_reading_ease,
                smog_index, automated_readability_index, combined_score, created_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(document_id, metrics_date) DO NOTHING
            "#,
        )
        .bind(&metrics.id)
        .bind(&metrics.document_id)
        .bind(metrics.agency_id)
        .bind(fmt_date(metrics.metrics_date))
        .bind(metrics.word_count)
        .bind(metrics.sentence_count)
        .bind(metrics.paragraph_count)
        .bind(metrics.flesch_reading_ease)
        .bind(metrics.smog_index)
        .bind(metrics.automated_readability_index)
        .bind(metrics.combined_score)
        .bind(metrics.created_at)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if written == 1 {
            return Ok(InsertOutcome::Inserted(metrics.clone()));
        }
        let existing = self
            .find_metrics(&metrics.document_id, metrics.metrics_date)
            .await?
            .context("metrics conflict but no existing row")?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn metrics_for_document(
        &self,
        document_id: &str,
        range: &DateRange,
    ) -> Result<Vec<HistoricalMetrics>> {
        let since = range.since.map(fmt_date);
        let until = range.until.map(fmt_date);
        let rows = sqlx::query(
            r#"
            SELECT * FROM historical_metrics
            WHERE document_id = ?
              AND (? IS NULL OR metrics_date >= ?)
              AND (? IS NULL OR metrics_date <= ?)
            ORDER BY metrics_date DESC
            "#,
        )
        .bind(document_id)
        .bind(&since)
        .bind(&since)
        .bind(&until)
        .bind(&until)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(metrics_from_row).collect()
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let agencies: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM agencies")
            .fetch_one(&self.pool)
            .await?;
        let contents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM document_contents")
            .fetch_one(&self.pool)
            .await?;
        let documents: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM documents")
            .fetch_one(&self.pool)
            .await?;
        let metrics: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM historical_metrics")
            .fetch_one(&self.pool)
            .await?;

        let mut counts = StoreCounts {
            agencies,
            contents,
            documents,
            metrics,
            ..Default::default()
        };

        let rows = sqlx::query(
            "SELECT processing_status, COUNT(*) AS n FROM search_descriptors GROUP BY processing_status",
        )
        .fetch_all(&self.pool)
        .await?;
        for row in &rows {
            let n: i64 = row.try_get("n")?;
            match ProcessingStatus::from_i64(row.try_get("processing_status")?) {
                ProcessingStatus::Pending => counts.descriptors_pending += n,
                ProcessingStatus::Processing => counts.descriptors_processing += n,
                ProcessingStatus::Completed => counts.descriptors_completed += n,
                ProcessingStatus::Error => counts.descriptors_error += n,
            }
        }
        Ok(counts)
    }
}
