//! In-memory [`Store`] implementation for tests.
//!
//! All tables sit behind one `std::sync::Mutex`, so every operation is
//! atomic and the write-once inserts behave like SQLite's unique keys.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use uuid::Uuid;

use crate::cursor::FetchProgress;
use crate::models::{
    Agency, AgencyRecord, DateRange, Document, DocumentContent, HistoricalMetrics,
    ProcessingStatus, SearchDescriptor, SearchResult,
};

use super::{
    now_ts, InsertOutcome, MetricsFilter, PendingMetrics, Store, StoreCounts,
};

#[derive(Default)]
struct Tables {
    agencies: Vec<Agency>,
    progress: HashMap<i64, FetchProgress>,
    descriptors: HashMap<String, SearchDescriptor>,
    descriptor_keys: HashMap<(i64, i64), String>,
    contents: Vec<DocumentContent>,
    documents: HashMap<String, Document>,
    metrics: Vec<HistoricalMetrics>,
}

/// In-memory store for tests.
#[derive(Default)]
pub struct InMemoryStore {
    tables: Mutex<Tables>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> Result<MutexGuard<'_, Tables>> {
        self.tables
            .lock()
            .map_err(|_| anyhow!("in-memory store lock poisoned"))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_agency(&self, record: &AgencyRecord) -> Result<Agency> {
        let mut t = self.tables()?;
        let next_id = t.agencies.iter().map(|a| a.id).max().unwrap_or(0) + 1;
        let fresh = Agency {
            id: next_id,
            slug: record.slug.clone(),
            name: record.resolved_name(),
            short_name: record.short_name.clone(),
            display_name: record.display_name.clone(),
            sortable_name: record.sortable_name.clone(),
            children: record.children.clone(),
            cfr_references: record.normalized_references(),
        };
        if let Some(existing) = t.agencies.iter_mut().find(|a| a.slug == record.slug) {
            *existing = Agency {
                id: existing.id,
                ..fresh
            };
            return Ok(existing.clone());
        }
        t.agencies.push(fresh.clone());
        Ok(fresh)
    }

    async fn find_agency(&self, slug: &str) -> Result<Option<Agency>> {
        Ok(self.tables()?.agencies.iter().find(|a| a.slug == slug).cloned())
    }

    async fn list_agencies(&self) -> Result<Vec<Agency>> {
        let mut agencies = self.tables()?.agencies.clone();
        agencies.sort_by(|a, b| a.slug.cmp(&b.slug));
        Ok(agencies)
    }

    async fn get_progress(&self, agency_id: i64) -> Result<Option<FetchProgress>> {
        Ok(self.tables()?.progress.get(&agency_id).cloned())
    }

    async fn save_progress(&self, progress: &FetchProgress) -> Result<()> {
        self.tables()?
            .progress
            .insert(progress.agency_id, progress.clone());
        Ok(())
    }

    async fn list_progress(&self) -> Result<Vec<FetchProgress>> {
        let mut all: Vec<FetchProgress> = self.tables()?.progress.values().cloned().collect();
        all.sort_by_key(|p| p.agency_id);
        Ok(all)
    }

    async fn upsert_descriptor(
        &self,
        agency_id: i64,
        result: &SearchResult,
    ) -> Result<SearchDescriptor> {
        let mut t = self.tables()?;
        let key = (agency_id, result.structure_index);
        if let Some(id) = t.descriptor_keys.get(&key).cloned() {
            if let Some(existing) = t.descriptors.get_mut(&id) {
                existing.merge_result(result);
                return Ok(existing.clone());
            }
        }
        let descriptor =
            SearchDescriptor::from_result(Uuid::new_v4().to_string(), agency_id, result);
        t.descriptor_keys.insert(key, descriptor.id.clone());
        t.descriptors
            .insert(descriptor.id.clone(), descriptor.clone());
        Ok(descriptor)
    }

    async fn set_descriptor_status(&self, id: &str, status: ProcessingStatus) -> Result<()> {
        let mut t = self.tables()?;
        let descriptor = t
            .descriptors
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown descriptor {}", id))?;
        descriptor.processing_status = status;
        Ok(())
    }

    async fn link_descriptor(&self, id: &str, document_ref: &str) -> Result<()> {
        let mut t = self.tables()?;
        let descriptor = t
            .descriptors
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown descriptor {}", id))?;
        descriptor.document_ref = Some(document_ref.to_string());
        Ok(())
    }

    async fn descriptors_with_status(
        &self,
        agency_id: i64,
        status: ProcessingStatus,
    ) -> Result<Vec<SearchDescriptor>> {
        let mut found: Vec<SearchDescriptor> = self
            .tables()?
            .descriptors
            .values()
            .filter(|d| d.agency_id == agency_id && d.processing_status == status)
            .cloned()
            .collect();
        found.sort_by_key(|d| d.structure_index);
        Ok(found)
    }

    async fn find_content(
        &self,
        descriptor_id: &str,
        version_date: NaiveDate,
    ) -> Result<Option<DocumentContent>> {
        Ok(self
            .tables()?
            .contents
            .iter()
            .find(|c| c.descriptor_id == descriptor_id && c.version_date == version_date)
            .cloned())
    }

    async fn insert_content(
        &self,
        content: &DocumentContent,
    ) -> Result<InsertOutcome<DocumentContent>> {
        let mut t = self.tables()?;
        if let Some(existing) = t.contents.iter().find(|c| {
            c.descriptor_id == content.descriptor_id && c.version_date == content.version_date
        }) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        t.contents.push(content.clone());
        Ok(InsertOutcome::Inserted(content.clone()))
    }

    async fn touch_document(
        &self,
        agency_id: i64,
        document_id: &str,
        title: &str,
    ) -> Result<InsertOutcome<Document>> {
        let mut t = self.tables()?;
        let now = now_ts();
        if let Some(existing) = t
            .documents
            .values_mut()
            .find(|d| d.document_id == document_id && d.agency_id == agency_id)
        {
            existing.updated_at = now;
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        let document = Document {
            id: Uuid::new_v4().to_string(),
            document_id: document_id.to_string(),
            agency_id,
            title: title.to_string(),
            created_at: now,
            updated_at: now,
        };
        t.documents.insert(document.id.clone(), document.clone());
        Ok(InsertOutcome::Inserted(document))
    }

    async fn get_document(&self, id: &str) -> Result<Option<Document>> {
        Ok(self.tables()?.documents.get(id).cloned())
    }

    async fn documents_by_key(&self, document_id: &str) -> Result<Vec<Document>> {
        let mut found: Vec<Document> = self
            .tables()?
            .documents
            .values()
            .filter(|d| d.document_id == document_id)
            .cloned()
            .collect();
        found.sort_by_key(|d| d.agency_id);
        Ok(found)
    }

    async fn pending_metrics(&self, filter: &MetricsFilter) -> Result<Vec<PendingMetrics>> {
        let t = self.tables()?;
        let mut pending: BTreeMap<(String, NaiveDate), PendingMetrics> = BTreeMap::new();

        for document in t.documents.values() {
            if filter.agency_id.is_some_and(|a| a != document.agency_id) {
                continue;
            }
            let descriptor_ids: Vec<&str> = t
                .descriptors
                .values()
                .filter(|d| d.document_ref.as_deref() == Some(document.id.as_str()))
                .map(|d| d.id.as_str())
                .collect();

            for content in t.contents.iter().filter(|c| {
                descriptor_ids.contains(&c.descriptor_id.as_str())
                    && c.analyzable_text().is_some()
                    && filter.range.contains_inclusive(c.version_date)
            }) {
                let measured = t
                    .metrics
                    .iter()
                    .any(|m| m.document_id == document.id && m.metrics_date == content.version_date);
                if measured {
                    continue;
                }
                let key = (document.id.clone(), content.version_date);
                let earlier = pending.get(&key).is_some_and(|p| {
                    (p.content.created_at, &p.content.id) <= (content.created_at, &content.id)
                });
                if !earlier {
                    pending.insert(
                        key,
                        PendingMetrics {
                            document: document.clone(),
                            content: content.clone(),
                        },
                    );
                }
            }
        }

        let limit = filter.limit.unwrap_or(usize::MAX);
        Ok(pending.into_values().take(limit).collect())
    }

    async fn find_metrics(
        &self,
        document_id: &str,
        metrics_date: NaiveDate,
    ) -> Result<Option<HistoricalMetrics>> {
        Ok(self
            .tables()?
            .metrics
            .iter()
            .find(|m| m.document_id == document_id && m.metrics_date == metrics_date)
            .cloned())
    }

    async fn insert_metrics(
        &self,
        metrics: &HistoricalMetrics,
    ) -> Result<InsertOutcome<HistoricalMetrics>> {
        let mut t = self.tables()?;
        if let Some(existing) = t.metrics.iter().find(|m| {
            m.document_id == metrics.document_id && m.metrics_date == metrics.metrics_date
        }) {
            return Ok(InsertOutcome::Existing(existing.clone()));
        }
        t.metrics.push(metrics.clone());
        Ok(InsertOutcome::Inserted(metrics.clone()))
    }

    async fn metrics_for_document(
        &self,
        document_id: &str,
        range: &DateRange,
    ) -> Result<Vec<HistoricalMetrics>> {
        let mut found: Vec<HistoricalMetrics> = self
            .tables()?
            .metrics
            .iter()
            .filter(|m| m.document_id == document_id && range.contains_inclusive(m.metrics_date))
            .cloned()
            .collect();
        found.sort_by(|a, b| b.metrics_date.cmp(&a.metrics_date));
        Ok(found)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let t = self.tables()?;
        let by_status = |status: ProcessingStatus| {
            t.descriptors
                .values()
                .filter(|d| d.processing_status == status)
                .count() as i64
        };
        Ok(StoreCounts {
            agencies: t.agencies.len() as i64,
            descriptors_pending: by_status(ProcessingStatus::Pending),
            descriptors_processing: by_status(ProcessingStatus::Processing),
            descriptors_completed: by_status(ProcessingStatus::Completed),
            descriptors_error: by_status(ProcessingStatus::Error),
            contents: t.contents.len() as i64,
            documents: t.documents.len() as i64,
            metrics: t.metrics.len() as i64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn result(index: i64) -> SearchResult {
        serde_json::from_value(json!({
            "structure_index": index,
            "ends_on": "2024-03-01",
            "hierarchy": {"title": "40", "chapter": "I", "part": "52"}
        }))
        .unwrap()
    }

    fn content(descriptor_id: &str, date: &str, created_at: i64) -> DocumentContent {
        DocumentContent {
            id: Uuid::new_v4().to_string(),
            descriptor_id: descriptor_id.to_string(),
            agency_id: 1,
            version_date: date.parse().unwrap(),
            raw_xml: "<P>Text.</P>".to_string(),
            processed_text: Some("Text.".to_string()),
            content_hash: "h".to_string(),
            created_at,
        }
    }

    #[tokio::test]
    async fn descriptor_upsert_is_keyed_by_structure_index() {
        let store = InMemoryStore::new();
        let a = store.upsert_descriptor(1, &result(5)).await.unwrap();
        store
            .set_descriptor_status(&a.id, ProcessingStatus::Completed)
            .await
            .unwrap();
        let b = store.upsert_descriptor(1, &result(5)).await.unwrap();
        assert_eq!(a.id, b.id);
        assert_eq!(b.processing_status, ProcessingStatus::Completed);

        let other_agency = store.upsert_descriptor(2, &result(5)).await.unwrap();
        assert_ne!(other_agency.id, a.id);
    }

    #[tokio::test]
    async fn duplicate_content_returns_existing() {
        let store = InMemoryStore::new();
        let first = content("d1", "2024-03-01", 1);
        let second = content("d1", "2024-03-01", 2);
        assert!(store.insert_content(&first).await.unwrap().is_inserted());
        let again = store.insert_content(&second).await.unwrap();
        assert!(!again.is_inserted());
        assert_eq!(again.get().id, first.id);
    }

    #[tokio::test]
    async fn pending_metrics_picks_earliest_content_per_version() {
        let store = InMemoryStore::new();
        let doc = store
            .touch_document(1, "T40CIP52", "Title 40")
            .await
            .unwrap()
            .into_inner();
        let d1 = store.upsert_descriptor(1, &result(1)).await.unwrap();
        let d2 = store.upsert_descriptor(1, &result(2)).await.unwrap();
        store.link_descriptor(&d1.id, &doc.id).await.unwrap();
        store.link_descriptor(&d2.id, &doc.id).await.unwrap();

        let early = content(&d2.id, "2024-03-01", 1);
        store.insert_content(&content(&d1.id, "2024-03-01", 5)).await.unwrap();
        store.insert_content(&early).await.unwrap();
        store.insert_content(&content(&d1.id, "2023-01-01", 3)).await.unwrap();

        let pending = store.pending_metrics(&MetricsFilter::default()).await.unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[1].content.id, early.id);

        let limited = store
            .pending_metrics(&MetricsFilter {
                range: DateRange::for_year(2024),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[tokio::test]
    async fn pending_metrics_until_is_inclusive() {
        let store = InMemoryStore::new();
        for i in 1..=3 {
            let doc = store
                .touch_document(1, &format!("T40CIP{}", i), "Title 40")
                .await
                .unwrap()
                .into_inner();
            let d = store.upsert_descriptor(1, &result(i)).await.unwrap();
            store.link_descriptor(&d.id, &doc.id).await.unwrap();
            store.insert_content(&content(&d.id, "2024-03-01", i)).await.unwrap();
        }
        let day = "2024-03-01".parse().ok();

        let through = store
            .pending_metrics(&MetricsFilter {
                range: DateRange::new(None, day),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(through.len(), 3);

        let single_day = store
            .pending_metrics(&MetricsFilter {
                range: DateRange::new(day, day),
                ..Default::default()
            })
            .await
            .unwrap();
        assert_eq!(single_day.len(), 3);
    }

    #[tokio::test]
    async fn agency_upsert_keeps_id() {
        let store = InMemoryStore::new();
        let rec: AgencyRecord =
            serde_json::from_value(json!({"slug": "epa", "name": "EPA"})).unwrap();
        let first = store.upsert_agency(&rec).await.unwrap();
        let renamed: AgencyRecord =
            serde_json::from_value(json!({"slug": "epa", "display_name": "Env"})).unwrap();
        let second = store.upsert_agency(&renamed).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.name, "Env");
        assert_eq!(store.list_agencies().await.unwrap().len(), 1);
    }
}
