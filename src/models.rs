//! Core data models used throughout the harness.
//!
//! Two families live here: the payload shapes returned by the eCFR API
//! ([`SearchResult`], [`AgencyRecord`], [`Hierarchy`]) and the records the
//! pipeline persists ([`SearchDescriptor`], [`DocumentContent`], [`Document`],
//! [`HistoricalMetrics`], [`Agency`]). The progress cursor lives in
//! [`crate::cursor`].

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Lifecycle marker stored on every [`SearchDescriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Completed,
    Error,
}

impl ProcessingStatus {
    pub fn as_i64(self) -> i64 {
        match self {
            ProcessingStatus::Pending => 0,
            ProcessingStatus::Processing => 1,
            ProcessingStatus::Completed => 2,
            ProcessingStatus::Error => 3,
        }
    }

    /// Unknown codes read back from storage fall back to `Pending` so the
    /// descriptor is picked up again instead of being silently dropped.
    pub fn from_i64(code: i64) -> Self {
        match code {
            1 => ProcessingStatus::Processing,
            2 => ProcessingStatus::Completed,
            3 => ProcessingStatus::Error,
            _ => ProcessingStatus::Pending,
        }
    }
}

/// Optional date window.
///
/// On the search and count endpoints `since` maps to
/// `last_modified_on_or_after` and `until` to `last_modified_before`
/// (exclusive). Metrics filters read both bounds inclusively through
/// [`DateRange::contains_inclusive`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DateRange {
    pub since: Option<NaiveDate>,
    pub until: Option<NaiveDate>,
}

impl DateRange {
    pub fn new(since: Option<NaiveDate>, until: Option<NaiveDate>) -> Self {
        Self { since, until }
    }

    /// The window covering one calendar year: `[Y-01-01, (Y+1)-01-01)`.
    pub fn for_year(year: i32) -> Self {
        Self {
            since: NaiveDate::from_ymd_opt(year, 1, 1),
            until: NaiveDate::from_ymd_opt(year + 1, 1, 1),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.since.is_none() && self.until.is_none()
    }

    /// `since <= date <= until`, open where a bound is absent.
    pub fn contains_inclusive(&self, date: NaiveDate) -> bool {
        self.since.map_or(true, |s| date >= s) && self.until.map_or(true, |u| date <= u)
    }

    /// Year of `since`, used to label year-scoped runs.
    pub fn year(&self) -> Option<i32> {
        self.since.map(|d| d.year())
    }
}

/// Addressing of a corpus location. Every level is optional.
///
/// The API emits these as strings (`"40"`) but older payloads and test
/// fixtures use bare numbers, so both are accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hierarchy {
    #[serde(default, deserialize_with = "de_opt_string")]
    pub title: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub subtitle: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub chapter: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub subchapter: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub part: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub subpart: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub section: Option<String>,
    #[serde(default, deserialize_with = "de_opt_string")]
    pub appendix: Option<String>,
}

impl Hierarchy {
    /// Content can only be fetched when both title and chapter are known.
    pub fn is_fetchable(&self) -> bool {
        self.title.is_some() && self.chapter.is_some()
    }

    /// Deterministic logical document identity, e.g. `T40CIP52`.
    ///
    /// Returns `None` without a title; chapter and part are appended only
    /// when present.
    pub fn document_id(&self) -> Option<String> {
        let title = self.title.as_deref()?;
        let mut id = format!("T{}", title);
        if let Some(chapter) = &self.chapter {
            id.push('C');
            id.push_str(chapter);
        }
        if let Some(part) = &self.part {
            id.push('P');
            id.push_str(part);
        }
        Some(id)
    }

    /// Human-readable label used as the document title.
    pub fn label(&self) -> String {
        let mut parts = Vec::new();
        if let Some(t) = &self.title {
            parts.push(format!("Title {}", t));
        }
        if let Some(c) = &self.chapter {
            parts.push(format!("Chapter {}", c));
        }
        if let Some(p) = &self.part {
            parts.push(format!("Part {}", p));
        }
        parts.join(" ")
    }
}

fn de_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    })
}

/// One row of `GET /search/v1/results`.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchResult {
    pub structure_index: i64,
    #[serde(default)]
    pub starts_on: Option<NaiveDate>,
    #[serde(default)]
    pub ends_on: Option<NaiveDate>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub hierarchy: Hierarchy,
    #[serde(default)]
    pub hierarchy_headings: Value,
    #[serde(default)]
    pub headings: Value,
    #[serde(default)]
    pub full_text_excerpt: Option<String>,
    #[serde(default)]
    pub score: Option<f64>,
    #[serde(default)]
    pub reserved: bool,
    #[serde(default)]
    pub removed: bool,
    #[serde(default)]
    pub change_types: Value,
}

/// A structural pointer into the corpus, persisted per search result.
#[derive(Debug, Clone, PartialEq)]
pub struct SearchDescriptor {
    pub id: String,
    pub agency_id: i64,
    pub structure_index: i64,
    pub starts_on: Option<NaiveDate>,
    pub ends_on: Option<NaiveDate>,
    pub kind: Option<String>,
    pub hierarchy: Hierarchy,
    pub hierarchy_headings: Value,
    pub headings: Value,
    pub full_text_excerpt: Option<String>,
    pub score: Option<f64>,
    pub reserved: bool,
    pub removed: bool,
    pub change_types: Value,
    pub processing_status: ProcessingStatus,
    /// Row id of the [`Document`] this descriptor materialized, once known.
    pub document_ref: Option<String>,
}

impl SearchDescriptor {
    pub fn from_result(id: String, agency_id: i64, result: &SearchResult) -> Self {
        let mut descriptor = Self {
            id,
            agency_id,
            structure_index: result.structure_index,
            starts_on: None,
            ends_on: None,
            kind: None,
            hierarchy: Hierarchy::default(),
            hierarchy_headings: Value::Null,
            headings: Value::Null,
            full_text_excerpt: None,
            score: None,
            reserved: false,
            removed: false,
            change_types: Value::Null,
            processing_status: ProcessingStatus::Pending,
            document_ref: None,
        };
        descriptor.merge_result(result);
        descriptor
    }

    /// Copy every updatable field from a fresh search result.
    ///
    /// Identity (`id`, `agency_id`, `structure_index`), the processing
    /// status and the document link are left untouched.
    pub fn merge_result(&mut self, result: &SearchResult) {
        self.starts_on = result.starts_on;
        self.ends_on = result.ends_on;
        self.kind = result.kind.clone();
        self.hierarchy = result.hierarchy.clone();
        self.hierarchy_headings = result.hierarchy_headings.clone();
        self.headings = result.headings.clone();
        self.full_text_excerpt = result.full_text_excerpt.clone();
        self.score = result.score;
        self.reserved = result.reserved;
        self.removed = result.removed;
        self.change_types = result.change_types.clone();
    }

    /// Version date to request: `ends_on`, else `starts_on`, else `today`.
    pub fn content_date(&self, today: NaiveDate) -> NaiveDate {
        self.ends_on.or(self.starts_on).unwrap_or(today)
    }
}

/// One stored version of a descriptor's text.
#[derive(Debug, Clone, PartialEq)]
pub struct DocumentContent {
    pub id: String,
    pub descriptor_id: String,
    pub agency_id: i64,
    pub version_date: NaiveDate,
    pub raw_xml: String,
    pub processed_text: Option<String>,
    pub content_hash: String,
    pub created_at: i64,
}

impl DocumentContent {
    /// Text handed to the analyzer: processed text when present and
    /// non-blank, otherwise the raw markup.
    pub fn analyzable_text(&self) -> Option<(&str, ContentSource)> {
        match self.processed_text.as_deref() {
            Some(text) if !text.trim().is_empty() => Some((text, ContentSource::ProcessedText)),
            _ if !self.raw_xml.trim().is_empty() => {
                Some((self.raw_xml.as_str(), ContentSource::RawXml))
            }
            _ => None,
        }
    }
}

/// Which column a metrics snapshot was computed from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentSource {
    ProcessedText,
    RawXml,
}

/// A logical document derived from a hierarchy path.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Document {
    pub id: String,
    /// Derived identity such as `T40CIP52`.
    pub document_id: String,
    pub agency_id: i64,
    pub title: String,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One computed metrics snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalMetrics {
    pub id: String,
    /// Row id of the owning [`Document`].
    pub document_id: String,
    pub agency_id: i64,
    pub metrics_date: NaiveDate,
    pub word_count: i64,
    pub sentence_count: i64,
    pub paragraph_count: i64,
    pub flesch_reading_ease: f64,
    pub smog_index: f64,
    pub automated_readability_index: f64,
    pub combined_score: f64,
    pub created_at: i64,
}

/// Agency entry as returned by `GET /admin/v1/agencies.json`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgencyRecord {
    pub slug: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub sortable_name: Option<String>,
    #[serde(default)]
    pub children: Value,
    #[serde(default)]
    pub cfr_references: Value,
}

impl AgencyRecord {
    /// Stored name: `name`, else `display_name`, else the slug.
    pub fn resolved_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.display_name.clone())
            .unwrap_or_else(|| self.slug.clone())
    }

    /// References without a chapter but with a subtitle use the subtitle as
    /// chapter, so hierarchy lookups stay uniform.
    pub fn normalized_references(&self) -> Value {
        let mut refs = self.cfr_references.clone();
        if let Value::Array(items) = &mut refs {
            for item in items.iter_mut() {
                if let Value::Object(map) = item {
                    let has_chapter = map.get("chapter").is_some_and(|c| !c.is_null());
                    if !has_chapter {
                        if let Some(subtitle) = map.get("subtitle").cloned() {
                            map.insert("chapter".to_string(), subtitle);
                        }
                    }
                }
            }
        }
        refs
    }
}

/// Stored agency.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Agency {
    pub id: i64,
    pub slug: String,
    pub name: String,
    pub short_name: Option<String>,
    pub display_name: Option<String>,
    pub sortable_name: Option<String>,
    pub children: Value,
    pub cfr_references: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn document_id_from_mixed_hierarchy() {
        let h: Hierarchy =
            serde_json::from_value(json!({"title": 40, "chapter": "I", "part": 52})).unwrap();
        assert_eq!(h.document_id().as_deref(), Some("T40CIP52"));
    }

    #[test]
    fn document_id_skips_missing_levels() {
        let h: Hierarchy = serde_json::from_value(json!({"title": "7", "part": "210"})).unwrap();
        assert_eq!(h.document_id().as_deref(), Some("T7P210"));
        assert!(!h.is_fetchable());

        let none: Hierarchy = serde_json::from_value(json!({"chapter": "I"})).unwrap();
        assert_eq!(none.document_id(), None);
    }

    #[test]
    fn blank_levels_are_absent() {
        let h: Hierarchy =
            serde_json::from_value(json!({"title": "40", "chapter": "", "part": null})).unwrap();
        assert_eq!(h.chapter, None);
        assert_eq!(h.part, None);
    }

    #[test]
    fn inclusive_range_keeps_both_edges() {
        let day = |d| NaiveDate::from_ymd_opt(2024, 3, d).unwrap();
        let range = DateRange::new(Some(day(1)), Some(day(1)));
        assert!(range.contains_inclusive(day(1)));
        assert!(!range.contains_inclusive(day(2)));
        assert!(DateRange::default().contains_inclusive(day(31)));
        assert!(!DateRange::new(None, Some(day(10))).contains_inclusive(day(11)));
    }

    #[test]
    fn content_date_prefers_ends_on() {
        let result: SearchResult = serde_json::from_value(json!({
            "structure_index": 3,
            "starts_on": "2020-01-01",
            "ends_on": "2021-06-30",
            "hierarchy": {"title": "40", "chapter": "I"}
        }))
        .unwrap();
        let today = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
        let mut d = SearchDescriptor::from_result("d1".into(), 1, &result);
        assert_eq!(d.content_date(today), NaiveDate::from_ymd_opt(2021, 6, 30).unwrap());
        d.ends_on = None;
        assert_eq!(d.content_date(today), NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
        d.starts_on = None;
        assert_eq!(d.content_date(today), today);
    }

    #[test]
    fn merge_keeps_identity_and_status() {
        let first: SearchResult = serde_json::from_value(json!({
            "structure_index": 9, "type": "section", "hierarchy": {"title": "40"}
        }))
        .unwrap();
        let second: SearchResult = serde_json::from_value(json!({
            "structure_index": 9, "type": "part", "score": 1.5, "hierarchy": {"title": "41"}
        }))
        .unwrap();
        let mut d = SearchDescriptor::from_result("d1".into(), 7, &first);
        d.processing_status = ProcessingStatus::Completed;
        d.merge_result(&second);
        assert_eq!(d.id, "d1");
        assert_eq!(d.agency_id, 7);
        assert_eq!(d.kind.as_deref(), Some("part"));
        assert_eq!(d.score, Some(1.5));
        assert_eq!(d.hierarchy.title.as_deref(), Some("41"));
        assert_eq!(d.processing_status, ProcessingStatus::Completed);
    }

    #[test]
    fn year_range_is_half_open() {
        let r = DateRange::for_year(2024);
        assert!(r.contains(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()));
        assert!(r.contains(NaiveDate::from_ymd_opt(2024, 12, 31).unwrap()));
        assert!(!r.contains(NaiveDate::from_ymd_opt(2025, 1, 1).unwrap()));
        assert_eq!(r.year(), Some(2024));
    }

    #[test]
    fn subtitle_fills_missing_chapter() {
        let rec: AgencyRecord = serde_json::from_value(json!({
            "slug": "x",
            "cfr_references": [{"title": 2, "subtitle": "A"}, {"title": 5, "chapter": "II"}]
        }))
        .unwrap();
        let refs = rec.normalized_references();
        assert_eq!(refs[0]["chapter"], json!("A"));
        assert_eq!(refs[1]["chapter"], json!("II"));
    }
}
