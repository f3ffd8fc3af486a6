//! Database statistics and health overview.
//!
//! Summarizes what has been crawled and measured: descriptor states,
//! stored content versions, documents, metrics snapshots, and the crawl
//! cursor of every agency. Used by `ecfr stats`.

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::cursor::FetchProgress;
use crate::db;
use crate::models::Agency;
use crate::store::{SqliteStore, Store};

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = stats_with_pool(&pool, config).await;
    pool.close().await;
    result
}

async fn stats_with_pool(pool: &SqlitePool, config: &Config) -> Result<()> {
    let store = SqliteStore::new(pool.clone());

    let counts = store.counts().await?;
    let agencies = store.list_agencies().await?;
    let cursors = store.list_progress().await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    let descriptors = counts.descriptors_pending
        + counts.descriptors_processing
        + counts.descriptors_completed
        + counts.descriptors_error;

    println!("eCFR Harness — Database Stats");
    println!("=============================");
    println!();
    println!("  Database:     {}", config.db.path.display());
    println!("  Size:         {}", format_bytes(db_size));
    println!();
    println!("  Agencies:     {}", counts.agencies);
    println!("  Descriptors:  {}", descriptors);
    println!(
        "    pending {} / processing {} / completed {} / error {}",
        counts.descriptors_pending,
        counts.descriptors_processing,
        counts.descriptors_completed,
        counts.descriptors_error
    );
    println!("  Contents:     {}", counts.contents);
    println!("  Documents:    {}", counts.documents);
    println!("  Metrics:      {}", counts.metrics);

    if !cursors.is_empty() {
        println!();
        println!("  Crawls:");
        println!(
            "  {:<36} {:>6} {:>11} {:>6}   {}",
            "AGENCY", "YEAR", "PAGE", "TOTAL", "UPDATED"
        );
        println!("  {}", "-".repeat(76));
        for cursor in &cursors {
            println!("{}", format_cursor(cursor, &agencies));
        }
    }

    println!();

    Ok(())
}

fn format_cursor(cursor: &FetchProgress, agencies: &[Agency]) -> String {
    let slug = agencies
        .iter()
        .find(|a| a.id == cursor.agency_id)
        .map(|a| a.slug.clone())
        .unwrap_or_else(|| format!("#{}", cursor.agency_id));
    let year = cursor
        .target_year
        .map(|y| y.to_string())
        .unwrap_or_else(|| "-".to_string());
    let page = if cursor.is_complete() {
        "complete".to_string()
    } else {
        format!("{}/{}", cursor.current_page, cursor.total_pages())
    };
    format!(
        "  {:<36} {:>6} {:>11} {:>6}   {}",
        slug,
        year,
        page,
        cursor.total_count,
        format_ts_relative(cursor.updated_at)
    )
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let now = chrono::Utc::now().timestamp();
    let delta = now - ts;

    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::StartRequest;

    #[test]
    fn bytes_are_humanized() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn cursor_line_names_agency_and_page() {
        let agency = Agency {
            id: 7,
            slug: "epa".to_string(),
            name: "EPA".to_string(),
            short_name: None,
            display_name: None,
            sortable_name: None,
            children: serde_json::Value::Null,
            cfr_references: serde_json::Value::Null,
        };
        let mut cursor = FetchProgress::start(
            7,
            &StartRequest {
                total_count: 95,
                per_page: 20,
                target_year: Some(2024),
                ..Default::default()
            },
            chrono::Utc::now().timestamp(),
        );
        cursor.advance(chrono::Utc::now().timestamp());
        let line = format_cursor(&cursor, &[agency]);
        assert!(line.contains("epa"));
        assert!(line.contains("2024"));
        assert!(line.contains("1/5"));
        assert!(line.contains("just now"));

        cursor.complete(chrono::Utc::now().timestamp());
        assert!(format_cursor(&cursor, &[]).contains("complete"));
    }
}
