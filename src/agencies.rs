//! Agency catalogue: refresh from the corpus and list what is stored.

use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::info;

use crate::config::Config;
use crate::corpus::CorpusClient;
use crate::db;
use crate::models::{Agency, AgencyRecord};
use crate::store::{SqliteStore, Store};

/// Upsert every record by slug. Returns the stored agencies in input order.
pub async fn refresh_agencies(store: &dyn Store, records: &[AgencyRecord]) -> Result<Vec<Agency>> {
    let mut stored = Vec::with_capacity(records.len());
    for record in records {
        stored.push(store.upsert_agency(record).await?);
    }
    info!(agencies = stored.len(), "agency list refreshed");
    Ok(stored)
}

/// `ecfr agencies refresh`.
pub async fn run_refresh(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = refresh_with_pool(&pool, config).await;
    pool.close().await;
    result
}

async fn refresh_with_pool(pool: &SqlitePool, config: &Config) -> Result<()> {
    let store: Arc<dyn Store> = Arc::new(SqliteStore::new(pool.clone()));
    let client = CorpusClient::new(&config.corpus)?;

    let records = client.get_agencies().await?;
    let stored = refresh_agencies(store.as_ref(), &records).await?;

    println!("agencies refresh");
    println!("  fetched: {}", records.len());
    println!("  stored: {}", stored.len());
    println!("ok");

    Ok(())
}

/// `ecfr agencies list`.
pub async fn run_list(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    let result = list_with_pool(&pool).await;
    pool.close().await;
    result
}

async fn list_with_pool(pool: &SqlitePool) -> Result<()> {
    let store = SqliteStore::new(pool.clone());
    let agencies = store.list_agencies().await?;

    if agencies.is_empty() {
        println!("No agencies stored. Run `ecfr agencies refresh`.");
    } else {
        println!("{:<6} {:<40} {}", "ID", "SLUG", "NAME");
        for a in &agencies {
            println!("{:<6} {:<40} {}", a.id, a.slug, a.name);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn refresh_is_idempotent_by_slug() {
        let store = InMemoryStore::new();
        let records: Vec<AgencyRecord> = serde_json::from_value(json!([
            {"slug": "environmental-protection-agency", "name": "Environmental Protection Agency",
             "cfr_references": [{"title": 40, "chapter": "I"}]},
            {"slug": "office-of-management-and-budget", "short_name": "OMB",
             "cfr_references": [{"title": 2, "subtitle": "A"}]}
        ]))
        .unwrap();

        let first = refresh_agencies(&store, &records).await.unwrap();
        let second = refresh_agencies(&store, &records).await.unwrap();
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(store.list_agencies().await.unwrap().len(), 2);

        let omb = store
            .find_agency("office-of-management-and-budget")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(omb.name, "office-of-management-and-budget");
        assert_eq!(omb.cfr_references[0]["chapter"], json!("A"));
    }
}
