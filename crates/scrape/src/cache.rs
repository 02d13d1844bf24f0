//! Disk-backed TTL cache for scraped payloads.
//!
//! A single redb table mapping request keys to JSON envelopes with an
//! insertion timestamp. TTL is decided by the reader, not the writer, so
//! the same entry can serve different freshness policies (e.g. 7-day
//! AniList entries shortened to 3 days for releasing series).
//!
//! redb I/O is synchronous, so `get`/`put` hop through `spawn_blocking`:
//! a cache hit mid-research never stalls sibling futures on the runtime.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::{Result, ScrapeError};

const CACHE_TABLE: TableDefinition<&str, &str> = TableDefinition::new("scrape_cache");

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    stored_at: DateTime<Utc>,
    payload: String,
}

pub struct TtlCache {
    db: Arc<Database>,
}

impl TtlCache {
    /// Open (or create) the cache file. Startup-only; callers run this once
    /// before any turn traffic.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ScrapeError::Cache(e.to_string()))?;
        }
        let db = Database::create(path).map_err(|e| ScrapeError::Cache(e.to_string()))?;
        // Make sure the table exists so first reads don't error.
        let tx = db.begin_write().map_err(|e| ScrapeError::Cache(e.to_string()))?;
        tx.open_table(CACHE_TABLE)
            .map_err(|e| ScrapeError::Cache(e.to_string()))?;
        tx.commit().map_err(|e| ScrapeError::Cache(e.to_string()))?;
        Ok(Self { db: Arc::new(db) })
    }

    /// Fetch a payload if present and younger than `ttl`.
    pub async fn get(&self, key: &str, ttl: Duration) -> Option<String> {
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || read_entry(&db, &key, ttl))
            .await
            .ok()
            .flatten()
    }

    pub async fn put(&self, key: &str, payload: &str) -> Result<()> {
        let envelope = Envelope {
            stored_at: Utc::now(),
            payload: payload.to_string(),
        };
        let raw = serde_json::to_string(&envelope)?;
        let db = self.db.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || write_entry(&db, &key, &raw))
            .await
            .map_err(|e| ScrapeError::Cache(e.to_string()))?
    }
}

fn read_entry(db: &Database, key: &str, ttl: Duration) -> Option<String> {
    let tx = db.begin_read().ok()?;
    let table = tx.open_table(CACHE_TABLE).ok()?;
    let raw = table.get(key).ok()??.value().to_string();
    let envelope: Envelope = serde_json::from_str(&raw).ok()?;

    let age = Utc::now().signed_duration_since(envelope.stored_at);
    if age.num_seconds() < 0 || age.to_std().ok()? > ttl {
        debug!(key, age_secs = age.num_seconds(), "cache entry expired");
        return None;
    }
    Some(envelope.payload)
}

fn write_entry(db: &Database, key: &str, raw: &str) -> Result<()> {
    let tx = db
        .begin_write()
        .map_err(|e| ScrapeError::Cache(e.to_string()))?;
    {
        let mut table = tx
            .open_table(CACHE_TABLE)
            .map_err(|e| ScrapeError::Cache(e.to_string()))?;
        table
            .insert(key, raw)
            .map_err(|e| ScrapeError::Cache(e.to_string()))?;
    }
    tx.commit().map_err(|e| ScrapeError::Cache(e.to_string()))?;
    Ok(())
}

/// Stable cache key: namespace plus a digest of the request identity.
pub(crate) fn cache_key(namespace: &str, input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    format!("{namespace}:{:x}", digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_within_ttl() -> std::result::Result<(), ScrapeError> {
        let dir = tempfile::tempdir().map_err(|e| ScrapeError::Cache(e.to_string()))?;
        let cache = TtlCache::open(dir.path().join("scrape.redb"))?;
        cache.put("anilist:frieren", "{\"id\":1}").await?;
        assert_eq!(
            cache.get("anilist:frieren", Duration::from_secs(60)).await,
            Some("{\"id\":1}".to_string())
        );
        Ok(())
    }

    #[tokio::test]
    async fn zero_ttl_expires_immediately() -> std::result::Result<(), ScrapeError> {
        let dir = tempfile::tempdir().map_err(|e| ScrapeError::Cache(e.to_string()))?;
        let cache = TtlCache::open(dir.path().join("scrape.redb"))?;
        cache.put("fandom:page", "content").await?;
        assert_eq!(cache.get("fandom:page", Duration::ZERO).await, None);
        Ok(())
    }

    #[tokio::test]
    async fn missing_key_is_none() -> std::result::Result<(), ScrapeError> {
        let dir = tempfile::tempdir().map_err(|e| ScrapeError::Cache(e.to_string()))?;
        let cache = TtlCache::open(dir.path().join("scrape.redb"))?;
        assert_eq!(cache.get("absent", Duration::from_secs(60)).await, None);
        Ok(())
    }

    #[tokio::test]
    async fn overwrite_replaces_payload() -> std::result::Result<(), ScrapeError> {
        let dir = tempfile::tempdir().map_err(|e| ScrapeError::Cache(e.to_string()))?;
        let cache = TtlCache::open(dir.path().join("scrape.redb"))?;
        cache.put("key", "old").await?;
        cache.put("key", "new").await?;
        assert_eq!(
            cache.get("key", Duration::from_secs(60)).await,
            Some("new".to_string())
        );
        Ok(())
    }

    #[test]
    fn cache_keys_are_namespaced_and_stable() {
        let a = cache_key("anilist", "Frieren");
        let b = cache_key("anilist", "Frieren");
        let c = cache_key("fandom", "Frieren");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("anilist:"));
    }
}
