//! Persistent gene-lookup cache
//!
//! SQLite-backed TTL cache keyed by case-folded `(organism, identifier)`.
//! Entries expire on read, survive across runs, and carry the provider that
//! resolved them. A corrupt store is detected on open and re-created rather
//! than failing validation.
//!
//! Within the process the cache also enforces single-flight per key:
//! concurrent requesters for the same live key share one in-flight provider
//! call through a claim registry, with waiters parked on a watch channel.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use seqscreen_common::{Error, Result};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::config::CacheSettings;

use super::provider::{GeneLookupProvider, LookupOutcome};

/// A cached identifier resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Case-folded organism (lowercase).
    pub organism: String,
    /// Case-folded identifier (uppercase).
    pub identifier: String,
    pub valid: bool,
    pub canonical_name: Option<String>,
    /// Matches the provider reported; >1 records a cached ambiguity.
    pub match_count: usize,
    pub provider: String,
    pub stored_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn is_ambiguous(&self) -> bool {
        self.match_count > 1
    }
}

/// Cache performance counters and store statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub writes: u64,
    pub evictions: u64,
    pub total_requests: u64,
    pub hit_rate: f64,
    pub cached_entries: u64,
    pub cache_size_bytes: u64,
    pub by_provider: BTreeMap<String, u64>,
}

type InflightRegistry = Arc<Mutex<HashMap<String, watch::Sender<Option<CacheEntry>>>>>;

/// Claim on a cache key: either this caller fetches, or it waits on the
/// fetch already in flight.
pub enum KeyClaim {
    Owner(FetchClaim),
    Waiter(watch::Receiver<Option<CacheEntry>>),
}

/// Held by the single fetcher for a key. Publishing resolves all waiters;
/// dropping without publishing releases the key so a later caller can retry.
pub struct FetchClaim {
    key: String,
    tx: watch::Sender<Option<CacheEntry>>,
    registry: InflightRegistry,
    completed: bool,
}

impl FetchClaim {
    /// Resolve the claim. `Some` carries a cacheable entry; `None` signals
    /// a degraded (uncacheable) outcome to any waiters.
    ///
    /// The key leaves the registry before the value is broadcast, so a
    /// caller claiming concurrently with publication becomes a fresh owner
    /// rather than a waiter on a channel that will never change again.
    pub fn publish(mut self, entry: Option<CacheEntry>) {
        self.registry
            .lock()
            .expect("inflight registry lock")
            .remove(&self.key);
        let _ = self.tx.send(entry);
        self.completed = true;
    }
}

impl Drop for FetchClaim {
    fn drop(&mut self) {
        if !self.completed {
            self.registry
                .lock()
                .expect("inflight registry lock")
                .remove(&self.key);
        }
    }
}

/// Await a waiter handle from [`GeneCache::claim`]. `None` means the owner
/// could not produce a cacheable entry (degraded or abandoned fetch).
pub async fn await_claim(mut rx: watch::Receiver<Option<CacheEntry>>) -> Option<CacheEntry> {
    match rx.changed().await {
        Ok(()) => rx.borrow().clone(),
        Err(_) => None,
    }
}

/// SQLite-backed TTL cache with single-flight coalescing.
pub struct GeneCache {
    pool: Option<SqlitePool>,
    ttl: ChronoDuration,
    hits: AtomicU64,
    misses: AtomicU64,
    writes: AtomicU64,
    evictions: AtomicU64,
    inflight: InflightRegistry,
}

impl GeneCache {
    /// Open (or create) the cache store. An unreadable store is deleted and
    /// re-created; only a persistent I/O problem is an error.
    pub async fn open(settings: &CacheSettings) -> Result<Self> {
        let ttl = ChronoDuration::hours(settings.ttl_hours as i64);

        if !settings.enabled {
            info!("Gene cache disabled");
            return Ok(Self::with_pool(None, ttl));
        }

        match Self::connect_and_init(settings).await {
            Ok(pool) => {
                info!(
                    path = %settings.path.display(),
                    ttl_hours = settings.ttl_hours,
                    "Gene cache initialized"
                );
                Ok(Self::with_pool(Some(pool), ttl))
            }
            Err(first_error) => {
                warn!(
                    path = %settings.path.display(),
                    error = %first_error,
                    "Cache store unreadable; re-creating"
                );
                let _ = std::fs::remove_file(&settings.path);
                let pool = Self::connect_and_init(settings).await?;
                Ok(Self::with_pool(Some(pool), ttl))
            }
        }
    }

    fn with_pool(pool: Option<SqlitePool>, ttl: ChronoDuration) -> Self {
        Self {
            pool,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            inflight: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn connect_and_init(settings: &CacheSettings) -> Result<SqlitePool> {
        let options = SqliteConnectOptions::new()
            .filename(&settings.path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS gene_cache (
                cache_key TEXT PRIMARY KEY,
                organism TEXT NOT NULL,
                identifier TEXT NOT NULL,
                valid INTEGER NOT NULL,
                canonical_name TEXT,
                match_count INTEGER NOT NULL DEFAULT 0,
                provider TEXT NOT NULL,
                stored_at INTEGER NOT NULL,
                expires_at INTEGER NOT NULL,
                hit_count INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_gene_cache_expires ON gene_cache(expires_at)",
        )
        .execute(&pool)
        .await?;

        Ok(pool)
    }

    /// Look up a live entry. Expired entries are evicted and count as misses.
    pub async fn lookup(&self, organism: &str, identifier: &str) -> Result<Option<CacheEntry>> {
        let Some(pool) = &self.pool else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let key = cache_key(organism, identifier);
        let row = sqlx::query(
            r#"
            SELECT organism, identifier, valid, canonical_name, match_count,
                   provider, stored_at, expires_at
            FROM gene_cache
            WHERE cache_key = ?
            "#,
        )
        .bind(&key)
        .fetch_optional(pool)
        .await?;

        let Some(row) = row else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        };

        let expires_at = row.get::<i64, _>("expires_at");
        if expires_at <= Utc::now().timestamp() {
            sqlx::query("DELETE FROM gene_cache WHERE cache_key = ?")
                .bind(&key)
                .execute(pool)
                .await?;
            self.evictions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            debug!(key, "Cache entry expired");
            return Ok(None);
        }

        sqlx::query("UPDATE gene_cache SET hit_count = hit_count + 1 WHERE cache_key = ?")
            .bind(&key)
            .execute(pool)
            .await?;
        self.hits.fetch_add(1, Ordering::Relaxed);

        Ok(Some(CacheEntry {
            organism: row.get("organism"),
            identifier: row.get("identifier"),
            valid: row.get::<i64, _>("valid") != 0,
            canonical_name: row.get("canonical_name"),
            match_count: row.get::<i64, _>("match_count") as usize,
            provider: row.get("provider"),
            stored_at: timestamp(row.get::<i64, _>("stored_at")),
            expires_at: timestamp(expires_at),
        }))
    }

    /// Store a resolution ("found" and "not found" alike). Returns the entry
    /// as it will read back, with second-precision timestamps.
    pub async fn put(
        &self,
        organism: &str,
        identifier: &str,
        outcome: &LookupOutcome,
        provider: &str,
    ) -> Result<CacheEntry> {
        let stored_at = timestamp(Utc::now().timestamp());
        let expires_at = stored_at + self.ttl;
        let entry = CacheEntry {
            organism: organism.trim().to_lowercase(),
            identifier: identifier.trim().to_uppercase(),
            valid: outcome.valid,
            canonical_name: outcome.canonical_name.clone(),
            match_count: outcome.match_count,
            provider: provider.to_string(),
            stored_at,
            expires_at,
        };

        let Some(pool) = &self.pool else {
            return Ok(entry);
        };

        sqlx::query(
            r#"
            INSERT OR REPLACE INTO gene_cache
                (cache_key, organism, identifier, valid, canonical_name,
                 match_count, provider, stored_at, expires_at, hit_count)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 0)
            "#,
        )
        .bind(cache_key(organism, identifier))
        .bind(&entry.organism)
        .bind(&entry.identifier)
        .bind(entry.valid as i64)
        .bind(&entry.canonical_name)
        .bind(entry.match_count as i64)
        .bind(&entry.provider)
        .bind(entry.stored_at.timestamp())
        .bind(entry.expires_at.timestamp())
        .execute(pool)
        .await?;

        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(entry)
    }

    /// Claim a key for fetching. The first caller becomes the owner; others
    /// wait on the owner's published result.
    pub fn claim(&self, organism: &str, identifier: &str) -> KeyClaim {
        let key = cache_key(organism, identifier);
        let mut registry = self.inflight.lock().expect("inflight registry lock");
        if let Some(tx) = registry.get(&key) {
            return KeyClaim::Waiter(tx.subscribe());
        }
        let (tx, _rx) = watch::channel(None);
        registry.insert(key.clone(), tx.clone());
        KeyClaim::Owner(FetchClaim {
            key,
            tx,
            registry: Arc::clone(&self.inflight),
            completed: false,
        })
    }

    /// Remove all expired entries. Idempotent: a second call right after the
    /// first removes nothing.
    pub async fn clear_expired(&self) -> Result<u64> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let deleted = sqlx::query("DELETE FROM gene_cache WHERE expires_at <= ?")
            .bind(Utc::now().timestamp())
            .execute(pool)
            .await?
            .rows_affected();
        self.evictions.fetch_add(deleted, Ordering::Relaxed);
        if deleted > 0 {
            info!(deleted, "Cleared expired cache entries");
        }
        Ok(deleted)
    }

    /// Remove every entry.
    pub async fn purge(&self) -> Result<u64> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let deleted = sqlx::query("DELETE FROM gene_cache")
            .execute(pool)
            .await?
            .rows_affected();
        info!(deleted, "Cache purged");
        Ok(deleted)
    }

    /// Pre-populate the cache for a list of `(organism, identifier)` pairs,
    /// resolving misses through the given provider. Returns how many new
    /// entries were written.
    pub async fn warm(
        &self,
        provider: &dyn GeneLookupProvider,
        pairs: &[(String, String)],
    ) -> Result<usize> {
        let mut misses: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (organism, identifier) in pairs {
            if self.lookup(organism, identifier).await?.is_none() {
                misses
                    .entry(organism.trim().to_lowercase())
                    .or_default()
                    .push(identifier.clone());
            }
        }

        let mut written = 0usize;
        for (organism, identifiers) in misses {
            let outcomes = provider
                .lookup_batch(&organism, &identifiers)
                .await
                .map_err(|e| Error::Internal(format!("Cache warm failed: {e}")))?;
            for outcome in &outcomes {
                self.put(&organism, &outcome.identifier, outcome, provider.name())
                    .await?;
                written += 1;
            }
        }

        info!(requested = pairs.len(), written, "Cache warm complete");
        Ok(written)
    }

    /// Counters plus store statistics.
    pub async fn stats(&self) -> Result<CacheStats> {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let total = hits + misses;

        let mut stats = CacheStats {
            hits,
            misses,
            writes: self.writes.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            total_requests: total,
            hit_rate: if total > 0 { hits as f64 / total as f64 } else { 0.0 },
            ..CacheStats::default()
        };

        let Some(pool) = &self.pool else {
            return Ok(stats);
        };

        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS entries,
                   COALESCE(SUM(LENGTH(cache_key) + LENGTH(organism) + LENGTH(identifier)
                                + COALESCE(LENGTH(canonical_name), 0)
                                + LENGTH(provider) + 24), 0) AS bytes
            FROM gene_cache
            "#,
        )
        .fetch_one(pool)
        .await?;
        stats.cached_entries = row.get::<i64, _>("entries") as u64;
        stats.cache_size_bytes = row.get::<i64, _>("bytes") as u64;

        let provider_rows =
            sqlx::query("SELECT provider, COUNT(*) AS n FROM gene_cache GROUP BY provider")
                .fetch_all(pool)
                .await?;
        for row in provider_rows {
            stats
                .by_provider
                .insert(row.get("provider"), row.get::<i64, _>("n") as u64);
        }

        Ok(stats)
    }

    pub fn is_enabled(&self) -> bool {
        self.pool.is_some()
    }

    /// Entry lifetime used for write-back.
    pub fn ttl(&self) -> ChronoDuration {
        self.ttl
    }
}

/// `organism:IDENTIFIER`, case-folded and trimmed on both parts.
fn cache_key(organism: &str, identifier: &str) -> String {
    format!(
        "{}:{}",
        organism.trim().to_lowercase(),
        identifier.trim().to_uppercase()
    )
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

// ============================================================================
// Tests
// ============================================================================
