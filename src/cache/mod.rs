//! Persistent translation cache backed by SQLite.
//!
//! Keyed by SHA-256 of `source ‖ glossary_digest ‖ model`, so changing any
//! of the three misses on purpose. Entries expire after a TTL and the
//! store evicts least-recently-used rows when the byte cap is exceeded.
//!
//! Every storage fault degrades: reads become misses, writes become
//! no-ops. A broken cache must never fail the pipeline.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{LocPipeError, Result};

/// Width of the hex-truncated cache key.
const KEY_HEX_WIDTH: usize = 40;

/// Cache tuning knobs, normally read from the pipeline YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub location: PathBuf,
    pub ttl_days: u64,
    pub max_size_mb: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            location: PathBuf::from("data/translation_cache.db"),
            ttl_days: 7,
            max_size_mb: 100,
        }
    }
}

/// In-memory counters for one store instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct CacheInner {
    db: Connection,
    stats: CacheStats,
}

/// Thread-safe translation cache.
pub struct CacheStore {
    inner: Mutex<CacheInner>,
    config: CacheConfig,
}

/// Compute the content-addressed key for a lookup.
pub fn cache_key(source: &str, glossary_digest: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update([0u8]);
    hasher.update(glossary_digest.as_bytes());
    hasher.update([0u8]);
    hasher.update(model.as_bytes());
    let hex = hex::encode(hasher.finalize());
    hex[..KEY_HEX_WIDTH].to_string()
}

impl CacheStore {
    /// Open or create the cache database at the configured location.
    pub fn open(config: CacheConfig) -> Result<Self> {
        if let Some(parent) = config.location.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(&config.location)
            .map_err(|e| LocPipeError::Storage(format!("cache open failed: {}", e)))?;
        Self::init_schema(&db)?;
        Ok(Self {
            inner: Mutex::new(CacheInner {
                db,
                stats: CacheStats::default(),
            }),
            config,
        })
    }

    /// An in-memory cache, for tests and `--no-cache` dry runs.
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()
            .map_err(|e| LocPipeError::Storage(format!("cache open failed: {}", e)))?;
        Self::init_schema(&db)?;
        Ok(Self {
            inner: Mutex::new(CacheInner {
                db,
                stats: CacheStats::default(),
            }),
            config: CacheConfig::default(),
        })
    }

    fn init_schema(db: &Connection) -> Result<()> {
        db.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS translations (
                key TEXT PRIMARY KEY,
                translation TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                last_access_at INTEGER NOT NULL,
                size_bytes INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_translations_access
                ON translations(last_access_at);

            CREATE TABLE IF NOT EXISTS meta (
                key TEXT PRIMARY KEY,
                value INTEGER NOT NULL
            );

            INSERT OR IGNORE INTO meta (key, value) VALUES ('total_size_bytes', 0);
            "#,
        )
        .map_err(|e| LocPipeError::Storage(format!("cache schema init failed: {}", e)))?;
        Ok(())
    }

    fn ttl_seconds(&self) -> i64 {
        (self.config.ttl_days as i64) * 86_400
    }

    fn max_size_bytes(&self) -> i64 {
        (self.config.max_size_mb as i64) * 1024 * 1024
    }

    /// Look up a translation. Returns `(hit, translation)`; storage faults
    /// and expired entries both read as misses.
    pub fn get(&self, source: &str, glossary_digest: &str, model: &str) -> (bool, Option<String>) {
        self.get_at(source, glossary_digest, model, chrono::Utc::now().timestamp())
    }

    fn get_at(
        &self,
        source: &str,
        glossary_digest: &str,
        model: &str,
        now: i64,
    ) -> (bool, Option<String>) {
        let key = cache_key(source, glossary_digest, model);
        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return (false, None),
        };

        let row: rusqlite::Result<(String, i64, i64)> = inner.db.query_row(
            "SELECT translation, created_at, size_bytes FROM translations WHERE key = ?1",
            params![key],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        );

        match row {
            Ok((translation, created_at, size_bytes)) => {
                if now - created_at > self.ttl_seconds() {
                    // Reclaim the expired row opportunistically.
                    let _ = inner.db.execute(
                        "DELETE FROM translations WHERE key = ?1",
                        params![key],
                    );
                    let _ = inner.db.execute(
                        "UPDATE meta SET value = MAX(0, value - ?1) WHERE key = 'total_size_bytes'",
                        params![size_bytes],
                    );
                    inner.stats.misses += 1;
                    (false, None)
                } else {
                    let _ = inner.db.execute(
                        "UPDATE translations SET last_access_at = ?1 WHERE key = ?2",
                        params![now, key],
                    );
                    inner.stats.hits += 1;
                    (true, Some(translation))
                }
            }
            Err(rusqlite::Error::QueryReturnedNoRows) => {
                inner.stats.misses += 1;
                (false, None)
            }
            Err(e) => {
                tracing::debug!(error = %e, "cache read failed, treating as miss");
                inner.stats.misses += 1;
                (false, None)
            }
        }
    }

    /// Store a translation. Returns whether the write landed; faults are
    /// swallowed as a `false`.
    pub fn set(&self, source: &str, glossary_digest: &str, model: &str, translation: &str) -> bool {
        self.set_at(
            source,
            glossary_digest,
            model,
            translation,
            chrono::Utc::now().timestamp(),
        )
    }

    fn set_at(
        &self,
        source: &str,
        glossary_digest: &str,
        model: &str,
        translation: &str,
        now: i64,
    ) -> bool {
        let key = cache_key(source, glossary_digest, model);
        let size_bytes = translation.len() as i64;

        let mut inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return false,
        };

        let result = (|| -> rusqlite::Result<u64> {
            let tx = inner.db.transaction()?;

            let old_size: i64 = tx
                .query_row(
                    "SELECT size_bytes FROM translations WHERE key = ?1",
                    params![key],
                    |r| r.get(0),
                )
                .unwrap_or(0);

            tx.execute(
                "INSERT OR REPLACE INTO translations
                 (key, translation, created_at, last_access_at, size_bytes)
                 VALUES (?1, ?2, ?3, ?3, ?4)",
                params![key, translation, now, size_bytes],
            )?;
            tx.execute(
                "UPDATE meta SET value = MAX(0, value - ?1 + ?2) WHERE key = 'total_size_bytes'",
                params![old_size, size_bytes],
            )?;

            // LRU eviction down to the byte cap.
            let cap = self.max_size_bytes();
            let mut evicted = 0u64;
            loop {
                let total: i64 = tx.query_row(
                    "SELECT value FROM meta WHERE key = 'total_size_bytes'",
                    [],
                    |r| r.get(0),
                )?;
                if total <= cap {
                    break;
                }
                let victim: rusqlite::Result<(String, i64)> = tx.query_row(
                    "SELECT key, size_bytes FROM translations
                     ORDER BY last_access_at ASC LIMIT 1",
                    [],
                    |r| Ok((r.get(0)?, r.get(1)?)),
                );
                let Ok((victim_key, victim_size)) = victim else {
                    break;
                };
                if victim_key == key {
                    // The entry we just wrote is itself over cap; keep it
                    // rather than thrash.
                    break;
                }
                tx.execute(
                    "DELETE FROM translations WHERE key = ?1",
                    params![victim_key],
                )?;
                tx.execute(
                    "UPDATE meta SET value = MAX(0, value - ?1) WHERE key = 'total_size_bytes'",
                    params![victim_size],
                )?;
                evicted += 1;
            }

            tx.commit()?;
            Ok(evicted)
        })();

        match result {
            Ok(evicted) => {
                inner.stats.evictions += evicted;
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "cache write failed, dropping entry");
                false
            }
        }
    }

    /// Delete every entry. Returns the number removed.
    pub fn clear(&self) -> usize {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return 0,
        };
        let removed = inner
            .db
            .execute("DELETE FROM translations", [])
            .unwrap_or(0);
        let _ = inner.db.execute(
            "UPDATE meta SET value = 0 WHERE key = 'total_size_bytes'",
            [],
        );
        removed
    }

    /// Current total bytes and the configured cap.
    pub fn size(&self) -> (u64, u64) {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return (0, self.config.max_size_mb * 1024 * 1024),
        };
        let total: i64 = inner
            .db
            .query_row(
                "SELECT value FROM meta WHERE key = 'total_size_bytes'",
                [],
                |r| r.get(0),
            )
            .unwrap_or(0);
        (total.max(0) as u64, self.config.max_size_mb * 1024 * 1024)
    }

    /// Number of live entries.
    pub fn entry_count(&self) -> usize {
        let inner = match self.inner.lock() {
            Ok(g) => g,
            Err(_) => return 0,
        };
        inner
            .db
            .query_row("SELECT COUNT(*) FROM translations", [], |r| {
                r.get::<_, i64>(0)
            })
            .unwrap_or(0) as usize
    }

    /// Snapshot of the in-memory counters.
    pub fn stats(&self) -> CacheStats {
        self.inner
            .lock()
            .map(|g| g.stats)
            .unwrap_or_default()
    }

    pub fn location(&self) -> &Path {
        &self.config.location
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> CacheStore {
        CacheStore::in_memory().unwrap()
    }

    #[test]
    fn test_miss_then_hit() {
        let cache = store();
        let (hit, _) = cache.get("源文本", "g1", "model-a");
        assert!(!hit);

        assert!(cache.set("源文本", "g1", "model-a", "перевод"));
        let (hit, value) = cache.get("源文本", "g1", "model-a");
        assert!(hit);
        assert_eq!(value.as_deref(), Some("перевод"));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_key_changes_with_any_component() {
        let base = cache_key("src", "gloss", "model");
        assert_ne!(base, cache_key("src2", "gloss", "model"));
        assert_ne!(base, cache_key("src", "gloss2", "model"));
        assert_ne!(base, cache_key("src", "gloss", "model2"));
        assert_eq!(base.len(), KEY_HEX_WIDTH);
    }

    #[test]
    fn test_glossary_change_misses() {
        let cache = store();
        cache.set("src", "digest-v1", "m", "tr");
        let (hit, _) = cache.get("src", "digest-v2", "m");
        assert!(!hit);
    }

    #[test]
    fn test_ttl_expiry() {
        let cache = store();
        let t0 = 1_700_000_000;
        cache.set_at("src", "g", "m", "tr", t0);

        // Within TTL.
        let (hit, _) = cache.get_at("src", "g", "m", t0 + 86_400);
        assert!(hit);

        // Past the 7-day default TTL.
        let (hit, _) = cache.get_at("src", "g", "m", t0 + 8 * 86_400);
        assert!(!hit);

        // The expired row was reclaimed.
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.size().0, 0);
    }

    #[test]
    fn test_overwrite_updates_size_accounting() {
        let cache = store();
        cache.set("src", "g", "m", "short");
        cache.set("src", "g", "m", "a considerably longer translation");
        let (total, _) = cache.size();
        assert_eq!(total, "a considerably longer translation".len() as u64);
        assert_eq!(cache.entry_count(), 1);
    }

    #[test]
    fn test_lru_eviction_at_cap() {
        let mut config = CacheConfig::default();
        config.max_size_mb = 0; // cap of zero bytes forces eviction
        config.location = PathBuf::from(":memory:");
        let db = Connection::open_in_memory().unwrap();
        CacheStore::init_schema(&db).unwrap();
        let cache = CacheStore {
            inner: Mutex::new(CacheInner {
                db,
                stats: CacheStats::default(),
            }),
            config,
        };

        let t0 = 1_700_000_000;
        cache.set_at("one", "g", "m", "first", t0);
        // Touch "one" so it is the most recently used, then insert another.
        cache.get_at("one", "g", "m", t0 + 1);
        cache.set_at("two", "g", "m", "second", t0 + 2);

        // With a zero cap the older entry is evicted for the newer write.
        let (hit_one, _) = cache.get_at("one", "g", "m", t0 + 3);
        let (hit_two, _) = cache.get_at("two", "g", "m", t0 + 3);
        assert!(!hit_one);
        assert!(hit_two);
        assert!(cache.stats().evictions >= 1);
    }

    #[test]
    fn test_clear() {
        let cache = store();
        cache.set("a", "g", "m", "1");
        cache.set("b", "g", "m", "2");
        assert_eq!(cache.clear(), 2);
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.size().0, 0);
    }

    #[test]
    fn test_hit_rate() {
        let cache = store();
        cache.set("a", "g", "m", "1");
        cache.get("a", "g", "m");
        cache.get("b", "g", "m");
        let stats = cache.stats();
        assert!((stats.hit_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_persistence_across_instances() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = CacheConfig {
            location: tmp.path().join("cache.db"),
            ..CacheConfig::default()
        };

        {
            let cache = CacheStore::open(config.clone()).unwrap();
            cache.set("src", "g", "m", "tr");
        }
        {
            let cache = CacheStore::open(config).unwrap();
            let (hit, value) = cache.get("src", "g", "m");
            assert!(hit);
            assert_eq!(value.as_deref(), Some("tr"));
        }
    }

    #[test]
    fn test_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<CacheStore>();
    }
}
