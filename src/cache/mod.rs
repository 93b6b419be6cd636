//! Two-tier content-addressed analysis cache.
//!
//! The in-process map answers repeat lookups within a run; the SQLite tier
//! survives restarts. Both are keyed by the SHA-256 of the file bytes, with
//! the byte length stored alongside to disambiguate collisions.

use crate::db::models::CacheStats;
use crate::db::{Database, DbError};
use crate::model::ExtractionResult;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Durable cache error: {0}")]
    Db(#[from] DbError),
    #[error("Refusing to cache invalid result (bpm {bpm}, key {key:?})")]
    InvalidResult { bpm: f64, key: String },
}

/// Hex SHA-256 over the raw file bytes.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone)]
struct MemoryEntry {
    file_size: u64,
    result: ExtractionResult,
    created_at: DateTime<Utc>,
}

pub struct ContentCache {
    memory: RwLock<HashMap<String, MemoryEntry>>,
    durable: Option<Mutex<Database>>,
}

impl ContentCache {
    /// Cache with no durable tier.
    pub fn in_memory() -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            durable: None,
        }
    }

    pub fn with_database(db: Database) -> Self {
        Self {
            memory: RwLock::new(HashMap::new()),
            durable: Some(Mutex::new(db)),
        }
    }

    fn db(&self) -> Option<MutexGuard<'_, Database>> {
        // A panic while holding the connection cannot leave SQLite half-written.
        self.durable
            .as_ref()
            .map(|m| m.lock().unwrap_or_else(|e| e.into_inner()))
    }

    /// Look up a previous result. A size mismatch or a durable-tier read error
    /// is reported as a miss.
    pub fn get(&self, hash: &str, file_size: u64) -> Option<ExtractionResult> {
        {
            let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
            if let Some(entry) = memory.get(hash) {
                return (entry.file_size == file_size).then(|| entry.result.clone());
            }
        }

        let db = self.db()?;
        let entry = match db.get_cache_entry(hash) {
            Ok(Some(entry)) => entry,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Cache read failed for {hash}: {e}");
                return None;
            }
        };
        drop(db);

        if entry.file_size != file_size {
            log::debug!(
                "Hash {hash} matched but size differs ({} vs {file_size})",
                entry.file_size
            );
            return None;
        }

        let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
        memory.entry(hash.to_string()).or_insert_with(|| MemoryEntry {
            file_size: entry.file_size,
            result: entry.result.clone(),
            created_at: entry.created_at,
        });
        Some(entry.result)
    }

    /// Store a result. Entries are write-once per hash; a second put for the
    /// same hash is a no-op returning `Ok(false)`.
    pub fn put(
        &self,
        hash: &str,
        file_size: u64,
        file_name: &str,
        result: &ExtractionResult,
    ) -> Result<bool, CacheError> {
        if !result.is_valid() {
            return Err(CacheError::InvalidResult {
                bpm: result.bpm,
                key: result.key.clone(),
            });
        }

        let inserted = {
            let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
            if memory.contains_key(hash) {
                false
            } else {
                memory.insert(
                    hash.to_string(),
                    MemoryEntry {
                        file_size,
                        result: result.clone(),
                        created_at: Utc::now(),
                    },
                );
                true
            }
        };

        if let Some(db) = self.db() {
            db.insert_cache_entry(hash, file_size, file_name, result)?;
        }
        Ok(inserted)
    }

    /// Remove entries older than `days` from both tiers.
    pub fn prune(&self, days: u32) -> Result<usize, CacheError> {
        let now = Utc::now();
        let cutoff = now - Duration::days(i64::from(days));
        let mut removed = {
            let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
            let before = memory.len();
            memory.retain(|_, e| e.created_at >= cutoff);
            before - memory.len()
        };
        if let Some(db) = self.db() {
            removed = removed.max(db.prune_cache(days, now)?);
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<usize, CacheError> {
        let mut removed = {
            let mut memory = self.memory.write().unwrap_or_else(|e| e.into_inner());
            let n = memory.len();
            memory.clear();
            n
        };
        if let Some(db) = self.db() {
            removed = removed.max(db.clear_cache()?);
        }
        Ok(removed)
    }

    /// Durable stats when a database is attached, otherwise the memory tier's.
    pub fn stats(&self) -> Result<CacheStats, CacheError> {
        if let Some(db) = self.db() {
            return Ok(db.cache_stats()?);
        }
        let memory = self.memory.read().unwrap_or_else(|e| e.into_inner());
        Ok(CacheStats {
            entries: memory.len() as u64,
            total_bytes_analyzed: memory.values().map(|e| e.file_size).sum(),
            oldest: memory.values().map(|e| e.created_at).min(),
            newest: memory.values().map(|e| e.created_at).max(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::AnalysisMode;

    fn result(bpm: f64, key: &str) -> ExtractionResult {
        let mut r = ExtractionResult::placeholder(AnalysisMode::Full);
        r.bpm = bpm;
        r.key = key.to_string();
        r
    }

    #[test]
    fn test_content_hash_is_stable_hex() {
        let h = content_hash(b"hello");
        assert_eq!(h.len(), 64);
        assert_eq!(h, content_hash(b"hello"));
        assert_ne!(h, content_hash(b"hello!"));
        assert_eq!(
            h,
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_put_then_get() {
        let cache = ContentCache::in_memory();
        assert!(cache.put("h", 10, "a.mp3", &result(128.0, "Am")).unwrap());
        assert_eq!(cache.get("h", 10).unwrap().bpm, 128.0);
        // same hash, different size: treated as a miss
        assert!(cache.get("h", 11).is_none());
    }

    #[test]
    fn test_write_once() {
        let cache = ContentCache::with_database(Database::open_in_memory().unwrap());
        assert!(cache.put("h", 10, "a.mp3", &result(128.0, "Am")).unwrap());
        assert!(!cache.put("h", 10, "a.mp3", &result(100.0, "C")).unwrap());
        assert_eq!(cache.get("h", 10).unwrap().key, "Am");
    }

    #[test]
    fn test_invalid_results_are_rejected() {
        let cache = ContentCache::in_memory();
        assert!(matches!(
            cache.put("h", 10, "a.mp3", &result(0.0, "Am")),
            Err(CacheError::InvalidResult { .. })
        ));
        assert!(matches!(
            cache.put("h", 10, "a.mp3", &result(120.0, "Unknown")),
            Err(CacheError::InvalidResult { .. })
        ));
        assert!(cache.get("h", 10).is_none());
    }

    #[test]
    fn test_durable_tier_survives_new_cache() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cache.db");
        {
            let cache = ContentCache::with_database(Database::open(&path).unwrap());
            cache.put("h", 42, "a.flac", &result(174.0, "F#m")).unwrap();
        }
        let cache = ContentCache::with_database(Database::open(&path).unwrap());
        let hit = cache.get("h", 42).unwrap();
        assert_eq!(hit.bpm, 174.0);
        assert_eq!(hit.key, "F#m");
        assert_eq!(cache.stats().unwrap().entries, 1);
    }

    #[test]
    fn test_clear_empties_both_tiers() {
        let cache = ContentCache::with_database(Database::open_in_memory().unwrap());
        cache.put("a", 1, "a", &result(120.0, "C")).unwrap();
        cache.put("b", 1, "b", &result(121.0, "G")).unwrap();
        assert_eq!(cache.clear().unwrap(), 2);
        assert!(cache.get("a", 1).is_none());
        assert_eq!(cache.stats().unwrap().entries, 0);
    }

    #[test]
    fn test_prune_keeps_fresh_entries() {
        let cache = ContentCache::in_memory();
        cache.put("a", 1, "a", &result(120.0, "C")).unwrap();
        assert_eq!(cache.prune(30).unwrap(), 0);
        assert!(cache.get("a", 1).is_some());
    }
}
