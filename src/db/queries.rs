use super::models::{CacheEntry, CacheStats};
use super::{Database, DbError, Result};
use crate::model::ExtractionResult;
use chrono::{DateTime, Duration, NaiveDateTime, Utc};
use rusqlite::{OptionalExtension, params};

/// SQLite `datetime()` layout, so rows written by either side compare as text.
const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format(TS_FORMAT).to_string()
}

fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(s, TS_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

impl Database {
    /// Insert a cache row. Existing rows for the same hash are left untouched;
    /// returns whether a new row was written.
    pub fn insert_cache_entry(
        &self,
        content_hash: &str,
        file_size: u64,
        file_name: &str,
        result: &ExtractionResult,
    ) -> Result<bool> {
        let json = serde_json::to_string(result)?;
        let changed = self.conn.execute(
            "INSERT INTO analysis_cache (
                content_hash, file_size, file_name, bpm, musical_key, result_json, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ON CONFLICT(content_hash) DO NOTHING",
            params![
                content_hash,
                file_size as i64,
                file_name,
                result.bpm,
                result.key,
                json,
                format_ts(Utc::now()),
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_cache_entry(&self, content_hash: &str) -> Result<Option<CacheEntry>> {
        let row = self
            .conn
            .query_row(
                "SELECT file_size, file_name, result_json, created_at
                 FROM analysis_cache WHERE content_hash = ?1",
                params![content_hash],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((size, file_name, json, created_at)) = row else {
            return Ok(None);
        };
        let result: ExtractionResult =
            serde_json::from_str(&json).map_err(|source| DbError::CorruptRow {
                hash: content_hash.to_string(),
                source,
            })?;

        Ok(Some(CacheEntry {
            content_hash: content_hash.to_string(),
            file_size: size.max(0) as u64,
            file_name,
            result,
            created_at: parse_ts(&created_at).unwrap_or_else(Utc::now),
        }))
    }

    /// Delete rows older than `days` relative to `now`. Returns rows removed.
    pub fn prune_cache(&self, days: u32, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = format_ts(now - Duration::days(i64::from(days)));
        let removed = self.conn.execute(
            "DELETE FROM analysis_cache WHERE created_at < ?1",
            params![cutoff],
        )?;
        Ok(removed)
    }

    pub fn clear_cache(&self) -> Result<usize> {
        Ok(self.conn.execute("DELETE FROM analysis_cache", [])?)
    }

    pub fn cache_stats(&self) -> Result<CacheStats> {
        let (entries, bytes, oldest, newest) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(file_size), 0), MIN(created_at), MAX(created_at)
             FROM analysis_cache",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<String>>(2)?,
                    row.get::<_, Option<String>>(3)?,
                ))
            },
        )?;

        Ok(CacheStats {
            entries: entries.max(0) as u64,
            total_bytes_analyzed: bytes.max(0) as u64,
            oldest: oldest.as_deref().and_then(parse_ts),
            newest: newest.as_deref().and_then(parse_ts),
        })
    }
}
