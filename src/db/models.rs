use crate::model::ExtractionResult;
use chrono::{DateTime, Utc};

/// A row of the durable analysis cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub content_hash: String,
    pub file_size: u64,
    pub file_name: String,
    pub result: ExtractionResult,
    pub created_at: DateTime<Utc>,
}

/// Summary for `cache stats`.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct CacheStats {
    pub entries: u64,
    pub total_bytes_analyzed: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}
