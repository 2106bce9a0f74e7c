//! `TrackingStore`: persistent record of processed messages and digests.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DatabaseError;
use crate::pipeline::types::{DigestRecord, PerMessageExtraction};

/// A saved digest row.
#[derive(Debug, Clone)]
pub struct StoredDigest {
    pub id: i64,
    pub date: String,
    pub email_count: u32,
    pub created_at: DateTime<Utc>,
    pub digest_file: Option<String>,
    /// `None` when the stored blob no longer deserializes.
    pub digest: Option<DigestRecord>,
}

/// Date and creation time of the newest digest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DigestStamp {
    pub date: String,
    pub created_at: DateTime<Utc>,
}

/// Store counters, printed by `--stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrackingStats {
    pub total_processed: u64,
    pub processed_last_7_days: u64,
    pub digest_count: u64,
    pub last_digest: Option<DigestStamp>,
}

/// Cross-run state. Every write touches one row by message id, or a set of
/// rows by cutoff timestamp.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError>;

    /// Record a message as processed. Re-marking replaces the earlier row.
    async fn mark_processed(
        &self,
        message_id: &str,
        thread_id: &str,
        subject: &str,
        sender: &str,
        summary: &PerMessageExtraction,
    ) -> Result<(), DatabaseError>;

    async fn all_processed_ids(&self) -> Result<HashSet<String>, DatabaseError>;

    /// Ids processed within the last `days` days.
    async fn processed_since(&self, days: u32) -> Result<Vec<String>, DatabaseError>;

    /// Stored summaries from the last `days` days, newest first.
    async fn recent_summaries(&self, days: u32) -> Result<Vec<PerMessageExtraction>, DatabaseError>;

    /// Save a digest and return its row id.
    async fn save_digest(
        &self,
        date: &str,
        email_count: usize,
        digest_file: Option<&str>,
        digest: &DigestRecord,
    ) -> Result<i64, DatabaseError>;

    /// The newest `count` digests, newest first.
    async fn recent_digests(&self, count: usize) -> Result<Vec<StoredDigest>, DatabaseError>;

    /// Delete rows older than `days` days; returns how many were removed.
    async fn cleanup_older_than(&self, days: u32) -> Result<u64, DatabaseError>;

    async fn stats(&self) -> Result<TrackingStats, DatabaseError>;
}
