//! libSQL backend for [`TrackingStore`].
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! RFC 3339 UTC with whole seconds so cutoff filters can compare strings.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};

use crate::error::DatabaseError;
use crate::pipeline::types::{DigestRecord, PerMessageExtraction};
use crate::store::migrations;
use crate::store::traits::{DigestStamp, StoredDigest, TrackingStats, TrackingStore};

/// libSQL tracking store.
///
/// Holds a single connection that is reused for all operations.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;
        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Tracking database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;
        migrations::run_migrations(&conn).await?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn insert_processed(
        &self,
        message_id: &str,
        thread_id: &str,
        subject: &str,
        sender: &str,
        summary: &PerMessageExtraction,
        processed_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let blob = serde_json::to_string(summary)
            .map_err(|e| DatabaseError::Serialization(format!("summary for {message_id}: {e}")))?;
        self.conn()
            .execute(
                "INSERT OR REPLACE INTO processed_messages
                    (message_id, thread_id, subject, sender, processed_at, summary)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![message_id, thread_id, subject, sender, timestamp(processed_at), blob],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_processed: {e}")))?;
        debug!(id = message_id, "Marked message processed");
        Ok(())
    }

    async fn insert_digest(
        &self,
        date: &str,
        email_count: usize,
        digest_file: Option<&str>,
        digest: &DigestRecord,
        created_at: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let blob = serde_json::to_string(digest)
            .map_err(|e| DatabaseError::Serialization(format!("digest for {date}: {e}")))?;
        let conn = self.conn();
        conn.execute(
            "INSERT INTO digests (date, email_count, created_at, digest_file, digest_data)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![date, email_count as i64, timestamp(created_at), opt_text(digest_file), blob],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("save_digest: {e}")))?;
        Ok(conn.last_insert_rowid())
    }

    async fn count(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<u64, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("count: {e}")))?;
        Ok(row.and_then(|r| r.get::<i64>(0).ok()).unwrap_or(0).max(0) as u64)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn cutoff(days: u32) -> String {
    timestamp(Utc::now() - Duration::days(i64::from(days)))
}

/// Parse an RFC 3339 or SQLite datetime string into `DateTime<Utc>`.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

/// Column order: 0:id, 1:date, 2:email_count, 3:created_at, 4:digest_file, 5:digest_data
fn row_to_digest(row: &libsql::Row) -> Result<StoredDigest, libsql::Error> {
    let id: i64 = row.get(0)?;
    let blob: Option<String> = row.get(5).ok();
    let digest = blob.and_then(|b| match serde_json::from_str::<DigestRecord>(&b) {
        Ok(d) => Some(d),
        Err(e) => {
            warn!(id, error = %e, "Stored digest does not deserialize");
            None
        }
    });

    Ok(StoredDigest {
        id,
        date: row.get::<String>(1).unwrap_or_default(),
        email_count: row.get::<i64>(2).unwrap_or(0).max(0) as u32,
        created_at: row
            .get::<String>(3)
            .map(|s| parse_datetime(&s))
            .unwrap_or(DateTime::<Utc>::MIN_UTC),
        digest_file: row.get(4).ok(),
        digest,
    })
}

#[async_trait]
impl TrackingStore for LibSqlBackend {
    async fn is_processed(&self, message_id: &str) -> Result<bool, DatabaseError> {
        let n = self
            .count(
                "SELECT COUNT(*) FROM processed_messages WHERE message_id = ?1",
                params![message_id],
            )
            .await?;
        Ok(n > 0)
    }

    async fn mark_processed(
        &self,
        message_id: &str,
        thread_id: &str,
        subject: &str,
        sender: &str,
        summary: &PerMessageExtraction,
    ) -> Result<(), DatabaseError> {
        self.insert_processed(message_id, thread_id, subject, sender, summary, Utc::now())
            .await
    }

    async fn all_processed_ids(&self) -> Result<HashSet<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT message_id FROM processed_messages", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("all_processed_ids: {e}")))?;

        let mut ids = HashSet::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<String>(0) {
                ids.insert(id);
            }
        }
        Ok(ids)
    }

    async fn processed_since(&self, days: u32) -> Result<Vec<String>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id FROM processed_messages WHERE processed_at >= ?1
                 ORDER BY processed_at DESC",
                params![cutoff(days)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("processed_since: {e}")))?;

        let mut ids = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            if let Ok(id) = row.get::<String>(0) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    async fn recent_summaries(&self, days: u32) -> Result<Vec<PerMessageExtraction>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT message_id, summary FROM processed_messages
                 WHERE processed_at >= ?1 AND summary IS NOT NULL
                 ORDER BY processed_at DESC",
                params![cutoff(days)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_summaries: {e}")))?;

        let mut summaries = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let id: String = row.get(0).unwrap_or_default();
            let Ok(blob) = row.get::<String>(1) else {
                continue;
            };
            match serde_json::from_str::<PerMessageExtraction>(&blob) {
                Ok(summary) => summaries.push(summary),
                Err(e) => warn!(id = %id, error = %e, "Skipping unreadable stored summary"),
            }
        }
        Ok(summaries)
    }

    async fn save_digest(
        &self,
        date: &str,
        email_count: usize,
        digest_file: Option<&str>,
        digest: &DigestRecord,
    ) -> Result<i64, DatabaseError> {
        let id = self
            .insert_digest(date, email_count, digest_file, digest, Utc::now())
            .await?;
        info!(id, date, email_count, "Saved digest");
        Ok(id)
    }

    async fn recent_digests(&self, count: usize) -> Result<Vec<StoredDigest>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, date, email_count, created_at, digest_file, digest_data
                 FROM digests ORDER BY created_at DESC, id DESC LIMIT ?1",
                params![count as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("recent_digests: {e}")))?;

        let mut digests = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            match row_to_digest(&row) {
                Ok(d) => digests.push(d),
                Err(e) => warn!("Skipping digest row: {e}"),
            }
        }
        Ok(digests)
    }

    async fn cleanup_older_than(&self, days: u32) -> Result<u64, DatabaseError> {
        let cutoff = cutoff(days);
        let conn = self.conn();

        let messages = conn
            .execute(
                "DELETE FROM processed_messages WHERE processed_at < ?1",
                params![cutoff.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cleanup processed_messages: {e}")))?;
        let digests = conn
            .execute("DELETE FROM digests WHERE created_at < ?1", params![cutoff])
            .await
            .map_err(|e| DatabaseError::Query(format!("cleanup digests: {e}")))?;

        let total = messages + digests;
        info!(messages, digests, retention_days = days, "Cleaned up old records");
        Ok(total)
    }

    async fn stats(&self) -> Result<TrackingStats, DatabaseError> {
        let total_processed = self.count("SELECT COUNT(*) FROM processed_messages", ()).await?;
        let processed_last_7_days = self
            .count(
                "SELECT COUNT(*) FROM processed_messages WHERE processed_at >= ?1",
                params![cutoff(7)],
            )
            .await?;
        let digest_count = self.count("SELECT COUNT(*) FROM digests", ()).await?;

        let mut rows = self
            .conn()
            .query(
                "SELECT date, created_at FROM digests ORDER BY created_at DESC, id DESC LIMIT 1",
                (),
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("stats: {e}")))?;
        let last_digest = match rows.next().await {
            Ok(Some(row)) => Some(DigestStamp {
                date: row.get::<String>(0).unwrap_or_default(),
                created_at: row
                    .get::<String>(1)
                    .map(|s| parse_datetime(&s))
                    .unwrap_or(DateTime::<Utc>::MIN_UTC),
            }),
            _ => None,
        };

        Ok(TrackingStats {
            total_processed,
            processed_last_7_days,
            digest_count,
            last_digest,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{CalendarEntry, Event, Priority};

    fn summary(id: &str) -> PerMessageExtraction {
        PerMessageExtraction {
            message_id: id.into(),
            subject: format!("Subject {id}"),
            summary: format!("Summary of {id}"),
            events: vec![Event {
                title: "Assembly".into(),
                date: "Nov 3".into(),
                ..Default::default()
            }],
            importance: Priority::High,
            ..Default::default()
        }
    }

    fn digest() -> DigestRecord {
        DigestRecord {
            executive_summary: "Quiet week.".into(),
            event_calendar: vec![CalendarEntry {
                title: "Assembly".into(),
                date: "Nov 3".into(),
                details: "Gym".into(),
                sources: vec!["Subject a".into()],
                ..Default::default()
            }],
            important_announcements: vec!["Library closed".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn mark_and_query_processed() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        assert!(!db.is_processed("a").await.unwrap());

        db.mark_processed("a", "t", "Subject a", "x@y", &summary("a")).await.unwrap();
        db.mark_processed("b", "t", "Subject b", "x@y", &summary("b")).await.unwrap();

        assert!(db.is_processed("a").await.unwrap());
        let ids = db.all_processed_ids().await.unwrap();
        assert_eq!(ids, HashSet::from(["a".to_string(), "b".to_string()]));
        assert_eq!(db.processed_since(1).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn mark_processed_is_idempotent() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.mark_processed("a", "t", "s", "x", &summary("a")).await.unwrap();
        let mut updated = summary("a");
        updated.summary = "second pass".into();
        db.mark_processed("a", "t", "s", "x", &updated).await.unwrap();

        assert_eq!(db.stats().await.unwrap().total_processed, 1);
        let stored = db.recent_summaries(1).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].summary, "second pass");
    }

    #[tokio::test]
    async fn summaries_round_trip_newest_first() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        db.insert_processed("old", "t", "s", "x", &summary("old"), now - Duration::hours(5))
            .await
            .unwrap();
        db.insert_processed("new", "t", "s", "x", &summary("new"), now).await.unwrap();

        let stored = db.recent_summaries(1).await.unwrap();
        assert_eq!(stored[0], summary("new"));
        assert_eq!(stored[1].message_id, "old");
    }

    #[tokio::test]
    async fn digest_round_trips() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let id = db
            .save_digest("October 20, 2025", 2, Some("output/digest.md"), &digest())
            .await
            .unwrap();

        let digests = db.recent_digests(5).await.unwrap();
        assert_eq!(digests.len(), 1);
        assert_eq!(digests[0].id, id);
        assert_eq!(digests[0].email_count, 2);
        assert_eq!(digests[0].digest_file.as_deref(), Some("output/digest.md"));
        assert_eq!(digests[0].digest.as_ref(), Some(&digest()));
    }

    #[tokio::test]
    async fn cleanup_removes_only_old_rows() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let now = Utc::now();
        db.insert_processed("old", "t", "s", "x", &summary("old"), now - Duration::days(40))
            .await
            .unwrap();
        db.insert_processed("fresh", "t", "s", "x", &summary("fresh"), now).await.unwrap();
        db.insert_digest("old", 1, None, &digest(), now - Duration::days(45)).await.unwrap();
        db.insert_digest("fresh", 1, None, &digest(), now).await.unwrap();

        assert_eq!(db.cleanup_older_than(30).await.unwrap(), 2);
        assert!(!db.is_processed("old").await.unwrap());
        assert!(db.is_processed("fresh").await.unwrap());
        assert_eq!(db.recent_digests(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stats_reflect_contents() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let empty = db.stats().await.unwrap();
        assert_eq!(empty.total_processed, 0);
        assert!(empty.last_digest.is_none());

        let now = Utc::now();
        db.insert_processed("old", "t", "s", "x", &summary("old"), now - Duration::days(10))
            .await
            .unwrap();
        db.mark_processed("new", "t", "s", "x", &summary("new")).await.unwrap();
        db.insert_digest("October 01, 2025", 3, None, &digest(), now - Duration::days(2))
            .await
            .unwrap();
        db.save_digest("October 03, 2025", 1, None, &digest()).await.unwrap();

        let stats = db.stats().await.unwrap();
        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.processed_last_7_days, 1);
        assert_eq!(stats.digest_count, 2);
        assert_eq!(stats.last_digest.unwrap().date, "October 03, 2025");
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("tracking.db");
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.mark_processed("a", "t", "s", "x", &summary("a")).await.unwrap();
        }
        let reopened = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(reopened.is_processed("a").await.unwrap());
    }
}
