//! Durable relational tier, backed by an embedded SQLite-API-compatible engine.

use chrono::{DateTime, Utc};
use libsql::{Builder, Connection, Database};

use crate::error::{Error, Result};
use crate::types::{Record, Tier};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    id TEXT PRIMARY KEY,
    content TEXT NOT NULL,
    tags TEXT NOT NULL,
    context_path TEXT NOT NULL,
    tier TEXT NOT NULL,
    created_at TEXT NOT NULL,
    recalled_count INTEGER NOT NULL DEFAULT 0,
    last_recalled TEXT,
    updated_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_records_tier ON records(tier);
CREATE INDEX IF NOT EXISTS idx_records_created_at ON records(created_at);

CREATE TABLE IF NOT EXISTS windows (
    window_id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL REFERENCES records(id),
    pid INTEGER,
    state TEXT NOT NULL DEFAULT 'OPEN',
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_windows_record_id ON windows(record_id);

CREATE TABLE IF NOT EXISTS review_logs (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    record_id TEXT NOT NULL REFERENCES records(id),
    agent TEXT,
    verdict TEXT,
    score REAL,
    comments TEXT,
    ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_review_logs_record_id ON review_logs(record_id);
"#;

/// Durable store backing the `core` tier.
///
/// Every mutation commits before the call returns; there is no write-behind
/// buffering here, unlike the log tiers.
pub struct CoreTier {
    db: Database,
}

impl CoreTier {
    /// Opens (creating if absent) the relational tier at `path`.
    pub async fn open(path: &std::path::Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Builder::new_local(path.to_string_lossy().to_string())
            .build()
            .await
            .map_err(|e| Error::StorageWrite(format!("failed to open core db: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| Error::StorageWrite(format!("failed to connect to core db: {e}")))?;
        for statement in SCHEMA.split(';').map(str::trim).filter(|s| !s.is_empty()) {
            conn.execute(statement, ())
                .await
                .map_err(|e| Error::StorageWrite(format!("failed to apply core schema: {e}")))?;
        }

        Ok(Self { db })
    }

    fn connect(&self) -> Result<Connection> {
        self.db
            .connect()
            .map_err(|e| Error::StorageWrite(format!("failed to connect to core db: {e}")))
    }

    /// Upserts a record by id.
    pub async fn store(&self, record: &Record) -> Result<()> {
        let conn = self.connect()?;
        let tags_json = serde_json::to_string(&record.tags)?;
        conn.execute(
            "INSERT INTO records (id, content, tags, context_path, tier, created_at, recalled_count, last_recalled, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                content = excluded.content,
                tags = excluded.tags,
                context_path = excluded.context_path,
                tier = excluded.tier,
                recalled_count = excluded.recalled_count,
                last_recalled = excluded.last_recalled,
                updated_at = excluded.updated_at",
            libsql::params![
                record.id.clone(),
                record.content.clone(),
                tags_json,
                record.context_path.clone(),
                record.tier.as_str(),
                record.created_at.to_rfc3339(),
                record.recalled_count.min(i64::MAX as u64) as i64,
                record.last_recalled.map(|t| t.to_rfc3339()),
                Some(Utc::now().to_rfc3339()),
            ],
        )
        .await
        .map_err(|e| Error::StorageWrite(format!("failed to store core record: {e}")))?;

        Ok(())
    }

    /// All core records, newest-first.
    pub async fn load_all(&self) -> Result<Vec<Record>> {
        let conn = self.connect()?;
        let mut rows = conn
            .query(
                "SELECT id, content, tags, context_path, tier, created_at, recalled_count, last_recalled, updated_at
                 FROM records WHERE tier = 'core' ORDER BY created_at DESC",
                (),
            )
            .await
            .map_err(|e| Error::StorageRead(format!("failed to load core records: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::StorageRead(format!("failed to iterate core records: {e}")))?
        {
            out.push(Self::row_to_record(&row)?);
        }
        Ok(out)
    }

    /// Case-insensitive substring search over content, tags (as serialized JSON), and context path.
    pub async fn search(&self, query: &str, limit: usize) -> Result<Vec<Record>> {
        let conn = self.connect()?;
        let pattern = format!("%{query}%");
        let mut rows = conn
            .query(
                "SELECT id, content, tags, context_path, tier, created_at, recalled_count, last_recalled, updated_at
                 FROM records
                 WHERE tier = 'core' AND (content LIKE ? OR tags LIKE ? OR context_path LIKE ?)
                 ORDER BY created_at DESC
                 LIMIT ?",
                libsql::params![
                    pattern.clone(),
                    pattern.clone(),
                    pattern,
                    limit.min(i64::MAX as usize) as i64
                ],
            )
            .await
            .map_err(|e| Error::StorageRead(format!("failed to search core records: {e}")))?;

        let mut out = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| Error::StorageRead(format!("failed to iterate core search results: {e}")))?
        {
            out.push(Self::row_to_record(&row)?);
        }
        Ok(out)
    }

    /// Fetches a single record by id.
    pub async fn get(&self, id: &str) -> Result<Option<Record>> {
        let conn = self.connect()?;
        let mut rows = conn
            .query(
                "SELECT id, content, tags, context_path, tier, created_at, recalled_count, last_recalled, updated_at
                 FROM records WHERE id = ?",
                libsql::params![id.to_string()],
            )
            .await
            .map_err(|e| Error::StorageRead(format!("failed to fetch core record: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| Error::StorageRead(format!("failed to read core record row: {e}")))?
        {
            Some(row) => Ok(Some(Self::row_to_record(&row)?)),
            None => Ok(None),
        }
    }

    /// Synchronously increments `recalled_count` and bumps `updated_at`/`last_recalled`.
    pub async fn increment_recall(&self, id: &str) -> Result<Option<Record>> {
        let conn = self.connect()?;
        let now = Utc::now().to_rfc3339();
        conn.execute(
            "UPDATE records SET recalled_count = recalled_count + 1, last_recalled = ?, updated_at = ? WHERE id = ?",
            libsql::params![now.clone(), now, id.to_string()],
        )
        .await
        .map_err(|e| Error::StorageWrite(format!("failed to increment recall count: {e}")))?;

        self.get(id).await
    }

    /// Inserts a row into `windows` attached to `record_id`. Thin
    /// insert-only helper over a satellite table; not exercised by the
    /// recall path.
    pub async fn attach_window(&self, record_id: &str, pid: Option<i64>) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO windows (record_id, pid, created_at) VALUES (?, ?, ?)",
            libsql::params![record_id.to_string(), pid, Utc::now().to_rfc3339()],
        )
        .await
        .map_err(|e| Error::StorageWrite(format!("failed to attach window: {e}")))?;

        Ok(conn.last_insert_rowid())
    }

    /// Inserts a row into `review_logs` attached to `record_id`. Thin
    /// insert-only helper over a satellite table; not exercised by the
    /// recall path.
    pub async fn attach_review(
        &self,
        record_id: &str,
        agent: &str,
        verdict: &str,
        score: f64,
        comments: &str,
    ) -> Result<i64> {
        let conn = self.connect()?;
        conn.execute(
            "INSERT INTO review_logs (record_id, agent, verdict, score, comments, ts) VALUES (?, ?, ?, ?, ?, ?)",
            libsql::params![
                record_id.to_string(),
                agent.to_string(),
                verdict.to_string(),
                score,
                comments.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| Error::StorageWrite(format!("failed to attach review log: {e}")))?;

        Ok(conn.last_insert_rowid())
    }

    /// Row count in the `records` table for the `core` tier.
    pub async fn count(&self) -> Result<u64> {
        let conn = self.connect()?;
        let mut rows = conn
            .query("SELECT COUNT(*) FROM records WHERE tier = 'core'", ())
            .await
            .map_err(|e| Error::StorageRead(format!("failed to count core records: {e}")))?;
        let row = rows
            .next()
            .await
            .map_err(|e| Error::StorageRead(format!("failed to read core count: {e}")))?;
        match row {
            Some(row) => {
                let count: i64 = row
                    .get(0)
                    .map_err(|e| Error::StorageRead(format!("failed to decode core count: {e}")))?;
                Ok(count.max(0) as u64)
            }
            None => Ok(0),
        }
    }

    fn row_to_record(row: &libsql::Row) -> Result<Record> {
        let id: String = row
            .get(0)
            .map_err(|e| Error::StorageRead(format!("core row missing id: {e}")))?;
        let content: String = row
            .get(1)
            .map_err(|e| Error::StorageRead(format!("core row missing content: {e}")))?;
        let tags_json: String = row
            .get(2)
            .map_err(|e| Error::StorageRead(format!("core row missing tags: {e}")))?;
        let context_path: String = row
            .get(3)
            .map_err(|e| Error::StorageRead(format!("core row missing context_path: {e}")))?;
        let tier_str: String = row
            .get(4)
            .map_err(|e| Error::StorageRead(format!("core row missing tier: {e}")))?;
        let created_at_str: String = row
            .get(5)
            .map_err(|e| Error::StorageRead(format!("core row missing created_at: {e}")))?;
        let recalled_count: i64 = row
            .get(6)
            .map_err(|e| Error::StorageRead(format!("core row missing recalled_count: {e}")))?;
        let last_recalled_str: Option<String> = row.get(7).ok();
        let updated_at_str: Option<String> = row.get(8).ok();

        let tags: Vec<String> = serde_json::from_str(&tags_json)?;
        let tier: Tier = tier_str.parse()?;
        let created_at = parse_rfc3339(&created_at_str)?;
        let last_recalled = last_recalled_str.as_deref().map(parse_rfc3339).transpose()?;
        let updated_at = updated_at_str.as_deref().map(parse_rfc3339).transpose()?;

        Ok(Record {
            id,
            content,
            tags,
            context_path,
            tier,
            created_at,
            recalled_count: recalled_count.max(0) as u64,
            last_recalled,
            stored_at: None,
            updated_at,
            extra: serde_json::Map::new(),
        })
    }
}

fn parse_rfc3339(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::SerializationError(format!("invalid timestamp {s}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn record(id: &str, content: &str, tags: &[&str]) -> Record {
        Record {
            id: id.into(),
            content: content.into(),
            tags: tags.iter().map(|t| (*t).to_string()).collect(),
            context_path: "/t/1".into(),
            tier: Tier::Core,
            created_at: Utc::now(),
            recalled_count: 0,
            last_recalled: None,
            stored_at: None,
            updated_at: None,
            extra: Map::new(),
        }
    }

    #[tokio::test]
    async fn store_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let tier = CoreTier::open(&dir.path().join("core.db")).await.unwrap();
        let r = record("mem_1", "task_id: ABC123", &["task"]);
        tier.store(&r).await.unwrap();
        let fetched = tier.get("mem_1").await.unwrap().unwrap();
        assert_eq!(fetched.content, "task_id: ABC123");
        assert_eq!(fetched.tags, vec!["task".to_string()]);
    }

    #[tokio::test]
    async fn search_is_case_insensitive_like_match() {
        let dir = tempfile::tempdir().unwrap();
        let tier = CoreTier::open(&dir.path().join("core.db")).await.unwrap();
        tier.store(&record("mem_1", "task_id: Hello World", &[])).await.unwrap();
        let results = tier.search("hello", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].id, "mem_1");
    }

    #[tokio::test]
    async fn increment_recall_is_synchronous() {
        let dir = tempfile::tempdir().unwrap();
        let tier = CoreTier::open(&dir.path().join("core.db")).await.unwrap();
        tier.store(&record("mem_1", "task_id: x", &[])).await.unwrap();
        let updated = tier.increment_recall("mem_1").await.unwrap().unwrap();
        assert_eq!(updated.recalled_count, 1);
        assert!(updated.last_recalled.is_some());
    }

    #[tokio::test]
    async fn store_upserts_existing_id() {
        let dir = tempfile::tempdir().unwrap();
        let tier = CoreTier::open(&dir.path().join("core.db")).await.unwrap();
        tier.store(&record("mem_1", "first", &[])).await.unwrap();
        tier.store(&record("mem_1", "second", &[])).await.unwrap();
        assert_eq!(tier.count().await.unwrap(), 1);
        assert_eq!(tier.get("mem_1").await.unwrap().unwrap().content, "second");
    }

    #[tokio::test]
    async fn attach_window_inserts_a_satellite_row() {
        let dir = tempfile::tempdir().unwrap();
        let tier = CoreTier::open(&dir.path().join("core.db")).await.unwrap();
        tier.store(&record("mem_1", "task_id: x", &[])).await.unwrap();
        let window_id = tier.attach_window("mem_1", Some(4242)).await.unwrap();
        assert!(window_id > 0);
    }

    #[tokio::test]
    async fn attach_review_inserts_a_satellite_row() {
        let dir = tempfile::tempdir().unwrap();
        let tier = CoreTier::open(&dir.path().join("core.db")).await.unwrap();
        tier.store(&record("mem_1", "task_id: x", &[])).await.unwrap();
        let review_id = tier
            .attach_review("mem_1", "reviewer-agent", "pass", 0.95, "looks fine")
            .await
            .unwrap();
        assert!(review_id > 0);
    }
}
