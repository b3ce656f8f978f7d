//! libSQL storage layer for topics, citations, content, and crawl state.
//!
//! The [`Storage`] struct wraps a libSQL database holding topics, fetched
//! source pages, citations, persisted content, memories, the crawl frontier,
//! stop flags, and crawl run history.
//!
//! Uniqueness is enforced by the schema, not by callers:
//! - content: one row per `(patch_id, canonical_url)`
//! - citations: one row per `(source_page_id, source_number)` and per
//!   `(source_page_id, canonical_url)`

mod citations;
mod content;
mod frontier;
mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use libsql::{Connection, Database, params};
use patchscout_shared::{PatchScoutError, Result, RunOutcome, Topic, new_id};

pub use citations::{DecisionCounts, NewCitation};

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

/// Map a libSQL error into the storage error variant.
pub(crate) fn db_err(e: libsql::Error) -> PatchScoutError {
    PatchScoutError::Storage(e.to_string())
}

/// Parse an RFC 3339 column value.
pub(crate) fn parse_ts(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| PatchScoutError::Storage(format!("invalid date '{s}': {e}")))
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| PatchScoutError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode (for dry runs and reporting).
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        PatchScoutError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    pub(crate) fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(PatchScoutError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn conn(&self) -> &Connection {
        &self.conn
    }

    // -----------------------------------------------------------------------
    // Topic operations
    // -----------------------------------------------------------------------

    /// Insert a new topic. Fails if the handle is already taken.
    pub async fn insert_topic(&self, topic: &Topic) -> Result<()> {
        self.check_writable()?;
        let aliases = serde_json::to_string(&topic.aliases)
            .map_err(|e| PatchScoutError::Storage(e.to_string()))?;
        let tags = serde_json::to_string(&topic.tags)
            .map_err(|e| PatchScoutError::Storage(e.to_string()))?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO topics (id, handle, title, aliases_json, tags_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    topic.id.as_str(),
                    topic.handle.as_str(),
                    topic.title.as_str(),
                    aliases,
                    tags,
                    now
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Look up a topic by its handle.
    pub async fn get_topic_by_handle(&self, handle: &str) -> Result<Option<Topic>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, handle, title, aliases_json, tags_json FROM topics WHERE handle = ?1",
                params![handle],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_topic(&row)?)),
            None => Ok(None),
        }
    }

    /// List all topics ordered by handle.
    pub async fn list_topics(&self) -> Result<Vec<Topic>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, handle, title, aliases_json, tags_json FROM topics ORDER BY handle",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_topic(&row)?);
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Source page operations
    // -----------------------------------------------------------------------

    /// Record a fetched page, returning its id. Re-fetching the same
    /// canonical URL refreshes the row instead of creating another.
    pub async fn upsert_source_page(
        &self,
        patch_id: &str,
        url: &str,
        canonical_url: &str,
        title: Option<&str>,
    ) -> Result<String> {
        self.check_writable()?;
        let id = new_id();
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn
            .query(
                "INSERT INTO source_pages (id, patch_id, url, canonical_url, title, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(patch_id, canonical_url) DO UPDATE SET
                   title = COALESCE(excluded.title, source_pages.title),
                   fetched_at = excluded.fetched_at
                 RETURNING id",
                params![id.as_str(), patch_id, url, canonical_url, title, now],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<String>(0).map_err(db_err),
            None => Err(PatchScoutError::Storage(format!(
                "upsert of source page {canonical_url} returned no id"
            ))),
        }
    }

    // -----------------------------------------------------------------------
    // Stop flags
    // -----------------------------------------------------------------------

    /// Ask any running crawl for `patch_id` to stop at its next iteration.
    pub async fn request_stop(&self, patch_id: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO stop_flags (patch_id, requested_at) VALUES (?1, ?2)
                 ON CONFLICT(patch_id) DO UPDATE SET requested_at = excluded.requested_at",
                params![patch_id, now],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn clear_stop(&self, patch_id: &str) -> Result<()> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM stop_flags WHERE patch_id = ?1", params![patch_id])
            .await
            .map_err(db_err)?;
        Ok(())
    }

    pub async fn is_stop_requested(&self, patch_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM stop_flags WHERE patch_id = ?1",
                params![patch_id],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    // -----------------------------------------------------------------------
    // Crawl run operations
    // -----------------------------------------------------------------------

    /// Insert a new crawl run. Returns the generated run ID.
    pub async fn insert_crawl_run(&self, patch_id: &str) -> Result<String> {
        self.check_writable()?;
        let id = new_id();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO crawl_runs (id, patch_id, started_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), patch_id, now],
            )
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    /// Mark a crawl run finished with its outcome and stats.
    pub async fn finish_crawl_run(
        &self,
        run_id: &str,
        outcome: RunOutcome,
        stats_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let outcome = match outcome {
            RunOutcome::Completed => "completed",
            RunOutcome::Aborted => "aborted",
        };
        self.conn
            .execute(
                "UPDATE crawl_runs SET finished_at = ?1, outcome = ?2, stats_json = ?3 WHERE id = ?4",
                params![now, outcome, stats_json, run_id],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Most recent run for a topic.
    pub async fn last_crawl_run(&self, patch_id: &str) -> Result<Option<CrawlRunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, started_at, finished_at, outcome, stats_json FROM crawl_runs
                 WHERE patch_id = ?1 ORDER BY started_at DESC, id DESC LIMIT 1",
                params![patch_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let started: String = row.get(1).map_err(db_err)?;
                let finished: Option<String> = row.get(2).map_err(db_err)?;
                Ok(Some(CrawlRunRecord {
                    id: row.get(0).map_err(db_err)?,
                    started_at: parse_ts(&started)?,
                    finished_at: finished.as_deref().map(parse_ts).transpose()?,
                    outcome: row.get(3).map_err(db_err)?,
                    stats_json: row.get(4).map_err(db_err)?,
                }))
            }
            None => Ok(None),
        }
    }
}

/// A row of the crawl run history.
#[derive(Debug, Clone)]
pub struct CrawlRunRecord {
    pub id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<String>,
    pub stats_json: Option<String>,
}

/// Convert a database row to a [`Topic`].
fn row_to_topic(row: &libsql::Row) -> Result<Topic> {
    let aliases: String = row.get(3).map_err(db_err)?;
    let tags: String = row.get(4).map_err(db_err)?;
    Ok(Topic {
        id: row.get(0).map_err(db_err)?,
        handle: row.get(1).map_err(db_err)?,
        title: row.get(2).map_err(db_err)?,
        aliases: serde_json::from_str(&aliases)
            .map_err(|e| PatchScoutError::Storage(format!("invalid aliases_json: {e}")))?,
        tags: serde_json::from_str(&tags)
            .map_err(|e| PatchScoutError::Storage(format!("invalid tags_json: {e}")))?,
    })
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    /// Create a temp file storage for testing.
    pub async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("ps_test_{}.db", new_id()));
        Storage::open(&tmp).await.expect("open test db")
    }

    /// Storage with one topic inserted; returns the topic id.
    pub async fn storage_with_topic() -> (Storage, String) {
        let storage = test_storage().await;
        let topic = Topic {
            id: new_id(),
            handle: format!("topic-{}", new_id()),
            title: "Rust programming language".into(),
            aliases: vec!["Rust".into()],
            tags: vec!["software".into()],
        };
        storage.insert_topic(&topic).await.expect("insert topic");
        (storage, topic.id)
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("ps_test_{}.db", new_id()));
        let first = Storage::open(&tmp).await.expect("first open");
        drop(first);
        let second = Storage::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 1);
    }

    #[tokio::test]
    async fn topic_crud() {
        let storage = test_storage().await;
        let topic = Topic {
            id: new_id(),
            handle: "ferris".into(),
            title: "Ferris the crab".into(),
            aliases: vec!["Ferris".into(), "rustacean mascot".into()],
            tags: vec!["mascot".into()],
        };
        storage.insert_topic(&topic).await.expect("insert topic");

        let found = storage.get_topic_by_handle("ferris").await.unwrap().unwrap();
        assert_eq!(found, topic);
        assert!(storage.get_topic_by_handle("missing").await.unwrap().is_none());

        // Handles are unique.
        let dup = Topic { id: new_id(), ..topic };
        assert!(storage.insert_topic(&dup).await.is_err());
        assert_eq!(storage.list_topics().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn source_page_upsert_is_stable() {
        let (storage, patch_id) = storage_with_topic().await;
        let first = storage
            .upsert_source_page(&patch_id, "https://en.wikipedia.org/wiki/Rust", "https://en.wikipedia.org/wiki/Rust", Some("Rust"))
            .await
            .unwrap();
        let second = storage
            .upsert_source_page(&patch_id, "http://en.wikipedia.org/wiki/Rust/", "https://en.wikipedia.org/wiki/Rust", None)
            .await
            .unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn stop_flag_lifecycle() {
        let (storage, patch_id) = storage_with_topic().await;
        assert!(!storage.is_stop_requested(&patch_id).await.unwrap());
        storage.request_stop(&patch_id).await.unwrap();
        storage.request_stop(&patch_id).await.unwrap();
        assert!(storage.is_stop_requested(&patch_id).await.unwrap());
        storage.clear_stop(&patch_id).await.unwrap();
        assert!(!storage.is_stop_requested(&patch_id).await.unwrap());
    }

    #[tokio::test]
    async fn crawl_run_lifecycle() {
        let (storage, patch_id) = storage_with_topic().await;
        let run_id = storage.insert_crawl_run(&patch_id).await.unwrap();
        storage
            .finish_crawl_run(&run_id, RunOutcome::Completed, r#"{"fetched": 4}"#)
            .await
            .unwrap();

        let last = storage.last_crawl_run(&patch_id).await.unwrap().unwrap();
        assert_eq!(last.id, run_id);
        assert_eq!(last.outcome.as_deref(), Some("completed"));
        assert!(last.finished_at.is_some());
        assert!(last.stats_json.unwrap().contains("fetched"));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("ps_test_{}.db", new_id()));
        let rw = Storage::open(&tmp).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&tmp).await.unwrap();
        let result = ro.request_stop("p1").await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("read-only"));
    }
}
