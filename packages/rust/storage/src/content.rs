//! Content and memory rows. Both are idempotent on `(patch_id, canonical_url)`:
//! a second save of the same canonical URL returns the existing row.

use chrono::Utc;
use libsql::params;
use patchscout_shared::{
    Content, ContentDraft, Memory, PatchScoutError, Result, SavedContent, canonicalize, new_id,
};
use sha2::{Digest, Sha256};

use crate::{Storage, db_err, parse_ts};

const CONTENT_COLUMNS: &str = "id, patch_id, canonical_url, url, title, text, text_hash,
     relevance_score, quality_score, created_at";

impl Storage {
    /// Upsert a content row keyed by the draft URL's canonical form.
    ///
    /// When another writer already saved the same canonical URL for the
    /// topic, the existing id is returned with `created = false`.
    pub async fn save_content(&self, patch_id: &str, draft: &ContentDraft) -> Result<SavedContent> {
        self.check_writable()?;
        let canonical = canonicalize(&draft.url).ok_or_else(|| {
            PatchScoutError::validation(format!("cannot canonicalize content url '{}'", draft.url))
        })?;

        let id = new_id();
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO content (id, patch_id, canonical_url, url, title, text, text_hash,
                   relevance_score, quality_score, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(patch_id, canonical_url) DO NOTHING",
                params![
                    id.as_str(),
                    patch_id,
                    canonical.as_str(),
                    draft.url.as_str(),
                    draft.title.as_str(),
                    draft.text.as_str(),
                    compute_hash(&draft.text),
                    i64::from(draft.relevance_score),
                    i64::from(draft.quality_score),
                    now
                ],
            )
            .await
            .map_err(db_err)?;

        if inserted == 1 {
            return Ok(SavedContent { id, created: true });
        }

        match self.get_content_by_canonical(patch_id, &canonical).await? {
            Some(existing) => {
                tracing::debug!(%canonical, content_id = %existing.id, reason = "save_conflict", "content already saved");
                Ok(SavedContent {
                    id: existing.id,
                    created: false,
                })
            }
            None => Err(PatchScoutError::Storage(format!(
                "content insert for {canonical} conflicted but no row exists"
            ))),
        }
    }

    pub async fn get_content(&self, id: &str) -> Result<Option<Content>> {
        let sql = format!("SELECT {CONTENT_COLUMNS} FROM content WHERE id = ?1");
        let mut rows = self.conn().query(&sql, params![id]).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_content(&row)?)),
            None => Ok(None),
        }
    }

    pub async fn get_content_by_canonical(
        &self,
        patch_id: &str,
        canonical_url: &str,
    ) -> Result<Option<Content>> {
        let sql = format!(
            "SELECT {CONTENT_COLUMNS} FROM content WHERE patch_id = ?1 AND canonical_url = ?2"
        );
        let mut rows = self
            .conn()
            .query(&sql, params![patch_id, canonical_url])
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_content(&row)?)),
            None => Ok(None),
        }
    }

    /// Number of content rows saved for a topic.
    pub async fn count_content(&self, patch_id: &str) -> Result<u64> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM content WHERE patch_id = ?1",
                params![patch_id],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)? as u64),
            None => Ok(0),
        }
    }

    /// Create a memory entry, or return the existing one for the same
    /// canonical URL.
    pub async fn save_memory(
        &self,
        patch_id: &str,
        content_id: Option<&str>,
        url: &str,
        title: &str,
        summary: &str,
    ) -> Result<String> {
        self.check_writable()?;
        let canonical = canonicalize(url).ok_or_else(|| {
            PatchScoutError::validation(format!("cannot canonicalize memory url '{url}'"))
        })?;
        let id = new_id();
        let now = Utc::now().to_rfc3339();
        let mut rows = self
            .conn()
            .query(
                "INSERT INTO memories (id, patch_id, content_id, canonical_url, title, summary, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(patch_id, canonical_url) DO UPDATE SET
                   content_id = COALESCE(memories.content_id, excluded.content_id)
                 RETURNING id",
                params![id.as_str(), patch_id, content_id, canonical.as_str(), title, summary, now],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => row.get::<String>(0).map_err(db_err),
            None => Err(PatchScoutError::Storage(format!(
                "memory upsert for {canonical} returned no id"
            ))),
        }
    }

    pub async fn get_memory_by_canonical(
        &self,
        patch_id: &str,
        canonical_url: &str,
    ) -> Result<Option<Memory>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, patch_id, content_id, canonical_url, title, summary, created_at
                 FROM memories WHERE patch_id = ?1 AND canonical_url = ?2",
                params![patch_id, canonical_url],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let created: String = row.get(6).map_err(db_err)?;
                Ok(Some(Memory {
                    id: row.get(0).map_err(db_err)?,
                    patch_id: row.get(1).map_err(db_err)?,
                    content_id: row.get(2).map_err(db_err)?,
                    canonical_url: row.get(3).map_err(db_err)?,
                    title: row.get(4).map_err(db_err)?,
                    summary: row.get(5).map_err(db_err)?,
                    created_at: parse_ts(&created)?,
                }))
            }
            None => Ok(None),
        }
    }
}

/// Convert a database row to a [`Content`].
fn row_to_content(row: &libsql::Row) -> Result<Content> {
    let created: String = row.get(9).map_err(db_err)?;
    Ok(Content {
        id: row.get(0).map_err(db_err)?,
        patch_id: row.get(1).map_err(db_err)?,
        canonical_url: row.get(2).map_err(db_err)?,
        url: row.get(3).map_err(db_err)?,
        title: row.get(4).map_err(db_err)?,
        text: row.get(5).map_err(db_err)?,
        text_hash: row.get(6).map_err(db_err)?,
        relevance_score: row.get::<i64>(7).map_err(db_err)?.clamp(0, 100) as u8,
        quality_score: row.get::<i64>(8).map_err(db_err)?.clamp(0, 100) as u8,
        created_at: parse_ts(&created)?,
    })
}

/// Compute SHA-256 hash of content text.
fn compute_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    format!("{:x}", hasher.finalize())
}
