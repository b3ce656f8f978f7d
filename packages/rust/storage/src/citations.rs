//! Citation rows: append-only insertion and state transitions.

use chrono::Utc;
use libsql::params;
use patchscout_shared::{
    Citation, PatchScoutError, RelevanceDecision, Result, ScanStatus, VerificationStatus, new_id,
};

use crate::{Storage, db_err, parse_ts};

const CITATION_COLUMNS: &str = "id, patch_id, source_page_id, citation_url, canonical_url, title, context,
     source_number, verification_status, scan_status, relevance_decision, ai_priority_score,
     content_text, saved_content_id, error_message, fetch_attempts, created_at, updated_at";

/// Input for [`Storage::insert_citation`].
#[derive(Debug, Clone)]
pub struct NewCitation {
    pub patch_id: String,
    pub source_page_id: String,
    pub citation_url: String,
    pub canonical_url: String,
    pub title: Option<String>,
    pub context: Option<String>,
    pub source_number: u32,
    pub verification_status: VerificationStatus,
}

/// Citation counts per decision for one topic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecisionCounts {
    pub undecided: u64,
    pub saved: u64,
    pub denied: u64,
    pub denied_verify: u64,
    pub internal: u64,
}

impl Storage {
    /// Store a citation unless the source page already has one for the same
    /// canonical URL. Returns `None` for duplicates.
    ///
    /// When the requested `source_number` is already taken on the page (the
    /// page changed between fetches), the citation is appended after the
    /// current highest number.
    pub async fn insert_citation(&self, new: &NewCitation) -> Result<Option<Citation>> {
        self.check_writable()?;

        let mut rows = self
            .conn()
            .query(
                "SELECT
                   EXISTS(SELECT 1 FROM citations WHERE source_page_id = ?1 AND canonical_url = ?2),
                   EXISTS(SELECT 1 FROM citations WHERE source_page_id = ?1 AND source_number = ?3),
                   COALESCE((SELECT MAX(source_number) FROM citations WHERE source_page_id = ?1), 0)",
                params![
                    new.source_page_id.as_str(),
                    new.canonical_url.as_str(),
                    i64::from(new.source_number)
                ],
            )
            .await
            .map_err(db_err)?;
        let (url_taken, number_taken, max_number) = match rows.next().await.map_err(db_err)? {
            Some(row) => (
                row.get::<i64>(0).map_err(db_err)? != 0,
                row.get::<i64>(1).map_err(db_err)? != 0,
                row.get::<i64>(2).map_err(db_err)?,
            ),
            None => (false, false, 0),
        };
        if url_taken {
            return Ok(None);
        }
        let source_number = if number_taken {
            max_number + 1
        } else {
            i64::from(new.source_number)
        };

        let id = new_id();
        let now = Utc::now().to_rfc3339();
        let inserted = self
            .conn()
            .execute(
                "INSERT INTO citations (id, patch_id, source_page_id, citation_url, canonical_url,
                   title, context, source_number, verification_status, scan_status,
                   fetch_attempts, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'not_scanned', 0, ?10, ?10)
                 ON CONFLICT DO NOTHING",
                params![
                    id.as_str(),
                    new.patch_id.as_str(),
                    new.source_page_id.as_str(),
                    new.citation_url.as_str(),
                    new.canonical_url.as_str(),
                    new.title.as_deref(),
                    new.context.as_deref(),
                    source_number,
                    new.verification_status.as_str(),
                    now
                ],
            )
            .await
            .map_err(db_err)?;

        // Lost a race with a concurrent extractor of the same page.
        if inserted == 0 {
            return Ok(None);
        }
        self.get_citation(&id).await
    }

    pub async fn get_citation(&self, id: &str) -> Result<Option<Citation>> {
        let sql = format!("SELECT {CITATION_COLUMNS} FROM citations WHERE id = ?1");
        let mut rows = self.conn().query(&sql, params![id]).await.map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_citation(&row)?)),
            None => Ok(None),
        }
    }

    /// Citations of one source page in page order.
    pub async fn list_citations_for_page(&self, source_page_id: &str) -> Result<Vec<Citation>> {
        let sql = format!(
            "SELECT {CITATION_COLUMNS} FROM citations WHERE source_page_id = ?1 ORDER BY source_number"
        );
        self.query_citations(&sql, params![source_page_id]).await
    }

    /// Undecided external citations of a topic, oldest first.
    pub async fn list_undecided_citations(&self, patch_id: &str, limit: u32) -> Result<Vec<Citation>> {
        let sql = format!(
            "SELECT {CITATION_COLUMNS} FROM citations
             WHERE patch_id = ?1 AND relevance_decision IS NULL AND saved_content_id IS NULL
               AND verification_status != 'pending_wiki'
             ORDER BY created_at, source_number LIMIT ?2"
        );
        self.query_citations(&sql, params![patch_id, i64::from(limit)]).await
    }

    /// Undecided external citations of a topic pointing at `canonical_url`.
    pub async fn list_undecided_by_canonical(
        &self,
        patch_id: &str,
        canonical_url: &str,
    ) -> Result<Vec<Citation>> {
        let sql = format!(
            "SELECT {CITATION_COLUMNS} FROM citations
             WHERE patch_id = ?1 AND canonical_url = ?2 AND relevance_decision IS NULL
               AND saved_content_id IS NULL AND verification_status != 'pending_wiki'
             ORDER BY created_at"
        );
        self.query_citations(&sql, params![patch_id, canonical_url]).await
    }

    /// Citations of a topic with a given decision.
    pub async fn list_citations_by_decision(
        &self,
        patch_id: &str,
        decision: RelevanceDecision,
    ) -> Result<Vec<Citation>> {
        let sql = format!(
            "SELECT {CITATION_COLUMNS} FROM citations
             WHERE patch_id = ?1 AND relevance_decision = ?2 ORDER BY updated_at"
        );
        self.query_citations(&sql, params![patch_id, decision.as_str()]).await
    }

    /// Whether any citation of the topic already points at `canonical_url`.
    pub async fn citation_known(&self, patch_id: &str, canonical_url: &str) -> Result<bool> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM citations WHERE patch_id = ?1 AND canonical_url = ?2 LIMIT 1",
                params![patch_id, canonical_url],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    /// Persist every mutable field of `citation`.
    pub async fn update_citation(&self, citation: &Citation) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        let updated = self
            .conn()
            .execute(
                "UPDATE citations SET
                   verification_status = ?1, scan_status = ?2, relevance_decision = ?3,
                   ai_priority_score = ?4, content_text = ?5, saved_content_id = ?6,
                   error_message = ?7, fetch_attempts = ?8, title = ?9, updated_at = ?10
                 WHERE id = ?11",
                params![
                    citation.verification_status.as_str(),
                    citation.scan_status.as_str(),
                    citation.relevance_decision.map(|d| d.as_str()),
                    citation.ai_priority_score.map(i64::from),
                    citation.content_text.as_deref(),
                    citation.saved_content_id.as_deref(),
                    citation.error_message.as_deref(),
                    i64::from(citation.fetch_attempts),
                    citation.title.as_deref(),
                    now,
                    citation.id.as_str()
                ],
            )
            .await
            .map_err(db_err)?;
        if updated == 0 {
            return Err(PatchScoutError::validation(format!(
                "citation {} does not exist",
                citation.id
            )));
        }
        Ok(())
    }

    /// Decision counts for a topic.
    pub async fn count_citations_by_decision(&self, patch_id: &str) -> Result<DecisionCounts> {
        let mut rows = self
            .conn()
            .query(
                "SELECT
                   SUM(CASE WHEN relevance_decision IS NULL AND verification_status != 'pending_wiki' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN relevance_decision = 'saved' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN relevance_decision = 'denied' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN relevance_decision = 'denied_verify' THEN 1 ELSE 0 END),
                   SUM(CASE WHEN verification_status = 'pending_wiki' THEN 1 ELSE 0 END)
                 FROM citations WHERE patch_id = ?1",
                params![patch_id],
            )
            .await
            .map_err(db_err)?;

        let Some(row) = rows.next().await.map_err(db_err)? else {
            return Ok(DecisionCounts::default());
        };
        let count = |idx: i32| -> Result<u64> {
            Ok(row.get::<Option<i64>>(idx).map_err(db_err)?.unwrap_or(0) as u64)
        };
        Ok(DecisionCounts {
            undecided: count(0)?,
            saved: count(1)?,
            denied: count(2)?,
            denied_verify: count(3)?,
            internal: count(4)?,
        })
    }

    async fn query_citations(&self, sql: &str, params: impl libsql::params::IntoParams) -> Result<Vec<Citation>> {
        let mut rows = self.conn().query(sql, params).await.map_err(db_err)?;
        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_citation(&row)?);
        }
        Ok(results)
    }
}

/// Convert a database row to a [`Citation`].
fn row_to_citation(row: &libsql::Row) -> Result<Citation> {
    let verification: String = row.get(8).map_err(db_err)?;
    let scan: String = row.get(9).map_err(db_err)?;
    let decision: Option<String> = row.get(10).map_err(db_err)?;
    let created: String = row.get(16).map_err(db_err)?;
    let updated: String = row.get(17).map_err(db_err)?;

    Ok(Citation {
        id: row.get(0).map_err(db_err)?,
        patch_id: row.get(1).map_err(db_err)?,
        source_page_id: row.get(2).map_err(db_err)?,
        citation_url: row.get(3).map_err(db_err)?,
        canonical_url: row.get(4).map_err(db_err)?,
        title: row.get(5).map_err(db_err)?,
        context: row.get(6).map_err(db_err)?,
        source_number: row.get::<i64>(7).map_err(db_err)? as u32,
        verification_status: verification.parse::<VerificationStatus>()?,
        scan_status: scan.parse::<ScanStatus>()?,
        relevance_decision: decision
            .as_deref()
            .map(str::parse::<RelevanceDecision>)
            .transpose()?,
        ai_priority_score: row
            .get::<Option<i64>>(11)
            .map_err(db_err)?
            .map(|v| v.clamp(0, 100) as u8),
        content_text: row.get(12).map_err(db_err)?,
        saved_content_id: row.get(13).map_err(db_err)?,
        error_message: row.get(14).map_err(db_err)?,
        fetch_attempts: row.get::<i64>(15).map_err(db_err)? as u32,
        created_at: parse_ts(&created)?,
        updated_at: parse_ts(&updated)?,
    })
}
