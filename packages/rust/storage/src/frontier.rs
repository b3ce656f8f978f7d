//! Persistent crawl frontier: a per-topic priority queue of candidates.
//!
//! Pop is a single `DELETE ... RETURNING` statement, so two callers sharing
//! a topic can never receive the same row.

use chrono::Utc;
use libsql::params;
use patchscout_shared::{Candidate, PatchScoutError, Result, canonicalize};

use crate::{Storage, db_err};

impl Storage {
    /// Append a candidate to the topic's frontier.
    pub async fn frontier_push(&self, patch_id: &str, candidate: &Candidate) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(candidate)
            .map_err(|e| PatchScoutError::Storage(format!("candidate encode: {e}")))?;
        let canonical = canonicalize(&candidate.url).unwrap_or_else(|| candidate.url.clone());
        let now = Utc::now().to_rfc3339();
        self.conn()
            .execute(
                "INSERT INTO frontier (patch_id, canonical_url, priority, candidate_json, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    patch_id,
                    canonical,
                    i64::from(candidate.priority),
                    json,
                    now
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Remove and return the highest-priority, oldest candidate, or `None`
    /// when the frontier is empty.
    pub async fn frontier_pop(&self, patch_id: &str) -> Result<Option<Candidate>> {
        self.check_writable()?;
        let mut rows = self
            .conn()
            .query(
                "DELETE FROM frontier WHERE id = (
                   SELECT id FROM frontier WHERE patch_id = ?1
                   ORDER BY priority DESC, id ASC LIMIT 1
                 )
                 RETURNING candidate_json",
                params![patch_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => {
                let json: String = row.get(0).map_err(db_err)?;
                let candidate = serde_json::from_str(&json)
                    .map_err(|e| PatchScoutError::Storage(format!("candidate decode: {e}")))?;
                Ok(Some(candidate))
            }
            None => Ok(None),
        }
    }

    pub async fn frontier_len(&self, patch_id: &str) -> Result<u64> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM frontier WHERE patch_id = ?1",
                params![patch_id],
            )
            .await
            .map_err(db_err)?;
        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(row.get::<i64>(0).map_err(db_err)? as u64),
            None => Ok(0),
        }
    }

    /// Whether a candidate with this canonical URL is already queued.
    pub async fn frontier_contains(&self, patch_id: &str, canonical_url: &str) -> Result<bool> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM frontier WHERE patch_id = ?1 AND canonical_url = ?2 LIMIT 1",
                params![patch_id, canonical_url],
            )
            .await
            .map_err(db_err)?;
        Ok(rows.next().await.map_err(db_err)?.is_some())
    }

    /// All queued candidates in pop order, without removing them.
    pub async fn frontier_snapshot(&self, patch_id: &str) -> Result<Vec<Candidate>> {
        let mut rows = self
            .conn()
            .query(
                "SELECT candidate_json FROM frontier WHERE patch_id = ?1
                 ORDER BY priority DESC, id ASC",
                params![patch_id],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let json: String = row.get(0).map_err(db_err)?;
            results.push(
                serde_json::from_str(&json)
                    .map_err(|e| PatchScoutError::Storage(format!("candidate decode: {e}")))?,
            );
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::test_storage;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn pop_on_empty_returns_none() {
        let storage = test_storage().await;
        assert!(storage.frontier_pop("p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn pops_by_priority_then_fifo() {
        let storage = test_storage().await;
        storage.frontier_push("p1", &Candidate::new("https://a.test/1", "seed")).await.unwrap();
        storage.frontier_push("p1", &Candidate::new("https://a.test/2", "seed")).await.unwrap();
        storage
            .frontier_push("p1", &Candidate::new("https://a.test/hot", "seed").with_priority(5))
            .await
            .unwrap();
        storage.frontier_push("p2", &Candidate::new("https://b.test/", "seed")).await.unwrap();

        let order: Vec<String> = [
            storage.frontier_pop("p1").await.unwrap(),
            storage.frontier_pop("p1").await.unwrap(),
            storage.frontier_pop("p1").await.unwrap(),
        ]
        .into_iter()
        .map(|c| c.unwrap().url)
        .collect();
        assert_eq!(order, ["https://a.test/hot", "https://a.test/1", "https://a.test/2"]);
        assert!(storage.frontier_pop("p1").await.unwrap().is_none());
        assert_eq!(storage.frontier_len("p2").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn concurrent_pops_never_share_a_candidate() {
        let storage = Arc::new(test_storage().await);
        for i in 0..20 {
            storage
                .frontier_push("p1", &Candidate::new(format!("https://a.test/{i}"), "seed"))
                .await
                .unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let storage = Arc::clone(&storage);
            handles.push(tokio::spawn(async move {
                let mut got = Vec::new();
                while let Some(c) = storage.frontier_pop("p1").await.unwrap() {
                    got.push(c.url);
                }
                got
            }));
        }

        let mut all = Vec::new();
        for handle in handles {
            all.extend(handle.await.unwrap());
        }
        let unique: HashSet<_> = all.iter().collect();
        assert_eq!(all.len(), 20);
        assert_eq!(unique.len(), 20);
    }

    #[tokio::test]
    async fn snapshot_does_not_consume() {
        let storage = test_storage().await;
        let candidate = Candidate::new("https://a.test/x", "seed").contested(None);
        storage.frontier_push("p1", &candidate).await.unwrap();
        assert!(storage.frontier_contains("p1", "https://a.test/x").await.unwrap());

        let snapshot = storage.frontier_snapshot("p1").await.unwrap();
        assert_eq!(snapshot, vec![candidate.clone()]);
        assert_eq!(storage.frontier_pop("p1").await.unwrap(), Some(candidate));
    }
}
