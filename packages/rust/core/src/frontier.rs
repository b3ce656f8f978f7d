//! Frontier Store port and its implementations.
//!
//! The orchestrator only relies on two properties: `pop` is atomic across
//! concurrent callers sharing a topic, and a re-pushed candidate is
//! eventually delivered again. [`Storage`] satisfies both with a single
//! `DELETE ... RETURNING`; [`MemoryFrontier`] with a mutex. Dry runs and
//! tests use the latter.

use std::cmp::Reverse;
use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use patchscout_shared::{Candidate, Result, canonicalize};
use patchscout_storage::Storage;

/// Provider tag for operator-supplied seed URLs.
pub const SEED_PROVIDER: &str = "seed";
/// Provider tag for URLs discovered as citations.
pub const CITATION_PROVIDER: &str = "citation";
/// Seeds pop before discovered citations.
pub const SEED_PRIORITY: i32 = 10;
/// Candidates held back by a guard pop after every fresh candidate.
pub const HELD_PRIORITY: i32 = -1;

/// A per-topic queue of crawl candidates.
#[async_trait]
pub trait FrontierStore: Send + Sync {
    async fn push(&self, topic_id: &str, candidate: &Candidate) -> Result<()>;

    /// Remove and return the next candidate, or `None` when the topic's
    /// queue is empty.
    async fn pop(&self, topic_id: &str) -> Result<Option<Candidate>>;
}

#[async_trait]
impl FrontierStore for Storage {
    async fn push(&self, topic_id: &str, candidate: &Candidate) -> Result<()> {
        self.frontier_push(topic_id, candidate).await
    }

    async fn pop(&self, topic_id: &str) -> Result<Option<Candidate>> {
        self.frontier_pop(topic_id).await
    }
}

/// In-process frontier with the same ordering as the SQL one: highest
/// priority first, FIFO within a priority.
#[derive(Default)]
pub struct MemoryFrontier {
    inner: Mutex<MemoryQueues>,
}

#[derive(Default)]
struct MemoryQueues {
    next_seq: u64,
    topics: HashMap<String, BTreeMap<(Reverse<i32>, u64), Candidate>>,
}

impl MemoryFrontier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frontier pre-loaded with `candidates` (in pop order) for one topic.
    pub fn from_candidates(topic_id: &str, candidates: Vec<Candidate>) -> Self {
        let mut queues = MemoryQueues::default();
        for candidate in candidates {
            queues.insert(topic_id, candidate);
        }
        Self {
            inner: Mutex::new(queues),
        }
    }

    pub async fn len(&self, topic_id: &str) -> usize {
        self.inner
            .lock()
            .await
            .topics
            .get(topic_id)
            .map_or(0, BTreeMap::len)
    }

    pub async fn is_empty(&self, topic_id: &str) -> bool {
        self.len(topic_id).await == 0
    }
}

impl MemoryQueues {
    fn insert(&mut self, topic_id: &str, candidate: Candidate) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.topics
            .entry(topic_id.to_string())
            .or_default()
            .insert((Reverse(candidate.priority), seq), candidate);
    }
}

#[async_trait]
impl FrontierStore for MemoryFrontier {
    async fn push(&self, topic_id: &str, candidate: &Candidate) -> Result<()> {
        self.inner.lock().await.insert(topic_id, candidate.clone());
        Ok(())
    }

    async fn pop(&self, topic_id: &str) -> Result<Option<Candidate>> {
        let mut queues = self.inner.lock().await;
        Ok(queues
            .topics
            .get_mut(topic_id)
            .and_then(|queue| queue.pop_first())
            .map(|(_, candidate)| candidate))
    }
}

// ---------------------------------------------------------------------------
// Seeding
// ---------------------------------------------------------------------------

/// Result of [`seed`].
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SeedReport {
    pub accepted: usize,
    /// Inputs that are not http(s) URLs.
    pub rejected: Vec<String>,
}

/// Push operator-supplied URLs as `seed` candidates. Unparseable inputs are
/// reported and skipped.
pub async fn seed(
    frontier: &dyn FrontierStore,
    topic_id: &str,
    urls: &[String],
) -> Result<SeedReport> {
    let mut report = SeedReport::default();
    for raw in urls {
        let raw = raw.trim();
        if canonicalize(raw).is_none() {
            warn!(url = %raw, reason = "invalid_url", "skipping seed");
            report.rejected.push(raw.to_string());
            continue;
        }
        let candidate = Candidate::new(raw, SEED_PROVIDER).with_priority(SEED_PRIORITY);
        frontier.push(topic_id, &candidate).await?;
        debug!(url = %raw, "seeded");
        report.accepted += 1;
    }
    Ok(report)
}
