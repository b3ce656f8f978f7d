//! Relevance scoring and save decisions for individual citations.
//!
//! `reprocess` walks one citation through fetch → extract → score → save.
//! Every step that can fail is caught per citation: a failure leaves the
//! citation retryable (or finalizes it once its fetch attempts run out) and
//! never aborts sibling citations in a batch.
//!
//! Content and memory writes go through the [`ContentSink`] port. The sink
//! must be idempotent on canonical URL; [`StorageSink`] gets that from the
//! `(patch_id, canonical_url)` uniqueness constraint.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};
use url::Url;

use patchscout_crawler::{PageFetcher, ReadableText, extract_readable, truncate_chars};
use patchscout_shared::{
    Citation, ContentDraft, PatchScoutError, RelevanceConfig, RelevanceDecision, Result,
    SavedContent, ScanStatus, VerificationStatus,
};
use patchscout_storage::Storage;

use crate::limiter::ConcurrencyLimiter;
use crate::scoring::{RelevanceScorer, ScoringInput};

/// Characters of content text kept as a memory summary.
const MEMORY_SUMMARY_CHARS: usize = 500;

/// Options for [`SavePipeline::reprocess`].
#[derive(Debug, Clone)]
pub struct ReprocessOptions {
    /// Topic display title, passed to the scorer.
    pub topic_name: String,
    pub topic_handle: String,
    pub aliases: Vec<String>,
    /// Persist qualifying citations as content. When off, qualifying
    /// citations are scored and left undecided.
    pub save_as_content: bool,
    /// Also create a memory entry for saved content.
    pub save_as_memory: bool,
}

/// Result of one `reprocess` call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReprocessOutcome {
    /// A decision was reached (saved or denied).
    pub processed: bool,
    pub saved: bool,
}

/// Aggregate of a [`SavePipeline::reprocess_batch`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub processed: usize,
    pub saved: usize,
    /// Citations that could not be loaded or whose task failed.
    pub failed: usize,
}

// ---------------------------------------------------------------------------
// Save port
// ---------------------------------------------------------------------------

/// Where accepted citations are persisted.
#[async_trait]
pub trait ContentSink: Send + Sync {
    /// Upsert content for `draft.url`. Saving a canonical URL that already
    /// has content returns the existing id.
    async fn save_as_content(&self, draft: &ContentDraft) -> Result<SavedContent>;

    /// Optionally index saved content as a memory; returns the memory id.
    async fn save_as_memory(
        &self,
        content_id: &str,
        url: &str,
        title: &str,
        text: &str,
    ) -> Result<Option<String>>;
}

/// [`ContentSink`] writing to the topic's content and memory tables.
pub struct StorageSink {
    storage: Arc<Storage>,
    patch_id: String,
}

impl StorageSink {
    pub fn new(storage: Arc<Storage>, patch_id: impl Into<String>) -> Self {
        Self {
            storage,
            patch_id: patch_id.into(),
        }
    }
}

#[async_trait]
impl ContentSink for StorageSink {
    async fn save_as_content(&self, draft: &ContentDraft) -> Result<SavedContent> {
        self.storage.save_content(&self.patch_id, draft).await
    }

    async fn save_as_memory(
        &self,
        content_id: &str,
        url: &str,
        title: &str,
        text: &str,
    ) -> Result<Option<String>> {
        let summary = truncate_chars(text, MEMORY_SUMMARY_CHARS);
        self.storage
            .save_memory(&self.patch_id, Some(content_id), url, title, &summary)
            .await
            .map(Some)
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Scores citations and persists the ones that clear the save threshold.
/// Cheap to clone; clones share every collaborator.
#[derive(Clone)]
pub struct SavePipeline {
    storage: Arc<Storage>,
    fetcher: Arc<dyn PageFetcher>,
    scorer: Arc<dyn RelevanceScorer>,
    sink: Arc<dyn ContentSink>,
    config: RelevanceConfig,
}

impl SavePipeline {
    pub fn new(
        storage: Arc<Storage>,
        fetcher: Arc<dyn PageFetcher>,
        scorer: Arc<dyn RelevanceScorer>,
        sink: Arc<dyn ContentSink>,
        config: RelevanceConfig,
    ) -> Self {
        Self {
            storage,
            fetcher,
            scorer,
            sink,
            config,
        }
    }

    pub fn config(&self) -> &RelevanceConfig {
        &self.config
    }

    /// Walk one citation to a decision.
    ///
    /// Only loading the citation can fail; everything after that is caught
    /// and recorded on the citation.
    #[instrument(skip(self, opts), fields(topic = %opts.topic_handle))]
    pub async fn reprocess(
        &self,
        citation_id: &str,
        opts: &ReprocessOptions,
    ) -> Result<ReprocessOutcome> {
        let mut citation = self.storage.get_citation(citation_id).await?.ok_or_else(|| {
            PatchScoutError::validation(format!("citation {citation_id} does not exist"))
        })?;

        if citation.is_decided() {
            debug!(reason = "already_decided", "skipping citation");
            return Ok(ReprocessOutcome::default());
        }
        if citation.is_internal() {
            debug!(reason = "internal", "skipping citation");
            return Ok(ReprocessOutcome::default());
        }

        match self.process(&mut citation, opts).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(
                    url = %citation.citation_url,
                    reason = e.reason_code(),
                    error = %e,
                    "citation processing failed"
                );
                citation.error_message = Some(e.to_string());
                if citation.scan_status == ScanStatus::Scanning {
                    citation.scan_status = ScanStatus::NotScanned;
                }
                if let Err(update_err) = self.storage.update_citation(&citation).await {
                    warn!(error = %update_err, "failed to record citation error");
                }
                Ok(ReprocessOutcome::default())
            }
        }
    }

    /// Reprocess many citations under `limiter`. One citation's failure
    /// never affects another.
    pub async fn reprocess_batch(
        &self,
        citation_ids: &[String],
        opts: &ReprocessOptions,
        limiter: &ConcurrencyLimiter,
    ) -> BatchReport {
        let opts = Arc::new(opts.clone());
        let mut handles = Vec::with_capacity(citation_ids.len());

        for id in citation_ids {
            let pipeline = self.clone();
            let limiter = limiter.clone();
            let opts = Arc::clone(&opts);
            let id = id.clone();
            handles.push(tokio::spawn(async move {
                limiter.run(pipeline.reprocess(&id, &opts)).await
            }));
        }

        let mut report = BatchReport::default();
        for handle in handles {
            match handle.await {
                Ok(Ok(outcome)) => {
                    report.processed += usize::from(outcome.processed);
                    report.saved += usize::from(outcome.saved);
                }
                Ok(Err(e)) => {
                    warn!(reason = e.reason_code(), error = %e, "citation could not be loaded");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!(error = %e, "reprocess task failed");
                    report.failed += 1;
                }
            }
        }

        info!(
            processed = report.processed,
            saved = report.saved,
            failed = report.failed,
            "batch reprocessed"
        );
        report
    }

    /// Store fetched text on a citation so a later `reprocess` skips the fetch.
    pub async fn attach_text(&self, citation: &mut Citation, readable: &ReadableText) -> Result<()> {
        apply_fetched(citation, readable);
        self.storage.update_citation(citation).await
    }

    /// Count a failed fetch against a citation. After
    /// `max_fetch_attempts` failures the citation is finalized as
    /// `denied_verify`; before that it stays `not_scanned` for a retry.
    pub async fn record_fetch_failure(
        &self,
        citation: &mut Citation,
        error: &PatchScoutError,
    ) -> Result<()> {
        citation.verification_status = VerificationStatus::Failed;
        citation.error_message = Some(error.to_string());
        citation.fetch_attempts += 1;

        if citation.fetch_attempts >= self.config.max_fetch_attempts {
            citation.scan_status = ScanStatus::ScannedDenied;
            citation.relevance_decision = Some(RelevanceDecision::DeniedVerify);
            info!(
                url = %citation.citation_url,
                attempts = citation.fetch_attempts,
                reason = error.reason_code(),
                "citation unreachable, giving up"
            );
        } else {
            citation.scan_status = ScanStatus::NotScanned;
            debug!(
                url = %citation.citation_url,
                attempts = citation.fetch_attempts,
                reason = error.reason_code(),
                "citation fetch failed, will retry"
            );
        }
        self.storage.update_citation(citation).await
    }

    async fn process(
        &self,
        citation: &mut Citation,
        opts: &ReprocessOptions,
    ) -> Result<ReprocessOutcome> {
        // Step 1: content, fetched only if not already attached.
        let text = match citation.content_text.clone() {
            Some(text) => text,
            None => match self.fetch_readable(&citation.citation_url).await {
                Ok(readable) => {
                    apply_fetched(citation, &readable);
                    readable.text
                }
                Err(e @ PatchScoutError::Fetch { .. }) => {
                    self.record_fetch_failure(citation, &e).await?;
                    return Ok(ReprocessOutcome::default());
                }
                Err(e) => return Err(e),
            },
        };

        citation.scan_status = ScanStatus::Scanning;
        self.storage.update_citation(citation).await?;

        // Step 2: sufficiency.
        let chars = text.chars().count();
        if chars < self.config.min_content_chars {
            citation.scan_status = ScanStatus::ScannedDenied;
            citation.relevance_decision = Some(RelevanceDecision::Denied);
            self.storage.update_citation(citation).await?;
            debug!(
                url = %citation.citation_url,
                chars,
                reason = "content_insufficient",
                "citation denied"
            );
            return Ok(ReprocessOutcome {
                processed: true,
                saved: false,
            });
        }

        // Step 3: score.
        let input = ScoringInput {
            url: &citation.citation_url,
            title: citation.title.as_deref(),
            text: &text,
        };
        let score = self
            .scorer
            .score(&input, &opts.topic_name, &opts.aliases)
            .await?
            .min(100);
        citation.ai_priority_score = Some(score);

        if score < self.config.save_threshold {
            citation.scan_status = ScanStatus::Scanned;
            citation.relevance_decision = Some(RelevanceDecision::Denied);
            self.storage.update_citation(citation).await?;
            debug!(url = %citation.citation_url, score, reason = "below_threshold", "citation denied");
            return Ok(ReprocessOutcome {
                processed: true,
                saved: false,
            });
        }

        if !opts.save_as_content {
            citation.scan_status = ScanStatus::Scanned;
            self.storage.update_citation(citation).await?;
            return Ok(ReprocessOutcome {
                processed: true,
                saved: false,
            });
        }

        // Step 4: save.
        let title = citation
            .title
            .clone()
            .unwrap_or_else(|| citation.citation_url.clone());
        let draft = ContentDraft {
            url: citation.citation_url.clone(),
            title: title.clone(),
            text: text.clone(),
            relevance_score: score,
            quality_score: score,
        };
        let saved = self.sink.save_as_content(&draft).await?;
        if !saved.created {
            debug!(content_id = %saved.id, reason = "save_conflict", "content already existed");
        }

        if opts.save_as_memory {
            if let Err(e) = self
                .sink
                .save_as_memory(&saved.id, &citation.citation_url, &title, &text)
                .await
            {
                warn!(content_id = %saved.id, reason = e.reason_code(), error = %e, "memory save failed");
            }
        }

        citation.scan_status = ScanStatus::Scanned;
        citation.relevance_decision = Some(RelevanceDecision::Saved);
        citation.saved_content_id = Some(saved.id.clone());
        citation.error_message = None;
        self.storage.update_citation(citation).await?;

        info!(
            url = %citation.citation_url,
            score,
            content_id = %saved.id,
            created = saved.created,
            "citation saved"
        );
        Ok(ReprocessOutcome {
            processed: true,
            saved: true,
        })
    }

    async fn fetch_readable(&self, raw_url: &str) -> Result<ReadableText> {
        let url = Url::parse(raw_url)
            .map_err(|e| PatchScoutError::fetch(raw_url, format!("invalid url: {e}")))?;
        let page = self.fetcher.fetch(&url).await?;
        Ok(extract_readable(&page.html))
    }
}

fn apply_fetched(citation: &mut Citation, readable: &ReadableText) {
    citation.verification_status = VerificationStatus::Verified;
    citation.error_message = None;
    citation.content_text = Some(readable.text.clone());
    if citation.title.is_none() {
        citation.title = readable.title.clone();
    }
}
