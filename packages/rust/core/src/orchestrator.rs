//! Crawl orchestrator: the control loop of one run.
//!
//! `Idle → Running → {Completed | Aborted}`. Each iteration polls the stop
//! signal, checks the budget, pops one candidate, runs it past the guards,
//! and on accept fetches it. Source pages have their citations extracted,
//! stored, and the new external ones enqueued; citation targets have their
//! text attached to the citations waiting on them, which then go through the
//! save pipeline under the concurrency limiter.
//!
//! Per-candidate failures are logged with a reason code and counted; they
//! never end the run.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, instrument, warn};
use url::Url;

use patchscout_crawler::{
    CitationExtractor, PageFetcher, RawCitation, ReadableText, extract_readable,
};
use patchscout_shared::{
    AppConfig, Candidate, PatchScoutError, RelevanceConfig, Result, RunOutcome, RunStats, Topic,
    VerificationStatus, canonicalize, domain_of,
};
use patchscout_storage::{NewCitation, Storage};

use crate::frontier::{CITATION_PROVIDER, FrontierStore, HELD_PRIORITY};
use crate::guards::{GuardDecision, GuardReason, RunState, SchedulerGuards};
use crate::limiter::ConcurrencyLimiter;
use crate::pipeline::{ContentSink, ReprocessOptions, SavePipeline, StorageSink};
use crate::scoring::{RelevanceScorer, ScoringInput};
use crate::stop::StopSignal;

/// Parameters of one run.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub topic: Topic,
    pub duration: Duration,
    /// Accepted candidates after which the run completes.
    pub max_candidates: usize,
    /// Fetch, extract, and score without writing anything.
    pub dry_run: bool,
}

/// Final state and statistics of a run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Crawl run history id; `None` for dry runs.
    pub run_id: Option<String>,
    pub outcome: RunOutcome,
    pub stats: RunStats,
}

/// Progress callback for interactive runs.
pub trait ProgressReporter: Send + Sync {
    /// Called when a page has been fetched.
    fn page_fetched(&self, url: &str, stats: &RunStats);
    /// Called when a candidate is requeued by a guard.
    fn requeued(&self, url: &str, reason: GuardReason);
    /// Called when the run ends.
    fn done(&self, report: &RunReport);
}

/// No-op progress reporter for headless/test usage.
pub struct SilentProgress;

impl ProgressReporter for SilentProgress {
    fn page_fetched(&self, _url: &str, _stats: &RunStats) {}
    fn requeued(&self, _url: &str, _reason: GuardReason) {}
    fn done(&self, _report: &RunReport) {}
}

/// Collaborators of the orchestrator. The frontier and stop signal are
/// separate from storage so dry runs and tests can swap them.
pub struct Collaborators {
    pub storage: Arc<Storage>,
    pub frontier: Arc<dyn FrontierStore>,
    pub stop: Arc<dyn StopSignal>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub scorer: Arc<dyn RelevanceScorer>,
}

pub struct Orchestrator {
    storage: Arc<Storage>,
    frontier: Arc<dyn FrontierStore>,
    stop: Arc<dyn StopSignal>,
    fetcher: Arc<dyn PageFetcher>,
    scorer: Arc<dyn RelevanceScorer>,
    extractor: CitationExtractor,
    guards: SchedulerGuards,
    relevance: RelevanceConfig,
    limiter: ConcurrencyLimiter,
}

/// Mutable bookkeeping of a run in progress.
struct RunContext<'a> {
    run: &'a RunConfig,
    pipeline: Option<SavePipeline>,
    options: ReprocessOptions,
    state: RunState,
    stats: RunStats,
    /// Canonical URLs enqueued or fetched during this run.
    seen: HashSet<String>,
    /// Canonical URLs a guard has held back at least once this run.
    held: HashSet<String>,
}

impl Orchestrator {
    /// Validates `config`; a configuration error surfaces here, before any
    /// run starts.
    pub fn new(collaborators: Collaborators, config: &AppConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            storage: collaborators.storage,
            frontier: collaborators.frontier,
            stop: collaborators.stop,
            fetcher: collaborators.fetcher,
            scorer: collaborators.scorer,
            extractor: CitationExtractor::new(&config.extract),
            guards: SchedulerGuards::new(config.guards.clone()),
            relevance: config.relevance.clone(),
            limiter: ConcurrencyLimiter::new(config.fetch.concurrency),
        })
    }

    pub fn limiter(&self) -> &ConcurrencyLimiter {
        &self.limiter
    }

    /// Run until the frontier empties, the budget runs out, or a stop is
    /// requested.
    #[instrument(skip_all, fields(topic = %run.topic.handle, dry_run = run.dry_run))]
    pub async fn run(&self, run: &RunConfig, progress: &dyn ProgressReporter) -> Result<RunReport> {
        let start = Instant::now();
        let topic_id = run.topic.id.as_str();

        let run_id = if run.dry_run {
            None
        } else {
            Some(self.storage.insert_crawl_run(topic_id).await?)
        };

        let pipeline = (!run.dry_run).then(|| {
            let sink: Arc<dyn ContentSink> =
                Arc::new(StorageSink::new(Arc::clone(&self.storage), topic_id));
            SavePipeline::new(
                Arc::clone(&self.storage),
                Arc::clone(&self.fetcher),
                Arc::clone(&self.scorer),
                sink,
                self.relevance.clone(),
            )
        });

        let mut ctx = RunContext {
            run,
            pipeline,
            options: ReprocessOptions {
                topic_name: run.topic.title.clone(),
                topic_handle: run.topic.handle.clone(),
                aliases: run.topic.aliases.clone(),
                save_as_content: true,
                save_as_memory: self.relevance.save_as_memory,
            },
            state: RunState::new(),
            stats: RunStats::default(),
            seen: HashSet::new(),
            held: HashSet::new(),
        };

        info!(
            duration_secs = run.duration.as_secs(),
            max_candidates = run.max_candidates,
            "starting crawl run"
        );

        let mut processed = 0usize;
        // Candidates held back since the last accept. Popping one of them
        // again means a full pass went by with nothing accepted.
        let mut held_since_accept: HashSet<String> = HashSet::new();

        let outcome = loop {
            match self.stop.is_set(topic_id).await {
                Ok(true) => {
                    info!("stop requested");
                    if !run.dry_run {
                        if let Err(e) = self.stop.clear(topic_id).await {
                            warn!(error = %e, "failed to clear stop flag");
                        }
                    }
                    break RunOutcome::Aborted;
                }
                Ok(false) => {}
                Err(e) => warn!(reason = e.reason_code(), error = %e, "stop flag unreadable"),
            }

            if start.elapsed() >= run.duration {
                info!(reason = "duration_budget", "budget exhausted");
                break RunOutcome::Completed;
            }
            if processed >= run.max_candidates {
                info!(reason = "max_candidates", "budget exhausted");
                break RunOutcome::Completed;
            }

            let candidate = match self.frontier.pop(topic_id).await {
                Ok(Some(candidate)) => candidate,
                Ok(None) => {
                    info!("frontier empty");
                    break RunOutcome::Completed;
                }
                Err(e) => {
                    warn!(reason = e.reason_code(), error = %e, "frontier unavailable");
                    ctx.stats.errors += 1;
                    break RunOutcome::Aborted;
                }
            };

            let Some((url, canonical, host)) = resolve(&candidate) else {
                debug!(url = %candidate.url, reason = "invalid_url", "dropping candidate");
                ctx.stats.skipped += 1;
                continue;
            };

            if held_since_accept.contains(&canonical) {
                if let Err(e) = self.frontier.push(topic_id, &candidate).await {
                    warn!(reason = e.reason_code(), error = %e, "failed to requeue candidate");
                    ctx.stats.errors += 1;
                }
                info!(
                    held = held_since_accept.len(),
                    "every queued candidate is held back by a guard"
                );
                break RunOutcome::Completed;
            }

            let decision = self.guards.evaluate(
                &mut ctx.state,
                &candidate,
                &host,
                candidate.meta.is_contested,
            );
            if let GuardDecision::Requeue(reason) = decision {
                debug!(url = %candidate.url, reason = reason.as_str(), "candidate requeued");
                progress.requeued(&candidate.url, reason);
                if ctx.held.insert(canonical.clone()) {
                    ctx.stats.skipped += 1;
                }
                held_since_accept.insert(canonical);
                let mut held = candidate;
                held.priority = held.priority.min(HELD_PRIORITY);
                if let Err(e) = self.frontier.push(topic_id, &held).await {
                    warn!(reason = e.reason_code(), error = %e, "failed to requeue candidate");
                    ctx.stats.errors += 1;
                }
                if reason == GuardReason::RunCap {
                    info!(reason = reason.as_str(), "run cap reached");
                    break RunOutcome::Completed;
                }
                continue;
            }
            held_since_accept.clear();
            processed += 1;
            ctx.seen.insert(canonical.clone());

            self.process_candidate(&mut ctx, &candidate, &url, &canonical)
                .await;
            progress.page_fetched(&candidate.url, &ctx.stats);
        };

        ctx.stats.duration_seconds = start.elapsed().as_secs_f64();

        if let Some(run_id) = &run_id {
            let stats_json = serde_json::to_string(&ctx.stats)
                .map_err(|e| PatchScoutError::Storage(format!("stats encode: {e}")))?;
            if let Err(e) = self.storage.finish_crawl_run(run_id, outcome, &stats_json).await {
                warn!(reason = e.reason_code(), error = %e, "failed to record crawl run");
            }
        }

        let report = RunReport {
            run_id,
            outcome,
            stats: ctx.stats,
        };

        info!(
            outcome = ?report.outcome,
            fetched = report.stats.fetched,
            enqueued = report.stats.enqueued,
            deduped = report.stats.deduped,
            skipped = report.stats.skipped,
            persisted = report.stats.persisted,
            extracted = report.stats.extracted,
            errors = report.stats.errors,
            duration_secs = report.stats.duration_seconds,
            "crawl run finished"
        );
        if report.stats.persisted == 0 {
            info!("run saved no content");
        }

        progress.done(&report);
        Ok(report)
    }

    /// Fetch and handle one accepted candidate. Never fails the run.
    async fn process_candidate(
        &self,
        ctx: &mut RunContext<'_>,
        candidate: &Candidate,
        url: &Url,
        canonical: &str,
    ) {
        let page = match self.fetcher.fetch(url).await {
            Ok(page) => page,
            Err(e) => {
                warn!(url = %url, reason = e.reason_code(), error = %e, "fetch failed");
                ctx.stats.errors += 1;
                if let Err(e) = self.handle_fetch_failure(ctx, candidate, canonical, &e).await {
                    warn!(reason = e.reason_code(), error = %e, "failed to record fetch failure");
                    ctx.stats.errors += 1;
                }
                return;
            }
        };
        ctx.stats.fetched += 1;

        let readable = extract_readable(&page.html);

        if ctx.run.dry_run {
            self.dry_run_page(ctx, candidate, &page.final_url, &page.html, &readable)
                .await;
            return;
        }

        let result = async {
            let mut ready = self.attach_to_waiting(ctx, canonical, &readable).await?;
            if candidate.provider != CITATION_PROVIDER {
                let raw = self.extractor.extract(&page.final_url, &page.html);
                ctx.stats.extracted += raw.len();
                let page_id = self
                    .storage
                    .upsert_source_page(
                        &ctx.run.topic.id,
                        page.final_url.as_str(),
                        canonical,
                        readable.title.as_deref(),
                    )
                    .await?;
                ready.extend(self.store_citations(ctx, candidate, &page_id, &raw).await?);
            }
            Ok::<_, PatchScoutError>(ready)
        }
        .await;

        match result {
            Ok(ready) if !ready.is_empty() => self.decide(ctx, &ready).await,
            Ok(_) => {}
            Err(e) => {
                warn!(url = %url, reason = e.reason_code(), error = %e, "failed to process page");
                ctx.stats.errors += 1;
            }
        }
    }

    /// Give the fetched text to every undecided citation of this URL.
    /// Returns the ids now ready for a decision.
    async fn attach_to_waiting(
        &self,
        ctx: &RunContext<'_>,
        canonical: &str,
        readable: &ReadableText,
    ) -> Result<Vec<String>> {
        let Some(pipeline) = &ctx.pipeline else {
            return Ok(Vec::new());
        };
        let waiting = self
            .storage
            .list_undecided_by_canonical(&ctx.run.topic.id, canonical)
            .await?;
        let mut ready = Vec::with_capacity(waiting.len());
        for mut citation in waiting {
            if citation.content_text.is_none() {
                pipeline.attach_text(&mut citation, readable).await?;
            }
            ready.push(citation.id);
        }
        Ok(ready)
    }

    /// Store a source page's citations and enqueue the new external ones.
    /// Returns citations that can be decided right away because their
    /// target already has content.
    async fn store_citations(
        &self,
        ctx: &mut RunContext<'_>,
        source: &Candidate,
        page_id: &str,
        raw: &[RawCitation],
    ) -> Result<Vec<String>> {
        let topic_id = ctx.run.topic.id.clone();
        let mut ready = Vec::new();

        for item in raw {
            let known_before = self.storage.citation_known(&topic_id, &item.canonical_url).await?;
            let stored = self
                .storage
                .insert_citation(&NewCitation {
                    patch_id: topic_id.clone(),
                    source_page_id: page_id.to_string(),
                    citation_url: item.url.clone(),
                    canonical_url: item.canonical_url.clone(),
                    title: item.title.clone(),
                    context: item.context.clone(),
                    source_number: item.source_number,
                    verification_status: if item.is_internal() {
                        VerificationStatus::PendingWiki
                    } else {
                        VerificationStatus::Pending
                    },
                })
                .await?;

            if item.is_internal() {
                continue;
            }
            let Some(mut citation) = stored else {
                ctx.stats.deduped += 1;
                continue;
            };

            if let Some(content) = self
                .storage
                .get_content_by_canonical(&topic_id, &item.canonical_url)
                .await?
            {
                // Target already saved through another citation.
                if let Some(pipeline) = &ctx.pipeline {
                    let readable = ReadableText {
                        title: Some(content.title),
                        text: content.text,
                    };
                    pipeline.attach_text(&mut citation, &readable).await?;
                    ready.push(citation.id);
                }
                ctx.stats.deduped += 1;
                continue;
            }

            if known_before || !ctx.seen.insert(item.canonical_url.clone()) {
                ctx.stats.deduped += 1;
                continue;
            }

            self.frontier
                .push(&topic_id, &child_candidate(source, &item.url))
                .await?;
            ctx.stats.enqueued += 1;
        }
        Ok(ready)
    }

    /// Run the save pipeline over `ids` under the limiter.
    async fn decide(&self, ctx: &mut RunContext<'_>, ids: &[String]) {
        let Some(pipeline) = &ctx.pipeline else {
            return;
        };
        let report = pipeline
            .reprocess_batch(ids, &ctx.options, &self.limiter)
            .await;
        ctx.stats.persisted += report.saved;
        ctx.stats.errors += report.failed;
    }

    async fn handle_fetch_failure(
        &self,
        ctx: &RunContext<'_>,
        candidate: &Candidate,
        canonical: &str,
        error: &PatchScoutError,
    ) -> Result<()> {
        let topic_id = ctx.run.topic.id.as_str();
        let attempts = candidate.meta.attempts + 1;

        if let Some(pipeline) = &ctx.pipeline {
            let waiting = self
                .storage
                .list_undecided_by_canonical(topic_id, canonical)
                .await?;
            for mut citation in waiting {
                pipeline.record_fetch_failure(&mut citation, error).await?;
            }
        }

        if error.is_transient() && attempts < self.relevance.max_fetch_attempts {
            let mut retry = candidate.clone();
            retry.meta.attempts = attempts;
            self.frontier.push(topic_id, &retry).await?;
            debug!(url = %candidate.url, attempts, "candidate requeued for retry");
        } else {
            debug!(url = %candidate.url, attempts, reason = error.reason_code(), "candidate dropped");
        }
        Ok(())
    }

    /// Dry-run handling: enqueue into the (in-memory) frontier and score,
    /// without touching storage.
    async fn dry_run_page(
        &self,
        ctx: &mut RunContext<'_>,
        candidate: &Candidate,
        final_url: &Url,
        html: &str,
        readable: &ReadableText,
    ) {
        let topic_id = ctx.run.topic.id.clone();

        if candidate.provider == CITATION_PROVIDER {
            if readable.char_len() < self.relevance.min_content_chars {
                debug!(url = %candidate.url, reason = "content_insufficient", "would deny");
                return;
            }
            let input = ScoringInput {
                url: &candidate.url,
                title: readable.title.as_deref(),
                text: &readable.text,
            };
            match self
                .scorer
                .score(&input, &ctx.run.topic.title, &ctx.run.topic.aliases)
                .await
            {
                Ok(score) if score >= self.relevance.save_threshold => {
                    info!(url = %candidate.url, score, "would save");
                    ctx.stats.persisted += 1;
                }
                Ok(score) => debug!(url = %candidate.url, score, reason = "below_threshold", "would deny"),
                Err(e) => {
                    warn!(url = %candidate.url, reason = e.reason_code(), error = %e, "scoring failed");
                    ctx.stats.errors += 1;
                }
            }
            return;
        }

        let raw = self.extractor.extract(final_url, html);
        ctx.stats.extracted += raw.len();
        for item in raw.iter().filter(|c| !c.is_internal()) {
            let known = match self.storage.citation_known(&topic_id, &item.canonical_url).await {
                Ok(known) => known,
                Err(e) => {
                    warn!(reason = e.reason_code(), error = %e, "citation lookup failed");
                    ctx.stats.errors += 1;
                    continue;
                }
            };
            if known || !ctx.seen.insert(item.canonical_url.clone()) {
                ctx.stats.deduped += 1;
                continue;
            }
            match self
                .frontier
                .push(&topic_id, &child_candidate(candidate, &item.url))
                .await
            {
                Ok(()) => ctx.stats.enqueued += 1,
                Err(e) => {
                    warn!(reason = e.reason_code(), error = %e, "failed to enqueue");
                    ctx.stats.errors += 1;
                }
            }
        }
    }
}

/// Parse and canonicalize a candidate's URL, returning the URL to fetch,
/// its canonical key, and its host.
fn resolve(candidate: &Candidate) -> Option<(Url, String, String)> {
    let canonical = canonicalize(&candidate.url)?;
    let host = domain_of(&canonical)?;
    let url = Url::parse(candidate.url.trim()).ok()?;
    Some((url, canonical, host))
}

/// Candidate for a citation found on `source`'s page. Contested status
/// carries over to what the page cites.
fn child_candidate(source: &Candidate, url: &str) -> Candidate {
    let mut child = Candidate::new(url, CITATION_PROVIDER);
    child.meta.is_contested = source.meta.is_contested;
    child.meta.stance = source.meta.stance.clone();
    child
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frontier::{MemoryFrontier, SEED_PRIORITY, seed};
    use crate::scoring::KeywordScorer;
    use crate::stop::MemoryStopSignal;
    use crate::testing::{FixedScorer, StaticFetcher, filler, setup};
    use patchscout_shared::{GuardConfig, RelevanceDecision, ScanStatus};

    const SEED: &str = "https://en.wikipedia.org/wiki/Example_Game";

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.guards = GuardConfig {
            min_distinct_hosts: 0,
            ..GuardConfig::default()
        };
        config
    }

    fn run_config(topic: &Topic) -> RunConfig {
        RunConfig {
            topic: topic.clone(),
            duration: Duration::from_secs(30),
            max_candidates: 100,
            dry_run: false,
        }
    }

    fn article(body: &str) -> String {
        format!("<html><head><title>Story</title></head><body><article><p>{body}</p></article></body></html>")
    }

    fn seed_page() -> String {
        r#"<html><body><div id="mw-content-text">
            <ol class="references">
              <li><a class="external" href="https://news.example.com/patch?utm_source=wiki">Patch notes</a></li>
              <li><a class="external" href="https://blog.example.org/short">Short post</a></li>
              <li><a href="/wiki/Game_balance">Game balance</a></li>
              <li><a class="external" href="https://slow.example.net/a">Slow site</a></li>
            </ol>
        </div></body></html>"#
            .to_string()
    }

    fn wiki_page(cites: &[&str]) -> String {
        let items: String = cites
            .iter()
            .map(|url| format!(r#"<li><a class="external" href="{url}">Source</a></li>"#))
            .collect();
        format!(
            r#"<html><body><div id="mw-content-text"><ol class="references">{items}</ol></div></body></html>"#
        )
    }

    struct Harness {
        orchestrator: Orchestrator,
        frontier: Arc<MemoryFrontier>,
        stop: Arc<MemoryStopSignal>,
        fetcher: Arc<StaticFetcher>,
        storage: Arc<Storage>,
        topic: Topic,
    }

    async fn harness(fetcher: StaticFetcher, score: u8, config: AppConfig) -> Harness {
        let (storage, topic) = setup().await;
        let frontier = Arc::new(MemoryFrontier::new());
        let stop = Arc::new(MemoryStopSignal::new());
        let fetcher = Arc::new(fetcher);
        let orchestrator = Orchestrator::new(
            Collaborators {
                storage: Arc::clone(&storage),
                frontier: frontier.clone(),
                stop: stop.clone(),
                fetcher: fetcher.clone(),
                scorer: Arc::new(FixedScorer(score)),
            },
            &config,
        )
        .unwrap();
        Harness {
            orchestrator,
            frontier,
            stop,
            fetcher,
            storage,
            topic,
        }
    }

    #[tokio::test]
    async fn crawl_extracts_enqueues_and_saves() {
        let fetcher = StaticFetcher::default()
            .page(SEED, &seed_page())
            .page("https://news.example.com/patch?utm_source=wiki", &article(&filler(1_200)))
            .page("https://blog.example.org/short", &article("Too short."));
        let h = harness(fetcher, 75, config()).await;
        seed(h.frontier.as_ref(), &h.topic.id, &[SEED.to_string()]).await.unwrap();

        let report = h.orchestrator.run(&run_config(&h.topic), &SilentProgress).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert!(report.run_id.is_some());
        assert_eq!(report.stats.extracted, 4);
        assert_eq!(report.stats.enqueued, 3);
        assert_eq!(report.stats.persisted, 1);
        assert_eq!(h.storage.count_content(&h.topic.id).await.unwrap(), 1);

        let saved = h
            .storage
            .list_citations_by_decision(&h.topic.id, RelevanceDecision::Saved)
            .await
            .unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].canonical_url, "https://news.example.com/patch");
        let content = h
            .storage
            .get_content(saved[0].saved_content_id.as_deref().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(content.canonical_url, saved[0].canonical_url);

        let denied = h
            .storage
            .list_citations_by_decision(&h.topic.id, RelevanceDecision::Denied)
            .await
            .unwrap();
        assert_eq!(denied.len(), 1);
        assert_eq!(denied[0].scan_status, ScanStatus::ScannedDenied);

        let last = h.storage.last_crawl_run(&h.topic.id).await.unwrap().unwrap();
        assert_eq!(last.outcome.as_deref(), Some("completed"));
        assert!(last.stats_json.unwrap().contains("\"persisted\":1"));
    }

    #[tokio::test]
    async fn internal_links_are_pending_wiki_and_never_fetched() {
        let fetcher = StaticFetcher::default().page(SEED, &seed_page());
        let h = harness(fetcher, 75, config()).await;
        seed(h.frontier.as_ref(), &h.topic.id, &[SEED.to_string()]).await.unwrap();

        h.orchestrator.run(&run_config(&h.topic), &SilentProgress).await.unwrap();

        let counts = h.storage.count_citations_by_decision(&h.topic.id).await.unwrap();
        assert_eq!(counts.internal, 1);
        let calls = h.fetcher.calls();
        assert!(!calls.iter().any(|u| u.contains("Game_balance")), "{calls:?}");
    }

    #[tokio::test]
    async fn unreachable_citation_ends_denied_verify() {
        let fetcher = StaticFetcher::default().page(SEED, &seed_page());
        let mut config = config();
        config.relevance.max_fetch_attempts = 3;
        config.guards.host_cap = 3;
        let h = harness(fetcher, 75, config).await;
        seed(h.frontier.as_ref(), &h.topic.id, &[SEED.to_string()]).await.unwrap();

        let report = h.orchestrator.run(&run_config(&h.topic), &SilentProgress).await.unwrap();

        let slow_calls = h
            .fetcher
            .calls()
            .into_iter()
            .filter(|u| u.starts_with("https://slow.example.net"))
            .count();
        assert_eq!(slow_calls, 3);

        let denied = h
            .storage
            .list_citations_by_decision(&h.topic.id, RelevanceDecision::DeniedVerify)
            .await
            .unwrap();
        let slow = denied
            .iter()
            .find(|c| c.canonical_url == "https://slow.example.net/a")
            .expect("slow citation finalized");
        assert_eq!(slow.verification_status, VerificationStatus::Failed);
        assert_eq!(slow.fetch_attempts, 3);
        assert!(slow.saved_content_id.is_none());
        assert!(report.stats.errors >= 3);
    }

    #[tokio::test]
    async fn host_cap_bounds_fetches_per_host() {
        let mut fetcher = StaticFetcher::default();
        let mut urls = Vec::new();
        for i in 0..6 {
            let url = format!("https://one.example.com/page{i}");
            fetcher = fetcher.page(&url, &article("x"));
            urls.push(url);
        }
        let mut config = config();
        config.guards.host_cap = 2;
        let h = harness(fetcher, 75, config).await;
        seed(h.frontier.as_ref(), &h.topic.id, &urls).await.unwrap();

        let report = h.orchestrator.run(&run_config(&h.topic), &SilentProgress).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.stats.fetched, 2);
        assert_eq!(h.fetcher.calls().len(), 2);
        // One skip per held candidate, however often it was popped.
        assert_eq!(report.stats.skipped, 4);
        // Held-back candidates stay queued for a later run.
        assert_eq!(h.frontier.len(&h.topic.id).await, 4);
    }

    #[tokio::test]
    async fn same_host_seeds_do_not_starve_citations() {
        let a = "https://en.wikipedia.org/wiki/A";
        let b = "https://en.wikipedia.org/wiki/B";
        let mut fetcher = StaticFetcher::default()
            .page(a, &wiki_page(&["https://news.example.com/a", "https://blog.example.org/a"]))
            .page(b, &wiki_page(&["https://news.example.com/b", "https://blog.example.org/b"]));
        for url in [
            "https://news.example.com/a",
            "https://blog.example.org/a",
            "https://news.example.com/b",
            "https://blog.example.org/b",
        ] {
            fetcher = fetcher.page(url, &article(&filler(1_200)));
        }
        let h = harness(fetcher, 90, AppConfig::default()).await;
        seed(h.frontier.as_ref(), &h.topic.id, &[a.to_string(), b.to_string()])
            .await
            .unwrap();

        let report = h.orchestrator.run(&run_config(&h.topic), &SilentProgress).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        // B is held until A's citations widen the host spread.
        assert_eq!(report.stats.skipped, 1);
        assert_eq!(report.stats.persisted, 4);
        assert_eq!(h.storage.count_content(&h.topic.id).await.unwrap(), 4);
        let calls = h.fetcher.calls();
        assert_eq!(calls.len(), 6, "{calls:?}");
        assert_eq!(calls[1], "https://news.example.com/a");
        assert!(calls.iter().any(|u| u == b), "{calls:?}");
        assert_eq!(h.frontier.len(&h.topic.id).await, 0);
    }

    #[tokio::test]
    async fn source_share_trip_keeps_processing_other_candidates() {
        let mut fetcher = StaticFetcher::default();
        let mut seeds = Vec::new();
        for (i, lang) in ["en", "de", "fr", "es", "it"].iter().enumerate() {
            let page = format!("https://{lang}.wikipedia.org/wiki/Example");
            let cited = format!("https://site{i}.example.com/story");
            fetcher = fetcher
                .page(&page, &wiki_page(&[cited.as_str()]))
                .page(&cited, &article(&filler(1_200)));
            seeds.push(page);
        }
        let held = "https://ja.wikipedia.org/wiki/Example";
        fetcher = fetcher.page(held, &wiki_page(&["https://site9.example.com/story"]));
        seeds.push(held.to_string());
        let h = harness(fetcher, 90, AppConfig::default()).await;
        seed(h.frontier.as_ref(), &h.topic.id, &seeds).await.unwrap();

        let report = h.orchestrator.run(&run_config(&h.topic), &SilentProgress).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.stats.fetched, 10);
        assert_eq!(report.stats.persisted, 5);
        assert_eq!(report.stats.skipped, 1);
        let calls = h.fetcher.calls();
        assert!(!calls.iter().any(|u| u == held), "{calls:?}");
        for i in 0..5 {
            let cited = format!("https://site{i}.example.com/story");
            assert!(calls.contains(&cited), "{calls:?}");
        }
        // The cooled-down source page waits for a later run.
        let rest = h.frontier.pop(&h.topic.id).await.unwrap().unwrap();
        assert_eq!(rest.url, held);
        assert_eq!(rest.priority, HELD_PRIORITY);
    }

    #[tokio::test]
    async fn stop_flag_aborts_and_is_consumed() {
        let fetcher = StaticFetcher::default().page(SEED, &seed_page());
        let h = harness(fetcher, 75, config()).await;
        seed(h.frontier.as_ref(), &h.topic.id, &[SEED.to_string()]).await.unwrap();
        h.stop.set(&h.topic.id).await;

        let report = h.orchestrator.run(&run_config(&h.topic), &SilentProgress).await.unwrap();

        assert_eq!(report.outcome, RunOutcome::Aborted);
        assert_eq!(report.stats.fetched, 0);
        assert!(!h.stop.is_set(&h.topic.id).await.unwrap());
        assert_eq!(h.frontier.len(&h.topic.id).await, 1);
    }

    #[tokio::test]
    async fn max_candidates_ends_run() {
        let fetcher = StaticFetcher::default()
            .page(SEED, &seed_page())
            .page("https://news.example.com/patch?utm_source=wiki", &article(&filler(1_200)));
        let h = harness(fetcher, 75, config()).await;
        seed(h.frontier.as_ref(), &h.topic.id, &[SEED.to_string()]).await.unwrap();

        let run = RunConfig {
            max_candidates: 1,
            ..run_config(&h.topic)
        };
        let report = h.orchestrator.run(&run, &SilentProgress).await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Completed);
        assert_eq!(report.stats.fetched, 1);
        assert_eq!(h.frontier.len(&h.topic.id).await, 3);
    }

    #[tokio::test]
    async fn dry_run_writes_nothing() {
        let fetcher = StaticFetcher::default()
            .page(SEED, &seed_page())
            .page("https://news.example.com/patch?utm_source=wiki", &article(&filler(1_200)));
        let (storage, topic) = setup().await;
        let frontier = Arc::new(MemoryFrontier::from_candidates(
            &topic.id,
            vec![Candidate::new(SEED, "seed").with_priority(SEED_PRIORITY)],
        ));
        let orchestrator = Orchestrator::new(
            Collaborators {
                storage: Arc::clone(&storage),
                frontier,
                stop: Arc::new(MemoryStopSignal::new()),
                fetcher: Arc::new(fetcher),
                scorer: Arc::new(KeywordScorer::new()),
            },
            &config(),
        )
        .unwrap();

        let run = RunConfig {
            dry_run: true,
            ..run_config(&topic)
        };
        let report = orchestrator.run(&run, &SilentProgress).await.unwrap();

        assert!(report.run_id.is_none());
        assert_eq!(report.stats.enqueued, 3);
        assert!(report.stats.fetched >= 2);
        assert_eq!(storage.count_content(&topic.id).await.unwrap(), 0);
        let counts = storage.count_citations_by_decision(&topic.id).await.unwrap();
        assert_eq!(counts.undecided + counts.internal, 0);
        assert!(storage.last_crawl_run(&topic.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn invalid_config_fails_before_running() {
        let (storage, _topic) = setup().await;
        let mut config = config();
        config.guards.source_share_threshold = 1.5;
        let result = Orchestrator::new(
            Collaborators {
                storage: Arc::clone(&storage),
                frontier: Arc::new(MemoryFrontier::new()),
                stop: Arc::new(MemoryStopSignal::new()),
                fetcher: Arc::new(StaticFetcher::default()),
                scorer: Arc::new(FixedScorer(50)),
            },
            &config,
        );
        let err = result.err().expect("config rejected");
        assert_eq!(err.reason_code(), "config");
    }
}
