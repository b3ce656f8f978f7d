//! Crawl orchestration and save decisions for PatchScout.
//!
//! This crate ties the frontier, scheduler guards, fetcher, citation
//! extractor, and relevance scorer into crawl runs (`Orchestrator::run`) and
//! per-citation save decisions (`SavePipeline::reprocess`).

pub mod frontier;
pub mod guards;
pub mod limiter;
pub mod orchestrator;
pub mod pipeline;
pub mod scoring;
pub mod stop;

#[cfg(test)]
pub(crate) mod testing;

pub use frontier::{
    CITATION_PROVIDER, FrontierStore, HELD_PRIORITY, MemoryFrontier, SEED_PRIORITY, SEED_PROVIDER,
    SeedReport, seed,
};
pub use guards::{GuardDecision, GuardReason, RunState, SchedulerGuards};
pub use limiter::ConcurrencyLimiter;
pub use orchestrator::{
    Collaborators, Orchestrator, ProgressReporter, RunConfig, RunReport, SilentProgress,
};
pub use pipeline::{
    BatchReport, ContentSink, ReprocessOptions, ReprocessOutcome, SavePipeline, StorageSink,
};
pub use scoring::{KeywordScorer, RelevanceScorer, ScoringInput};
pub use stop::{MemoryStopSignal, StopSignal};
