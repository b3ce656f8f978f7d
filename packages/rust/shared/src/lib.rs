//! Shared types, error model, configuration, and URL canonicalization for PatchScout.
//!
//! This crate is the foundation depended on by all other PatchScout crates.
//! It provides:
//! - [`PatchScoutError`]: the unified error type
//! - Domain types ([`Topic`], [`Candidate`], [`Citation`], [`Content`], [`RunStats`])
//! - Configuration ([`AppConfig`], config loading)
//! - [`canonicalize`] / [`domain_of`]: the URL comparison key

pub mod canonical;
pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use canonical::{canonicalize, domain_of, host_matches};
pub use config::{
    AppConfig, DefaultsConfig, ExtractConfig, FetchConfig, GuardConfig, RelevanceConfig,
    config_dir, config_file_path, init_config, load_config, load_config_from,
};
pub use error::{PatchScoutError, Result};
pub use types::{
    Candidate, CandidateMeta, Citation, Content, ContentDraft, Memory, RelevanceDecision,
    RunOutcome, RunStats, SavedContent, ScanStatus, Topic, VerificationStatus, new_id,
};
