//! Core domain types: topics, crawl candidates, citations, persisted content,
//! and run statistics.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::PatchScoutError;

// ---------------------------------------------------------------------------
// Ids
// ---------------------------------------------------------------------------

/// Generate a new time-sortable record identifier (UUID v7).
pub fn new_id() -> String {
    Uuid::now_v7().to_string()
}

// ---------------------------------------------------------------------------
// Topic
// ---------------------------------------------------------------------------

/// A tracked subject ("patch") enriched with discovered content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    /// Short unique handle used on the command line.
    pub handle: String,
    pub title: String,
    #[serde(default)]
    pub aliases: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

// ---------------------------------------------------------------------------
// Candidate
// ---------------------------------------------------------------------------

/// Per-candidate hints carried through the frontier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateMeta {
    /// Covers disputed subject matter; throttled by the contested guard.
    #[serde(default)]
    pub is_contested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stance: Option<String>,
    /// Fetch attempts already spent on this URL.
    #[serde(default)]
    pub attempts: u32,
}

/// A URL queued for possible crawling.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    pub url: String,
    /// Where the candidate came from (`seed`, `citation`, ...).
    pub provider: String,
    /// Higher pops first.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub meta: CandidateMeta,
}

impl Candidate {
    /// Build a candidate with default priority and empty meta.
    pub fn new(url: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            provider: provider.into(),
            priority: 0,
            meta: CandidateMeta::default(),
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn contested(mut self, stance: Option<String>) -> Self {
        self.meta.is_contested = true;
        self.meta.stance = stance;
        self
    }
}

// ---------------------------------------------------------------------------
// Citation status enums
// ---------------------------------------------------------------------------

macro_rules! string_enum {
    ($(#[$doc:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            /// Storage representation.
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text),+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = PatchScoutError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(PatchScoutError::validation(format!(
                        "unknown {} value '{other}'",
                        stringify!($name)
                    ))),
                }
            }
        }
    };
}

string_enum!(
    /// Reachability of a citation's target.
    VerificationStatus {
        Pending => "pending",
        Verified => "verified",
        Failed => "failed",
        PendingWiki => "pending_wiki",
    }
);

string_enum!(
    /// Progress of content extraction and scoring for a citation.
    ScanStatus {
        NotScanned => "not_scanned",
        Scanning => "scanning",
        Scanned => "scanned",
        ScannedDenied => "scanned_denied",
    }
);

string_enum!(
    /// Final save/deny outcome for a citation.
    RelevanceDecision {
        Saved => "saved",
        Denied => "denied",
        DeniedVerify => "denied_verify",
    }
);

// ---------------------------------------------------------------------------
// Citation
// ---------------------------------------------------------------------------

/// An outbound reference discovered on a crawled source page.
///
/// `relevance_decision` is only set once `scan_status` is `Scanned` or
/// `ScannedDenied`, and `saved_content_id` is only set when the decision is
/// `Saved`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Citation {
    pub id: String,
    pub patch_id: String,
    pub source_page_id: String,
    pub citation_url: String,
    pub canonical_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// 1-based position on the source page.
    pub source_number: u32,
    pub verification_status: VerificationStatus,
    pub scan_status: ScanStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relevance_decision: Option<RelevanceDecision>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ai_priority_score: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub saved_content_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    pub fetch_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Citation {
    /// A decision has been made; the save pipeline must not touch it again.
    pub fn is_decided(&self) -> bool {
        self.relevance_decision.is_some() || self.saved_content_id.is_some()
    }

    /// Internal references are never fetched or scored.
    pub fn is_internal(&self) -> bool {
        self.verification_status == VerificationStatus::PendingWiki
    }
}

// ---------------------------------------------------------------------------
// Content & Memory
// ---------------------------------------------------------------------------

/// A persisted, deduplicated discovery result. Unique per
/// `(patch_id, canonical_url)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub id: String,
    pub patch_id: String,
    pub canonical_url: String,
    pub url: String,
    pub title: String,
    pub text: String,
    pub text_hash: String,
    pub relevance_score: u8,
    pub quality_score: u8,
    pub created_at: DateTime<Utc>,
}

/// Input for creating a [`Content`] row.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentDraft {
    pub url: String,
    pub title: String,
    pub text: String,
    pub relevance_score: u8,
    pub quality_score: u8,
}

/// Result of an idempotent content save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedContent {
    pub id: String,
    /// `false` when another writer already saved the same canonical URL.
    pub created: bool,
}

/// Secondary index entry linked to a content row and a topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub patch_id: String,
    /// Absent for legacy entries created without a content row.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_id: Option<String>,
    pub canonical_url: String,
    pub title: String,
    pub summary: String,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run statistics
// ---------------------------------------------------------------------------

/// Terminal state of one orchestrator run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Completed,
    Aborted,
}

/// Aggregate counters reported at the end of every run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunStats {
    /// Pages fetched successfully.
    pub fetched: usize,
    /// New candidates pushed to the frontier.
    pub enqueued: usize,
    /// Candidates or citations dropped as already known.
    pub deduped: usize,
    /// Distinct candidates held back by a guard, or dropped as unusable.
    pub skipped: usize,
    /// Content rows created.
    pub persisted: usize,
    /// Citations extracted from fetched pages.
    pub extracted: usize,
    pub errors: usize,
    pub duration_seconds: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_enums_roundtrip_through_strings() {
        for status in [
            VerificationStatus::Pending,
            VerificationStatus::Verified,
            VerificationStatus::Failed,
            VerificationStatus::PendingWiki,
        ] {
            assert_eq!(status.as_str().parse::<VerificationStatus>().unwrap(), status);
        }
        assert_eq!(
            "scanned_denied".parse::<ScanStatus>().unwrap(),
            ScanStatus::ScannedDenied
        );
        assert!("maybe".parse::<RelevanceDecision>().is_err());
    }

    #[test]
    fn candidate_serialization_defaults_meta() {
        let parsed: Candidate =
            serde_json::from_str(r#"{"url":"https://a.test/","provider":"seed"}"#).unwrap();
        assert_eq!(parsed.priority, 0);
        assert!(!parsed.meta.is_contested);
        assert_eq!(parsed.meta.attempts, 0);

        let contested = Candidate::new("https://b.test/", "citation").contested(Some("critical".into()));
        let json = serde_json::to_string(&contested).unwrap();
        assert!(json.contains("\"is_contested\":true"));
    }

    #[test]
    fn run_stats_serialize_with_field_names() {
        let stats = RunStats {
            fetched: 3,
            persisted: 1,
            ..RunStats::default()
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["fetched"], 3);
        assert_eq!(json["persisted"], 1);
        assert_eq!(json["duration_seconds"], 0.0);
    }
}
