//! Relevance scoring port and the default heuristic scorer.
//!
//! The save pipeline only depends on [`RelevanceScorer`]'s signature and its
//! 0..=100 range; a language-model scorer plugs in behind the same trait.

use std::collections::HashSet;
use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use patchscout_shared::{Result, domain_of, host_matches};

/// What the scorer sees of a citation.
#[derive(Debug, Clone, Copy)]
pub struct ScoringInput<'a> {
    pub url: &'a str,
    pub title: Option<&'a str>,
    pub text: &'a str,
}

#[async_trait]
pub trait RelevanceScorer: Send + Sync {
    /// Priority score in 0..=100.
    async fn score(
        &self,
        input: &ScoringInput<'_>,
        topic_title: &str,
        aliases: &[String],
    ) -> Result<u8>;
}

static WORD: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[\p{L}\p{N}]+").unwrap());

const STOPWORDS: &[&str] = &[
    "the", "and", "for", "with", "from", "that", "this", "into", "over", "are", "was", "its",
];

/// Domains whose reporting is generally reliable.
const REPUTABLE_DOMAINS: &[&str] = &[
    "reuters.com",
    "apnews.com",
    "bbc.co.uk",
    "bbc.com",
    "nytimes.com",
    "theguardian.com",
    "washingtonpost.com",
    "nature.com",
    "science.org",
    "arstechnica.com",
    "theverge.com",
    "polygon.com",
    "ign.com",
    "eurogamer.net",
    "pcgamer.com",
    "gamespot.com",
    "arxiv.org",
];

/// Social and aggregator domains that rarely carry standalone content.
const LOW_SIGNAL_DOMAINS: &[&str] = &[
    "facebook.com",
    "twitter.com",
    "x.com",
    "instagram.com",
    "tiktok.com",
    "pinterest.com",
    "linkedin.com",
    "reddit.com",
];

/// Deterministic keyword/domain/length heuristic.
///
/// - keyword overlap with the topic title and aliases: up to 50
/// - an exact title or alias phrase in the text: 15
/// - domain reputation: +15 for reputable or public-sector sources, -20 for
///   social/aggregator domains
/// - content sufficiency: up to 20 by length
#[derive(Debug, Clone, Default)]
pub struct KeywordScorer;

impl KeywordScorer {
    pub fn new() -> Self {
        Self
    }

    /// Synchronous form of [`RelevanceScorer::score`].
    pub fn score_sync(&self, input: &ScoringInput<'_>, topic_title: &str, aliases: &[String]) -> u8 {
        let keywords: HashSet<String> = std::iter::once(topic_title)
            .chain(aliases.iter().map(String::as_str))
            .flat_map(tokens)
            .filter(|t| is_keyword(t))
            .collect();

        let haystack = match input.title {
            Some(title) => format!("{title} {}", input.text),
            None => input.text.to_string(),
        };
        let text_tokens: HashSet<String> = tokens(&haystack).collect();

        let mut score: i32 = 0;

        if !keywords.is_empty() {
            let hits = keywords.iter().filter(|k| text_tokens.contains(*k)).count();
            score += (50 * hits / keywords.len()) as i32;
        }

        let lowered = haystack.to_lowercase();
        let phrase_hit = std::iter::once(topic_title)
            .chain(aliases.iter().map(String::as_str))
            .map(|p| p.trim().to_lowercase())
            .filter(|p| p.chars().count() >= 3)
            .any(|p| lowered.contains(&p));
        if phrase_hit {
            score += 15;
        }

        if let Some(host) = domain_of(input.url) {
            if is_public_sector(&host) || REPUTABLE_DOMAINS.iter().any(|d| host_matches(&host, d)) {
                score += 15;
            } else if LOW_SIGNAL_DOMAINS.iter().any(|d| host_matches(&host, d)) {
                score -= 20;
            }
        }

        score += match input.text.chars().count() {
            n if n >= 2_000 => 20,
            n if n >= 1_000 => 15,
            n if n >= 500 => 8,
            _ => 0,
        };

        score.clamp(0, 100) as u8
    }
}

#[async_trait]
impl RelevanceScorer for KeywordScorer {
    async fn score(
        &self,
        input: &ScoringInput<'_>,
        topic_title: &str,
        aliases: &[String],
    ) -> Result<u8> {
        Ok(self.score_sync(input, topic_title, aliases))
    }
}

fn tokens(s: &str) -> impl Iterator<Item = String> + '_ {
    WORD.find_iter(s).map(|m| m.as_str().to_lowercase())
}

fn is_keyword(token: &str) -> bool {
    (token.chars().count() >= 3 || token.chars().all(|c| c.is_ascii_digit()))
        && !STOPWORDS.contains(&token)
}

fn is_public_sector(host: &str) -> bool {
    host.ends_with(".gov") || host.ends_with(".edu") || host.contains(".gov.") || host.contains(".ac.")
}
