//! Test doubles shared by the core crate's unit tests.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use url::Url;

use patchscout_crawler::{FetchedPage, PageFetcher};
use patchscout_shared::{
    Citation, PatchScoutError, Result, Topic, VerificationStatus, canonicalize, new_id,
};
use patchscout_storage::{NewCitation, Storage};

use crate::scoring::{RelevanceScorer, ScoringInput};

/// Serves canned HTML by URL; unknown URLs time out.
#[derive(Default)]
pub struct StaticFetcher {
    pages: HashMap<String, String>,
    delay: Option<Duration>,
    calls: Mutex<Vec<String>>,
}

impl StaticFetcher {
    pub fn page(mut self, url: &str, html: &str) -> Self {
        let key = Url::parse(url).expect("test url").to_string();
        self.pages.insert(key, html.to_string());
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every URL requested so far, in order.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl PageFetcher for StaticFetcher {
    async fn fetch(&self, url: &Url) -> Result<FetchedPage> {
        self.calls.lock().unwrap().push(url.to_string());
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match self.pages.get(url.as_str()) {
            Some(html) => Ok(FetchedPage {
                url: url.clone(),
                final_url: url.clone(),
                status: 200,
                html: html.clone(),
                fetched_at: Utc::now(),
            }),
            None => Err(PatchScoutError::fetch_timeout(url.as_str())),
        }
    }
}

/// Always returns the same score.
pub struct FixedScorer(pub u8);

#[async_trait]
impl RelevanceScorer for FixedScorer {
    async fn score(&self, _: &ScoringInput<'_>, _: &str, _: &[String]) -> Result<u8> {
        Ok(self.0)
    }
}

/// Scorer whose backend is down.
pub struct FailingScorer;

#[async_trait]
impl RelevanceScorer for FailingScorer {
    async fn score(&self, _: &ScoringInput<'_>, _: &str, _: &[String]) -> Result<u8> {
        Err(PatchScoutError::Scoring("model unavailable".into()))
    }
}

/// Fresh database with one topic.
pub async fn setup() -> (Arc<Storage>, Topic) {
    let path = std::env::temp_dir().join(format!("ps_core_{}.db", new_id()));
    let storage = Storage::open(&path).await.expect("open test db");
    let topic = Topic {
        id: new_id(),
        handle: format!("topic-{}", new_id()),
        title: "Rust programming language".into(),
        aliases: vec!["Rust".into()],
        tags: Vec::new(),
    };
    storage.insert_topic(&topic).await.expect("insert topic");
    (Arc::new(storage), topic)
}

/// A pending citation of `url` on a source page of its own.
pub async fn citation_for(storage: &Arc<Storage>, topic: &Topic, url: &str) -> Citation {
    let page_url = format!("https://en.wikipedia.org/wiki/Page_{}", new_id());
    let page_id = storage
        .upsert_source_page(&topic.id, &page_url, &page_url, Some("Source page"))
        .await
        .expect("source page");
    storage
        .insert_citation(&NewCitation {
            patch_id: topic.id.clone(),
            source_page_id: page_id,
            citation_url: url.to_string(),
            canonical_url: canonicalize(url).expect("canonical url"),
            title: None,
            context: None,
            source_number: 1,
            verification_status: VerificationStatus::Pending,
        })
        .await
        .expect("insert citation")
        .expect("new citation")
}

/// `n` characters of text without whitespace.
pub fn filler(n: usize) -> String {
    "abcdefghij".chars().cycle().take(n).collect()
}
