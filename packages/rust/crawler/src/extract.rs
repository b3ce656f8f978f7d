//! Citation extraction.
//!
//! Pages with an encyclopedia-style reference list (`ol.references`) are read
//! reference by reference, followed by any remaining `a.external` links (the
//! "External links" section). Other pages fall back to every outbound link in
//! the main content area, skipping same-site navigation.
//!
//! Citations are deduplicated by canonical URL within a page and numbered in
//! page order starting at 1.

use std::collections::HashSet;

use scraper::{ElementRef, Html, Selector};
use tracing::debug;
use url::Url;

use patchscout_shared::{ExtractConfig, canonicalize, domain_of, host_matches};

use crate::text::{collapse_whitespace, truncate_chars};

/// Internal citations point back into the source's own domain family and
/// are never crawled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CitationKind {
    Internal,
    External,
}

/// One outbound reference found on a source page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawCitation {
    /// Absolute URL as linked.
    pub url: String,
    pub canonical_url: String,
    pub title: Option<String>,
    /// Surrounding text (the reference entry or enclosing paragraph).
    pub context: Option<String>,
    /// 1-based position among this page's citations.
    pub source_number: u32,
    pub kind: CitationKind,
}

impl RawCitation {
    pub fn is_internal(&self) -> bool {
        self.kind == CitationKind::Internal
    }
}

/// Parses outbound references from fetched pages.
#[derive(Debug, Clone)]
pub struct CitationExtractor {
    internal_domains: Vec<String>,
    max_context_chars: usize,
}

impl CitationExtractor {
    pub fn new(config: &ExtractConfig) -> Self {
        Self {
            internal_domains: config
                .internal_domains
                .iter()
                .map(|d| d.trim().trim_start_matches("www.").to_ascii_lowercase())
                .collect(),
            max_context_chars: config.max_context_chars,
        }
    }

    /// Extract the citations of `html`, fetched from `source_url`.
    pub fn extract(&self, source_url: &Url, html: &str) -> Vec<RawCitation> {
        let doc = Html::parse_document(html);
        let source_domain = domain_of(source_url.as_str());

        let ref_sel = Selector::parse("ol.references li").unwrap();
        let has_reference_list = doc.select(&ref_sel).next().is_some();

        let mut collector = Collector::new(self, source_url, source_domain.as_deref());

        if has_reference_list {
            let link_sel = Selector::parse("a[href]").unwrap();
            for item in doc.select(&ref_sel) {
                let context = self.context_of(item);
                for anchor in item.select(&link_sel) {
                    collector.offer(anchor, context.clone(), true);
                }
            }

            let external_sel = Selector::parse("a.external[href]").unwrap();
            for anchor in doc.select(&external_sel) {
                let context = enclosing_block(anchor).and_then(|el| self.context_of(el));
                collector.offer(anchor, context, true);
            }
        } else {
            let root = ["main", "article", r#"[role="main"]"#, "body"]
                .into_iter()
                .find_map(|s| {
                    let sel = Selector::parse(s).unwrap();
                    doc.select(&sel).next()
                });
            if let Some(root) = root {
                let link_sel = Selector::parse("a[href]").unwrap();
                for anchor in root.select(&link_sel) {
                    let context = enclosing_block(anchor).and_then(|el| self.context_of(el));
                    collector.offer(anchor, context, false);
                }
            }
        }

        let citations = collector.finish();
        debug!(
            source = %source_url,
            count = citations.len(),
            reference_list = has_reference_list,
            "extracted citations"
        );
        citations
    }

    /// Whether `host` belongs to the configured internal domain family.
    pub fn is_internal_host(&self, host: &str) -> bool {
        self.internal_domains.iter().any(|d| host_matches(host, d))
    }

    fn context_of(&self, el: ElementRef<'_>) -> Option<String> {
        let text = collapse_whitespace(&el.text().collect::<String>());
        let text = text.trim_start_matches('^').trim();
        if text.is_empty() {
            None
        } else {
            Some(truncate_chars(text, self.max_context_chars))
        }
    }
}

/// Accumulates citations for one page, deduplicating by canonical URL.
struct Collector<'a> {
    extractor: &'a CitationExtractor,
    base: &'a Url,
    source_domain: Option<&'a str>,
    seen: HashSet<String>,
    out: Vec<RawCitation>,
}

impl<'a> Collector<'a> {
    fn new(extractor: &'a CitationExtractor, base: &'a Url, source_domain: Option<&'a str>) -> Self {
        Self {
            extractor,
            base,
            source_domain,
            seen: HashSet::new(),
            out: Vec::new(),
        }
    }

    /// Consider one anchor. `keep_same_site` records links back to the
    /// source's own site as internal instead of dropping them.
    fn offer(&mut self, anchor: ElementRef<'_>, context: Option<String>, keep_same_site: bool) {
        let Some(href) = anchor.value().attr("href") else {
            return;
        };
        let href = href.trim();

        // Skip anchors, javascript:, mailto:
        if href.is_empty()
            || href.starts_with('#')
            || href.starts_with("javascript:")
            || href.starts_with("mailto:")
        {
            return;
        }

        let Ok(mut resolved) = self.base.join(href) else {
            return;
        };
        resolved.set_fragment(None);

        let Some(canonical) = canonicalize(resolved.as_str()) else {
            return;
        };
        let Some(host) = domain_of(&canonical) else {
            return;
        };

        let same_site = self
            .source_domain
            .is_some_and(|source| host_matches(&host, source));
        if same_site && !keep_same_site {
            return;
        }

        if !self.seen.insert(canonical.clone()) {
            return;
        }

        let kind = if same_site || self.extractor.is_internal_host(&host) {
            CitationKind::Internal
        } else {
            CitationKind::External
        };

        let title = collapse_whitespace(&anchor.text().collect::<String>());
        let title = title.trim_matches(|c| c == '"' || c == '\u{201c}' || c == '\u{201d}');

        self.out.push(RawCitation {
            url: resolved.to_string(),
            canonical_url: canonical,
            title: (!title.is_empty()).then(|| title.to_string()),
            context,
            source_number: self.out.len() as u32 + 1,
            kind,
        });
    }

    fn finish(self) -> Vec<RawCitation> {
        self.out
    }
}

/// Nearest block-level ancestor that reads as a sentence or list entry.
fn enclosing_block(anchor: ElementRef<'_>) -> Option<ElementRef<'_>> {
    anchor
        .ancestors()
        .filter_map(ElementRef::wrap)
        .find(|el| matches!(el.value().name(), "p" | "li" | "blockquote" | "td" | "figcaption" | "dd"))
}
