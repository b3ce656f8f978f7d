//! Readable-text extraction from fetched HTML.
//!
//! Picks the main content container (falling back to `<body>`), drops page
//! chrome (navigation, scripts, reference lists, edit links), and collapses
//! whitespace. The result is what the scorer sees and what gets saved as
//! content text.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{ElementRef, Html, Selector};

/// Tags whose text is never part of the readable body.
const CHROME_TAGS: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside", "form", "svg", "button",
];

/// Classes marking chrome on common CMS and encyclopedia layouts.
const CHROME_CLASSES: &[&str] = &[
    "sidebar",
    "nav",
    "navbox",
    "reflist",
    "references",
    "reference",
    "mw-editsection",
    "mw-jump-link",
    "noprint",
    "cookie-banner",
];

static WHITESPACE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s+").unwrap());

/// Inline footnote and maintenance markers such as `[12]` or `[citation needed]`.
static BRACKET_MARKERS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[(?:\d+|[a-z]|edit|citation needed|clarification needed)\]").unwrap()
});

/// Title and body text of a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadableText {
    pub title: Option<String>,
    pub text: String,
}

impl ReadableText {
    /// Length in characters (not bytes).
    pub fn char_len(&self) -> usize {
        self.text.chars().count()
    }
}

/// Extract the readable title and body text of an HTML document.
pub fn extract_readable(html: &str) -> ReadableText {
    let doc = Html::parse_document(html);

    let containers = [
        "#mw-content-text",
        "main",
        "article",
        r#"[role="main"]"#,
        ".content",
        "body",
    ];

    let mut text = String::new();
    for sel_str in containers {
        let sel = Selector::parse(sel_str).unwrap();
        if let Some(el) = doc.select(&sel).next() {
            text = visible_text(el);
            if !text.is_empty() {
                break;
            }
        }
    }

    let text = BRACKET_MARKERS.replace_all(&text, "");
    ReadableText {
        title: extract_title(&doc),
        text: collapse_whitespace(&text),
    }
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(s: &str) -> String {
    WHITESPACE.replace_all(s, " ").trim().to_string()
}

/// Truncate to at most `max` characters, on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].trim_end().to_string(),
        None => s.to_string(),
    }
}

/// Page title: the first `<h1>`, else `<title>`.
fn extract_title(doc: &Html) -> Option<String> {
    for sel_str in ["#firstHeading", "h1", "title"] {
        let sel = Selector::parse(sel_str).unwrap();
        if let Some(el) = doc.select(&sel).next() {
            let title = collapse_whitespace(&el.text().collect::<String>());
            if !title.is_empty() {
                return Some(title);
            }
        }
    }
    None
}

fn visible_text(root: ElementRef<'_>) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for node in root.descendants() {
        let Some(text) = node.value().as_text() else {
            continue;
        };
        let hidden = node
            .ancestors()
            .take_while(|a| a.id() != root.id())
            .filter_map(ElementRef::wrap)
            .any(is_chrome);
        if !hidden {
            parts.push(&**text);
        }
    }
    collapse_whitespace(&parts.join(" "))
}

fn is_chrome(el: ElementRef<'_>) -> bool {
    let value = el.value();
    CHROME_TAGS.contains(&value.name()) || value.classes().any(|c| CHROME_CLASSES.contains(&c))
}
