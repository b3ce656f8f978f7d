//! Page fetching, citation extraction, and readable-text extraction.
//!
//! This crate provides:
//! - [`PageFetcher`] / [`HttpFetcher`]: outbound GET with a user agent and a timeout
//! - [`CitationExtractor`]: a page's outbound references, classified internal/external
//! - [`extract_readable`]: title and body text for scoring and saving

pub mod extract;
pub mod fetch;
pub mod text;

pub use extract::{CitationExtractor, CitationKind, RawCitation};
pub use fetch::{FetchedPage, HttpFetcher, PageFetcher};
pub use text::{ReadableText, collapse_whitespace, extract_readable, truncate_chars};
