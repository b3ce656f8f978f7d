//! SQL migration definitions for the PatchScout database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: topics, source_pages, citations, content, memories, frontier, stop_flags, crawl_runs",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Tracked topics ("patches")
CREATE TABLE IF NOT EXISTS topics (
    id           TEXT PRIMARY KEY,
    handle       TEXT NOT NULL UNIQUE,
    title        TEXT NOT NULL,
    aliases_json TEXT NOT NULL DEFAULT '[]',
    tags_json    TEXT NOT NULL DEFAULT '[]',
    created_at   TEXT NOT NULL
);

-- Pages fetched by the crawler, once per canonical URL per topic
CREATE TABLE IF NOT EXISTS source_pages (
    id            TEXT PRIMARY KEY,
    patch_id      TEXT NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
    url           TEXT NOT NULL,
    canonical_url TEXT NOT NULL,
    title         TEXT,
    fetched_at    TEXT NOT NULL,
    UNIQUE(patch_id, canonical_url)
);

-- Persisted discovery results
CREATE TABLE IF NOT EXISTS content (
    id              TEXT PRIMARY KEY,
    patch_id        TEXT NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
    canonical_url   TEXT NOT NULL,
    url             TEXT NOT NULL,
    title           TEXT NOT NULL,
    text            TEXT NOT NULL,
    text_hash       TEXT NOT NULL,
    relevance_score INTEGER NOT NULL,
    quality_score   INTEGER NOT NULL,
    created_at      TEXT NOT NULL,
    UNIQUE(patch_id, canonical_url)
);

-- Outbound references discovered on source pages
CREATE TABLE IF NOT EXISTS citations (
    id                  TEXT PRIMARY KEY,
    patch_id            TEXT NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
    source_page_id      TEXT NOT NULL REFERENCES source_pages(id) ON DELETE CASCADE,
    citation_url        TEXT NOT NULL,
    canonical_url       TEXT NOT NULL,
    title               TEXT,
    context             TEXT,
    source_number       INTEGER NOT NULL,
    verification_status TEXT NOT NULL DEFAULT 'pending',
    scan_status         TEXT NOT NULL DEFAULT 'not_scanned',
    relevance_decision  TEXT,
    ai_priority_score   INTEGER,
    content_text        TEXT,
    saved_content_id    TEXT REFERENCES content(id),
    error_message       TEXT,
    fetch_attempts      INTEGER NOT NULL DEFAULT 0,
    created_at          TEXT NOT NULL,
    updated_at          TEXT NOT NULL,
    UNIQUE(source_page_id, source_number),
    UNIQUE(source_page_id, canonical_url),
    CHECK (relevance_decision IS NULL OR scan_status IN ('scanned', 'scanned_denied')),
    CHECK (saved_content_id IS NULL OR relevance_decision = 'saved')
);

CREATE INDEX IF NOT EXISTS idx_citations_patch_canonical ON citations(patch_id, canonical_url);
CREATE INDEX IF NOT EXISTS idx_citations_patch_decision ON citations(patch_id, relevance_decision);

-- Derived index entries
CREATE TABLE IF NOT EXISTS memories (
    id            TEXT PRIMARY KEY,
    patch_id      TEXT NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
    content_id    TEXT REFERENCES content(id) ON DELETE CASCADE,
    canonical_url TEXT NOT NULL,
    title         TEXT NOT NULL,
    summary       TEXT NOT NULL,
    created_at    TEXT NOT NULL,
    UNIQUE(patch_id, canonical_url)
);

-- Crawl frontier; rowid order gives FIFO within a priority
CREATE TABLE IF NOT EXISTS frontier (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    patch_id       TEXT NOT NULL,
    canonical_url  TEXT NOT NULL,
    priority       INTEGER NOT NULL DEFAULT 0,
    candidate_json TEXT NOT NULL,
    enqueued_at    TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_frontier_pop ON frontier(patch_id, priority DESC, id);

-- Cooperative stop requests
CREATE TABLE IF NOT EXISTS stop_flags (
    patch_id     TEXT PRIMARY KEY,
    requested_at TEXT NOT NULL
);

-- Crawl run history
CREATE TABLE IF NOT EXISTS crawl_runs (
    id          TEXT PRIMARY KEY,
    patch_id    TEXT NOT NULL REFERENCES topics(id) ON DELETE CASCADE,
    started_at  TEXT NOT NULL,
    finished_at TEXT,
    outcome     TEXT,
    stats_json  TEXT
);

CREATE INDEX IF NOT EXISTS idx_crawl_runs_patch ON crawl_runs(patch_id, started_at);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
