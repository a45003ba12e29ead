//! SQLite schema definitions

/// Schema for the jobs database: reference data, sources, summaries and the
/// pre-processing cache index
pub const JOBS_SCHEMA_SQL: &str = r#"
-- Reference data, seeded from configuration
CREATE TABLE IF NOT EXISTS languages (
    language_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    language_tag TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS vendors (
    vendor_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS model_families (
    family_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE
);

CREATE TABLE IF NOT EXISTS models (
    model_id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    family_id INTEGER NOT NULL REFERENCES model_families(family_id),
    vendor_id INTEGER NOT NULL REFERENCES vendors(vendor_id)
);

CREATE TABLE IF NOT EXISTS model_tasks (
    model_id INTEGER NOT NULL REFERENCES models(model_id) ON DELETE CASCADE,
    task TEXT NOT NULL CHECK (task IN (
        'summarization', 'translation', 'text-generation',
        'question-answering', 'text-classification'
    )),
    PRIMARY KEY (model_id, task)
);

-- Sources: immutable normalized text keyed by its fingerprint
CREATE TABLE IF NOT EXISTS sources (
    source_id TEXT PRIMARY KEY CHECK (length(source_id) = 64),
    content TEXT NOT NULL,
    content_length INTEGER NOT NULL CHECK (content_length > 0),
    created_at TEXT NOT NULL
);

-- Summaries: one row per job fingerprint
CREATE TABLE IF NOT EXISTS summaries (
    summary_id TEXT PRIMARY KEY CHECK (length(summary_id) = 64),
    source_id TEXT NOT NULL REFERENCES sources(source_id),
    summary TEXT,
    summary_length INTEGER,
    model_name TEXT NOT NULL REFERENCES models(name),
    params TEXT NOT NULL,
    status TEXT NOT NULL CHECK (status IN (
        'preprocessing', 'encoding', 'summarizing', 'postprocessing', 'completed'
    )),
    started_at TEXT NOT NULL,
    ended_at TEXT,
    language_tag TEXT NOT NULL REFERENCES languages(language_tag),
    request_count INTEGER NOT NULL DEFAULT 0 CHECK (request_count >= 0),
    warnings TEXT,
    cache INTEGER NOT NULL DEFAULT 1,
    last_accessed TEXT NOT NULL,
    status_changed_at TEXT NOT NULL,
    preprocessed_source_id TEXT REFERENCES sources(source_id),
    stage_payload TEXT,
    CHECK ((status = 'completed') = (ended_at IS NOT NULL))
);

-- Pre-processing cache: raw source fingerprint -> job holding its
-- pre-processed form
CREATE TABLE IF NOT EXISTS raw_to_preprocessed (
    raw_id TEXT NOT NULL UNIQUE,
    preprocessed_id TEXT NOT NULL REFERENCES summaries(summary_id) ON DELETE CASCADE,
    cache INTEGER NOT NULL DEFAULT 1,
    last_accessed TEXT NOT NULL,
    warnings TEXT,
    created_at TEXT NOT NULL,
    PRIMARY KEY (raw_id, preprocessed_id)
);

CREATE TRIGGER IF NOT EXISTS sources_immutable
BEFORE UPDATE ON sources
BEGIN
    SELECT RAISE(ABORT, 'sources are immutable');
END;

CREATE INDEX IF NOT EXISTS idx_summaries_status ON summaries(status);
CREATE INDEX IF NOT EXISTS idx_summaries_source ON summaries(source_id);
CREATE INDEX IF NOT EXISTS idx_summaries_preprocessed ON summaries(preprocessed_source_id);
CREATE INDEX IF NOT EXISTS idx_summaries_accessed ON summaries(last_accessed);
CREATE INDEX IF NOT EXISTS idx_raw_preprocessed_job ON raw_to_preprocessed(preprocessed_id);
CREATE INDEX IF NOT EXISTS idx_raw_preprocessed_accessed ON raw_to_preprocessed(last_accessed);
"#;

/// Schema for the files database: deduplicated content and the file index
pub const FILES_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS content (
    content_id TEXT PRIMARY KEY CHECK (length(content_id) = 64),
    data BLOB NOT NULL,
    content_length INTEGER NOT NULL CHECK (content_length > 0),
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS file_to_content (
    file_id TEXT PRIMARY KEY,
    content_id TEXT NOT NULL REFERENCES content(content_id),
    file_type TEXT NOT NULL CHECK (file_type IN ('document', 'audio', 'image', 'video')),
    cache INTEGER NOT NULL DEFAULT 1,
    last_accessed TEXT NOT NULL,
    request_count INTEGER NOT NULL DEFAULT 0 CHECK (request_count >= 0),
    created_at TEXT NOT NULL
);

CREATE TRIGGER IF NOT EXISTS content_immutable
BEFORE UPDATE ON content
BEGIN
    SELECT RAISE(ABORT, 'content is immutable');
END;

CREATE TRIGGER IF NOT EXISTS file_type_immutable
BEFORE UPDATE OF file_type ON file_to_content
WHEN NEW.file_type IS NOT OLD.file_type
BEGIN
    SELECT RAISE(ABORT, 'file_type is immutable');
END;

CREATE INDEX IF NOT EXISTS idx_file_content ON file_to_content(content_id);
CREATE INDEX IF NOT EXISTS idx_file_accessed ON file_to_content(last_accessed);
"#;
