// Persisted Schema
// DDL for the shared relational store. Table and column names are the
// contract every tool (coordinator, worker, deadletter, queue CLI) reads
// and writes; renaming anything here is a breaking change.

/// Tables in dependency order; dropped in reverse.
pub const TABLES: &[&str] = &[
    "processing_runs",
    "document_queue",
    "run_workers",
    "documents",
    "elements",
    "relationships",
    "entities",
    "element_entity_mappings",
    "entity_relationships",
];

pub const CREATE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS processing_runs (
    run_id              TEXT PRIMARY KEY,
    status              TEXT NOT NULL DEFAULT 'active',
    config_hash         TEXT NOT NULL,
    created_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at          TIMESTAMPTZ NOT NULL DEFAULT now(),
    worker_count        BIGINT NOT NULL DEFAULT 0,
    documents_queued    BIGINT NOT NULL DEFAULT 0,
    documents_processed BIGINT NOT NULL DEFAULT 0,
    documents_failed    BIGINT NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS document_queue (
    queue_id          BIGSERIAL PRIMARY KEY,
    run_id            TEXT NOT NULL REFERENCES processing_runs(run_id),
    doc_id            TEXT NOT NULL,
    source_name       TEXT NOT NULL,
    state             TEXT NOT NULL DEFAULT 'pending',
    priority          INTEGER NOT NULL DEFAULT 100,
    retry_count       INTEGER NOT NULL DEFAULT 0,
    claimed_by_worker TEXT,
    claimed_at        TIMESTAMPTZ,
    last_heartbeat    TIMESTAMPTZ,
    next_attempt_at   TIMESTAMPTZ,
    metadata          JSONB NOT NULL DEFAULT '{}',
    error_info        JSONB,
    created_at        TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at        TIMESTAMPTZ NOT NULL DEFAULT now()
);

-- At most one non-terminal item per (run, document); the backbone of
-- idempotent enqueue under concurrent coordinators and link discovery.
CREATE UNIQUE INDEX IF NOT EXISTS idx_document_queue_active
    ON document_queue (run_id, doc_id)
    WHERE state NOT IN ('completed', 'failed');

CREATE INDEX IF NOT EXISTS idx_document_queue_claimable
    ON document_queue (run_id, state, priority, created_at);

CREATE TABLE IF NOT EXISTS run_workers (
    worker_id           TEXT NOT NULL,
    run_id              TEXT NOT NULL REFERENCES processing_runs(run_id),
    status              TEXT NOT NULL DEFAULT 'active',
    hostname            TEXT NOT NULL DEFAULT '',
    last_heartbeat      TIMESTAMPTZ NOT NULL DEFAULT now(),
    documents_processed BIGINT NOT NULL DEFAULT 0,
    documents_failed    BIGINT NOT NULL DEFAULT 0,
    registered_at       TIMESTAMPTZ NOT NULL DEFAULT now(),
    PRIMARY KEY (worker_id, run_id)
);

CREATE TABLE IF NOT EXISTS documents (
    doc_id       TEXT PRIMARY KEY,
    doc_type     TEXT NOT NULL,
    source       TEXT NOT NULL,
    content_hash TEXT NOT NULL,
    metadata     JSONB NOT NULL DEFAULT '{}',
    created_at   TIMESTAMPTZ NOT NULL DEFAULT now(),
    updated_at   TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS elements (
    element_pk        BIGSERIAL PRIMARY KEY,
    element_id        TEXT NOT NULL UNIQUE,
    doc_id            TEXT NOT NULL REFERENCES documents(doc_id) ON DELETE CASCADE,
    parent_id         TEXT,
    element_type      TEXT NOT NULL,
    content_preview   TEXT NOT NULL DEFAULT '',
    content_location  JSONB NOT NULL DEFAULT 'null',
    content_hash      TEXT NOT NULL DEFAULT '',
    element_order     INTEGER NOT NULL DEFAULT 0,
    document_position INTEGER NOT NULL,
    metadata          JSONB NOT NULL DEFAULT '{}',
    embedding         REAL[],
    UNIQUE (doc_id, document_position)
);

CREATE INDEX IF NOT EXISTS idx_elements_doc ON elements (doc_id, document_position);

CREATE TABLE IF NOT EXISTS relationships (
    relationship_id   TEXT PRIMARY KEY,
    source_id         TEXT NOT NULL,
    target_id         TEXT NOT NULL,
    relationship_type TEXT NOT NULL,
    metadata          JSONB NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships (source_id);
CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships (target_id);

CREATE TABLE IF NOT EXISTS entities (
    entity_pk   BIGSERIAL PRIMARY KEY,
    entity_id   TEXT NOT NULL UNIQUE,
    entity_type TEXT NOT NULL,
    name        TEXT NOT NULL,
    domain      TEXT NOT NULL DEFAULT '',
    attributes  JSONB NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS element_entity_mappings (
    element_pk        BIGINT NOT NULL REFERENCES elements(element_pk) ON DELETE CASCADE,
    entity_pk         BIGINT NOT NULL REFERENCES entities(entity_pk) ON DELETE CASCADE,
    relationship_type TEXT NOT NULL DEFAULT 'DERIVED_FROM',
    domain            TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (element_pk, entity_pk, relationship_type)
);

CREATE INDEX IF NOT EXISTS idx_entity_mappings_entity ON element_entity_mappings (entity_pk);

CREATE TABLE IF NOT EXISTS entity_relationships (
    source_pk         BIGINT NOT NULL REFERENCES entities(entity_pk) ON DELETE CASCADE,
    target_pk         BIGINT NOT NULL REFERENCES entities(entity_pk) ON DELETE CASCADE,
    relationship_type TEXT NOT NULL,
    confidence        DOUBLE PRECISION NOT NULL DEFAULT 1.0,
    domain            TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (source_pk, target_pk, relationship_type)
);
"#;

pub const DROP_SCHEMA_SQL: &str = r#"
DROP TABLE IF EXISTS entity_relationships CASCADE;
DROP TABLE IF EXISTS element_entity_mappings CASCADE;
DROP TABLE IF EXISTS entities CASCADE;
DROP TABLE IF EXISTS relationships CASCADE;
DROP TABLE IF EXISTS elements CASCADE;
DROP TABLE IF EXISTS documents CASCADE;
DROP TABLE IF EXISTS run_workers CASCADE;
DROP TABLE IF EXISTS document_queue CASCADE;
DROP TABLE IF EXISTS processing_runs CASCADE;
"#;

/// Query returning one row per existing table from TABLES.
pub const CHECK_TABLES_SQL: &str = r#"
SELECT table_name FROM information_schema.tables
WHERE table_schema = 'public' AND table_name = ANY($1)
"#;
