//! SQL DDL for the HMLR database. One `CREATE TABLE IF NOT EXISTS` statement
//! per entity in §3, executed once at [`super::Storage::open`].

pub const CURRENT_SCHEMA_VERSION: u32 = 1;

pub const SCHEMA_SQL: &str = r"
CREATE TABLE IF NOT EXISTS schema_info (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- Bridge blocks: the short-term ledger.
CREATE TABLE IF NOT EXISTS daily_ledger (
    block_id TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    topic_label TEXT NOT NULL,
    keywords TEXT NOT NULL,
    rolling_summary TEXT NOT NULL,
    turn_ids TEXT NOT NULL,
    open_loops TEXT NOT NULL,
    decisions TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_ledger_status ON daily_ledger(status);

CREATE TABLE IF NOT EXISTS turns (
    turn_id TEXT PRIMARY KEY,
    block_id TEXT NOT NULL,
    ordinal INTEGER NOT NULL,
    user_text TEXT NOT NULL,
    ai_text TEXT NOT NULL,
    created_at TEXT NOT NULL,
    FOREIGN KEY (block_id) REFERENCES daily_ledger(block_id)
);

CREATE INDEX IF NOT EXISTS idx_turns_block ON turns(block_id, ordinal);

CREATE TABLE IF NOT EXISTS chunks (
    chunk_id TEXT PRIMARY KEY,
    turn_id TEXT NOT NULL,
    parent_id TEXT,
    level TEXT NOT NULL,
    text TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    ordinal INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_chunks_turn ON chunks(turn_id);

-- Key/value facts. Append-only: never UPDATE, only INSERT.
CREATE TABLE IF NOT EXISTS fact_store (
    fact_id TEXT PRIMARY KEY,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    created_at TEXT NOT NULL,
    source_block_id TEXT,
    source_chunk_id TEXT,
    rowid_order INTEGER
);

CREATE INDEX IF NOT EXISTS idx_facts_key ON fact_store(key);
CREATE INDEX IF NOT EXISTS idx_facts_block ON fact_store(source_block_id);
CREATE INDEX IF NOT EXISTS idx_facts_chunk ON fact_store(source_chunk_id);

-- Embeddings for ephemeral (pre-gardening) chunks.
CREATE TABLE IF NOT EXISTS embeddings (
    chunk_id TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    FOREIGN KEY (chunk_id) REFERENCES chunks(chunk_id)
);

-- Long-term, gardened chunks with sticky tags joined via block_metadata.
CREATE TABLE IF NOT EXISTS gardened_memory (
    chunk_id TEXT PRIMARY KEY,
    level TEXT NOT NULL,
    parent_id TEXT,
    text TEXT NOT NULL,
    token_count INTEGER NOT NULL,
    source_block_id TEXT NOT NULL,
    turn_ordinal INTEGER NOT NULL,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_gardened_block ON gardened_memory(source_block_id);

CREATE TABLE IF NOT EXISTS gardened_memory_embeddings (
    chunk_id TEXT PRIMARY KEY,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    FOREIGN KEY (chunk_id) REFERENCES gardened_memory(chunk_id)
);

CREATE TABLE IF NOT EXISTS block_metadata (
    block_id TEXT PRIMARY KEY,
    global_tags TEXT NOT NULL,
    section_rules TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dossiers (
    dossier_id TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    summary TEXT NOT NULL,
    status TEXT NOT NULL,
    permissions TEXT NOT NULL,
    created_at TEXT NOT NULL,
    last_updated TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dossier_facts (
    fact_id TEXT PRIMARY KEY,
    dossier_id TEXT NOT NULL,
    text TEXT NOT NULL,
    type TEXT NOT NULL,
    added_at TEXT NOT NULL,
    source_block_id TEXT,
    source_turn_id TEXT,
    confidence REAL NOT NULL,
    FOREIGN KEY (dossier_id) REFERENCES dossiers(dossier_id)
);

CREATE INDEX IF NOT EXISTS idx_dossier_facts_dossier ON dossier_facts(dossier_id);

CREATE TABLE IF NOT EXISTS dossier_fact_embeddings (
    fact_id TEXT PRIMARY KEY,
    dossier_id TEXT NOT NULL,
    embedding BLOB NOT NULL,
    dimensions INTEGER NOT NULL,
    FOREIGN KEY (fact_id) REFERENCES dossier_facts(fact_id)
);

CREATE TABLE IF NOT EXISTS dossier_provenance (
    provenance_id TEXT PRIMARY KEY,
    dossier_id TEXT NOT NULL,
    operation TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    source_block_id TEXT,
    details TEXT NOT NULL,
    FOREIGN KEY (dossier_id) REFERENCES dossiers(dossier_id)
);

CREATE INDEX IF NOT EXISTS idx_provenance_dossier ON dossier_provenance(dossier_id);
";

pub const GET_VERSION_SQL: &str = "SELECT value FROM schema_info WHERE key = 'version';";
pub const SET_VERSION_SQL: &str = "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?1);";
