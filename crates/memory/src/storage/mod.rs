//! `SQLite`-backed persistence for every table in §3. The connection is
//! wrapped in a mutex and treated as a serial resource (§5): `rusqlite`
//! operations are synchronous, so callers never hold the lock across an
//! `.await`.

mod schema_sql;

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use crate::error::{HmlrError, Result, StorageError};
use crate::schema::*;

pub struct Storage {
    conn: Mutex<Connection>,
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn parse_utc(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| HmlrError::Storage(StorageError::Serialization(e.to_string())))
}

impl Storage {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| HmlrError::Storage(StorageError::Database(e.to_string())))?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        let _: String = conn.query_row("PRAGMA journal_mode = WAL;", [], |row| row.get(0))?;
        let storage = Self { conn: Mutex::new(conn) };
        storage.init()?;
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON;", [])?;
        let storage = Self { conn: Mutex::new(conn) };
        storage.init()?;
        Ok(storage)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute_batch(schema_sql::SCHEMA_SQL)?;
        let version: Option<String> = conn
            .query_row(schema_sql::GET_VERSION_SQL, [], |row| row.get(0))
            .optional()?;
        if version.is_none() {
            conn.execute(
                schema_sql::SET_VERSION_SQL,
                params![schema_sql::CURRENT_SCHEMA_VERSION.to_string()],
            )?;
        }
        Ok(())
    }

    // ── daily_ledger / turns ──────────────────────────────────────────────

    pub fn upsert_block(&self, block: &BridgeBlock) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT INTO daily_ledger
                (block_id, status, topic_label, keywords, rolling_summary, turn_ids, open_loops, decisions, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(block_id) DO UPDATE SET
                status = excluded.status,
                topic_label = excluded.topic_label,
                keywords = excluded.keywords,
                rolling_summary = excluded.rolling_summary,
                turn_ids = excluded.turn_ids,
                open_loops = excluded.open_loops,
                decisions = excluded.decisions,
                updated_at = excluded.updated_at",
            params![
                block.block_id,
                block.status.as_str(),
                block.topic_label,
                serde_json::to_string(&block.keywords)?,
                block.rolling_summary,
                serde_json::to_string(&block.turn_ids)?,
                serde_json::to_string(&block.open_loops)?,
                serde_json::to_string(&block.decisions)?,
                block.created_at.to_rfc3339(),
                block.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_block(&self, block_id: &str) -> Result<Option<BridgeBlock>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let row = conn
            .query_row(
                "SELECT block_id, status, topic_label, keywords, rolling_summary, turn_ids, open_loops, decisions, created_at, updated_at
                 FROM daily_ledger WHERE block_id = ?1",
                params![block_id],
                Self::map_block,
            )
            .optional()?;
        Ok(row)
    }

    pub fn active_block(&self) -> Result<Option<BridgeBlock>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let row = conn
            .query_row(
                "SELECT block_id, status, topic_label, keywords, rolling_summary, turn_ids, open_loops, decisions, created_at, updated_at
                 FROM daily_ledger WHERE status = 'ACTIVE' ORDER BY updated_at DESC LIMIT 1",
                [],
                Self::map_block,
            )
            .optional()?;
        Ok(row)
    }

    pub fn all_active_blocks(&self) -> Result<Vec<BridgeBlock>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT block_id, status, topic_label, keywords, rolling_summary, turn_ids, open_loops, decisions, created_at, updated_at
             FROM daily_ledger WHERE status = 'ACTIVE' ORDER BY updated_at ASC",
        )?;
        let rows = stmt.query_map([], Self::map_block)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn ledger_snapshot(&self) -> Result<Vec<BridgeBlock>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT block_id, status, topic_label, keywords, rolling_summary, turn_ids, open_loops, decisions, created_at, updated_at
             FROM daily_ledger WHERE status IN ('ACTIVE', 'PAUSED') ORDER BY updated_at DESC",
        )?;
        let rows = stmt.query_map([], Self::map_block)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn map_block(row: &rusqlite::Row) -> rusqlite::Result<BridgeBlock> {
        let status: String = row.get(1)?;
        let keywords: String = row.get(3)?;
        let turn_ids: String = row.get(5)?;
        let open_loops: String = row.get(6)?;
        let decisions: String = row.get(7)?;
        let created_at: String = row.get(8)?;
        let updated_at: String = row.get(9)?;
        Ok(BridgeBlock {
            block_id: row.get(0)?,
            status: BlockStatus::parse(&status).unwrap_or(BlockStatus::Closed),
            topic_label: row.get(2)?,
            keywords: serde_json::from_str(&keywords).unwrap_or_default(),
            rolling_summary: row.get(4)?,
            turn_ids: serde_json::from_str(&turn_ids).unwrap_or_default(),
            open_loops: serde_json::from_str(&open_loops).unwrap_or_default(),
            decisions: serde_json::from_str(&decisions).unwrap_or_default(),
            created_at: parse_utc(&created_at).unwrap_or_else(|_| Utc::now()),
            updated_at: parse_utc(&updated_at).unwrap_or_else(|_| Utc::now()),
        })
    }

    pub fn delete_block(&self, block_id: &str) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute("DELETE FROM daily_ledger WHERE block_id = ?1", params![block_id])?;
        Ok(())
    }

    pub fn insert_turn(&self, turn: &Turn) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT INTO turns (turn_id, block_id, ordinal, user_text, ai_text, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                turn.turn_id,
                turn.block_id,
                turn.ordinal,
                turn.user_text,
                turn.ai_text,
                turn.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn turns_for_block(&self, block_id: &str) -> Result<Vec<Turn>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT turn_id, block_id, ordinal, user_text, ai_text, created_at
             FROM turns WHERE block_id = ?1 ORDER BY ordinal ASC",
        )?;
        let rows = stmt.query_map(params![block_id], |row| {
            let created_at: String = row.get(5)?;
            Ok(Turn {
                turn_id: row.get(0)?,
                block_id: row.get(1)?,
                ordinal: row.get(2)?,
                user_text: row.get(3)?,
                ai_text: row.get(4)?,
                created_at: parse_utc(&created_at).unwrap_or_else(|_| Utc::now()),
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    // ── chunks / embeddings (ephemeral, pre-gardening) ───────────────────

    pub fn insert_chunk(&self, chunk: &Chunk) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT INTO chunks (chunk_id, turn_id, parent_id, level, text, token_count, ordinal)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                chunk.chunk_id,
                chunk.turn_id,
                chunk.parent_id,
                level_str(chunk.level),
                chunk.text,
                chunk.token_count as i64,
                chunk.ordinal,
            ],
        )?;
        Ok(())
    }

    pub fn insert_embedding(&self, chunk_id: &str, embedding: &[f32]) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT OR REPLACE INTO embeddings (chunk_id, embedding, dimensions) VALUES (?1, ?2, ?3)",
            params![chunk_id, encode_embedding(embedding), embedding.len() as i64],
        )?;
        Ok(())
    }

    pub fn chunks_for_turn(&self, turn_id: &str) -> Result<Vec<Chunk>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT chunk_id, turn_id, parent_id, level, text, token_count, ordinal
             FROM chunks WHERE turn_id = ?1 ORDER BY ordinal ASC",
        )?;
        let rows = stmt.query_map(params![turn_id], Self::map_chunk)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn map_chunk(row: &rusqlite::Row) -> rusqlite::Result<Chunk> {
        let level: String = row.get(3)?;
        let token_count: i64 = row.get(5)?;
        Ok(Chunk {
            chunk_id: row.get(0)?,
            turn_id: row.get(1)?,
            parent_id: row.get(2)?,
            level: parse_level(&level),
            text: row.get(4)?,
            token_count: token_count as usize,
            ordinal: row.get(6)?,
        })
    }

    // ── fact_store (append-only) ─────────────────────────────────────────

    pub fn insert_fact(&self, fact: &Fact) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let next_order: i64 = conn.query_row("SELECT COALESCE(MAX(rowid_order), 0) + 1 FROM fact_store", [], |row| row.get(0))?;
        conn.execute(
            "INSERT INTO fact_store (fact_id, key, value, created_at, source_block_id, source_chunk_id, rowid_order)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                fact.fact_id,
                fact.key,
                fact.value,
                fact.created_at.to_rfc3339(),
                fact.source_block_id,
                fact.source_chunk_id,
                next_order,
            ],
        )?;
        Ok(())
    }

    /// Links all facts whose `source_chunk_id` was produced from `turn_id`
    /// to `block_id`, per §4.2's post-Governor update.
    pub fn link_facts_to_block(&self, turn_id: &str, block_id: &str) -> Result<usize> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let pattern = format!("{turn_id}%");
        let updated = conn.execute(
            "UPDATE fact_store SET source_block_id = ?1
             WHERE source_block_id IS NULL AND source_chunk_id LIKE ?2",
            params![block_id, pattern],
        )?;
        Ok(updated)
    }

    /// `get_facts_for_block(b)`: strictly decreasing `created_at`, ties
    /// broken by insertion order (§8 temporal-ordering property).
    pub fn get_facts_for_block(&self, block_id: &str) -> Result<Vec<Fact>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT fact_id, key, value, created_at, source_block_id, source_chunk_id
             FROM fact_store WHERE source_block_id = ?1
             ORDER BY created_at DESC, rowid_order DESC",
        )?;
        let rows = stmt.query_map(params![block_id], Self::map_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    pub fn facts_by_key(&self, key: &str) -> Result<Vec<Fact>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT fact_id, key, value, created_at, source_block_id, source_chunk_id
             FROM fact_store WHERE key = ?1 ORDER BY created_at DESC, rowid_order DESC",
        )?;
        let rows = stmt.query_map(params![key], Self::map_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn map_fact(row: &rusqlite::Row) -> rusqlite::Result<Fact> {
        let created_at: String = row.get(3)?;
        Ok(Fact {
            fact_id: row.get(0)?,
            key: row.get(1)?,
            value: row.get(2)?,
            created_at: parse_utc(&created_at).unwrap_or_else(|_| Utc::now()),
            source_block_id: row.get(4)?,
            source_chunk_id: row.get(5)?,
        })
    }

    // ── gardened_memory ───────────────────────────────────────────────────

    pub fn insert_gardened_chunk(&self, chunk: &GardenedChunk, embedding: &[f32]) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT INTO gardened_memory
                (chunk_id, level, parent_id, text, token_count, source_block_id, turn_ordinal, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                chunk.chunk_id,
                level_str(chunk.level),
                chunk.parent_id,
                chunk.text,
                chunk.token_count as i64,
                chunk.source_block_id,
                chunk.turn_ordinal,
                chunk.created_at.to_rfc3339(),
            ],
        )?;
        conn.execute(
            "INSERT OR REPLACE INTO gardened_memory_embeddings (chunk_id, embedding, dimensions) VALUES (?1, ?2, ?3)",
            params![chunk.chunk_id, encode_embedding(embedding), embedding.len() as i64],
        )?;
        Ok(())
    }

    /// Cosine-similarity scan over `gardened_memory`. Small-scale (no ANN
    /// index) matches the teacher's in-memory `retrieval.rs` approach; a
    /// production deployment would add a vector index ahead of this table.
    pub fn search_gardened_memory(
        &self,
        query_embedding: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<CrawlerCandidate>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT g.chunk_id, g.text, g.source_block_id, g.turn_ordinal, g.created_at, e.embedding
             FROM gardened_memory g
             JOIN gardened_memory_embeddings e ON e.chunk_id = g.chunk_id",
        )?;
        let mut candidates: Vec<CrawlerCandidate> = Vec::new();
        let rows = stmt.query_map([], |row| {
            let chunk_id: String = row.get(0)?;
            let text: String = row.get(1)?;
            let source_block_id: String = row.get(2)?;
            let turn_ordinal: u32 = row.get(3)?;
            let created_at: String = row.get(4)?;
            let embedding_bytes: Vec<u8> = row.get(5)?;
            Ok((chunk_id, text, source_block_id, turn_ordinal, created_at, embedding_bytes))
        })?;
        for row in rows {
            let (chunk_id, text, source_block_id, turn_ordinal, created_at, embedding_bytes) = row?;
            let embedding = decode_embedding(&embedding_bytes);
            let similarity = hmlr_llm::cosine_similarity(query_embedding, &embedding);
            if similarity < threshold {
                continue;
            }
            let tags = self.global_tags_for_block_locked(&conn, &source_block_id)?;
            candidates.push(CrawlerCandidate {
                source_id: chunk_id,
                text,
                source_block_id: Some(source_block_id),
                global_tags: tags,
                similarity,
                source_date: parse_utc(&created_at).unwrap_or_else(|_| Utc::now()),
                turn_ordinal,
            });
        }
        candidates.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(top_k);
        Ok(candidates)
    }

    // ── block_metadata ────────────────────────────────────────────────────

    pub fn upsert_block_metadata(&self, metadata: &BlockMetadata) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT INTO block_metadata (block_id, global_tags, section_rules)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(block_id) DO UPDATE SET
                global_tags = excluded.global_tags,
                section_rules = excluded.section_rules",
            params![
                metadata.block_id,
                serde_json::to_string(&metadata.global_tags)?,
                serde_json::to_string(&metadata.section_rules)?,
            ],
        )?;
        Ok(())
    }

    pub fn block_metadata(&self, block_id: &str) -> Result<Option<BlockMetadata>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let row = conn
            .query_row(
                "SELECT block_id, global_tags, section_rules FROM block_metadata WHERE block_id = ?1",
                params![block_id],
                Self::map_block_metadata,
            )
            .optional()?;
        Ok(row)
    }

    fn global_tags_for_block_locked(&self, conn: &Connection, block_id: &str) -> rusqlite::Result<Vec<GlobalTag>> {
        let tags: Option<String> = conn
            .query_row(
                "SELECT global_tags FROM block_metadata WHERE block_id = ?1",
                params![block_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(tags.and_then(|t| serde_json::from_str(&t).ok()).unwrap_or_default())
    }

    fn map_block_metadata(row: &rusqlite::Row) -> rusqlite::Result<BlockMetadata> {
        let global_tags: String = row.get(1)?;
        let section_rules: String = row.get(2)?;
        Ok(BlockMetadata {
            block_id: row.get(0)?,
            global_tags: serde_json::from_str(&global_tags).unwrap_or_default(),
            section_rules: serde_json::from_str(&section_rules).unwrap_or_default(),
        })
    }

    // ── dossiers ──────────────────────────────────────────────────────────

    pub fn insert_dossier(&self, dossier: &Dossier) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT INTO dossiers (dossier_id, title, summary, status, permissions, created_at, last_updated)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                dossier.dossier_id,
                dossier.title,
                dossier.summary,
                dossier_status_str(dossier.status),
                dossier.permissions,
                dossier.created_at.to_rfc3339(),
                dossier.last_updated.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_dossier_summary(&self, dossier_id: &str, summary: &str) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "UPDATE dossiers SET summary = ?1, last_updated = ?2 WHERE dossier_id = ?3",
            params![summary, Utc::now().to_rfc3339(), dossier_id],
        )?;
        Ok(())
    }

    pub fn get_dossier(&self, dossier_id: &str) -> Result<Option<Dossier>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let row = conn
            .query_row(
                "SELECT dossier_id, title, summary, status, permissions, created_at, last_updated
                 FROM dossiers WHERE dossier_id = ?1",
                params![dossier_id],
                Self::map_dossier,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_dossiers(&self) -> Result<Vec<Dossier>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT dossier_id, title, summary, status, permissions, created_at, last_updated
             FROM dossiers ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], Self::map_dossier)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn map_dossier(row: &rusqlite::Row) -> rusqlite::Result<Dossier> {
        let status: String = row.get(3)?;
        let created_at: String = row.get(5)?;
        let last_updated: String = row.get(6)?;
        Ok(Dossier {
            dossier_id: row.get(0)?,
            title: row.get(1)?,
            summary: row.get(2)?,
            status: parse_dossier_status(&status),
            permissions: row.get(4)?,
            created_at: parse_utc(&created_at).unwrap_or_else(|_| Utc::now()),
            last_updated: parse_utc(&last_updated).unwrap_or_else(|_| Utc::now()),
        })
    }

    pub fn insert_dossier_fact(&self, fact: &DossierFact, embedding: &[f32]) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT INTO dossier_facts (fact_id, dossier_id, text, type, added_at, source_block_id, source_turn_id, confidence)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                fact.fact_id,
                fact.dossier_id,
                fact.text,
                fact.r#type,
                fact.added_at.to_rfc3339(),
                fact.source_block_id,
                fact.source_turn_id,
                fact.confidence,
            ],
        )?;
        conn.execute(
            "INSERT INTO dossier_fact_embeddings (fact_id, dossier_id, embedding, dimensions) VALUES (?1, ?2, ?3, ?4)",
            params![fact.fact_id, fact.dossier_id, encode_embedding(embedding), embedding.len() as i64],
        )?;
        Ok(())
    }

    pub fn facts_for_dossier(&self, dossier_id: &str) -> Result<Vec<DossierFact>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT fact_id, dossier_id, text, type, added_at, source_block_id, source_turn_id, confidence
             FROM dossier_facts WHERE dossier_id = ?1 ORDER BY added_at ASC",
        )?;
        let rows = stmt.query_map(params![dossier_id], Self::map_dossier_fact)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }

    fn map_dossier_fact(row: &rusqlite::Row) -> rusqlite::Result<DossierFact> {
        let added_at: String = row.get(4)?;
        Ok(DossierFact {
            fact_id: row.get(0)?,
            dossier_id: row.get(1)?,
            text: row.get(2)?,
            r#type: row.get(3)?,
            added_at: parse_utc(&added_at).unwrap_or_else(|_| Utc::now()),
            source_block_id: row.get(5)?,
            source_turn_id: row.get(6)?,
            confidence: row.get(7)?,
        })
    }

    /// Multi-Vector Voting's crawl step (§4.8): cosine similarity over
    /// `dossier_fact_embeddings`, `top_k` default 10, `threshold` default 0.4.
    pub fn search_dossier_fact_embeddings(
        &self,
        query_embedding: &[f32],
        threshold: f32,
        top_k: usize,
    ) -> Result<Vec<DossierCandidate>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT e.fact_id, e.dossier_id, e.embedding, f.text
             FROM dossier_fact_embeddings e
             JOIN dossier_facts f ON f.fact_id = e.fact_id",
        )?;
        let mut candidates = Vec::new();
        let rows = stmt.query_map([], |row| {
            let fact_id: String = row.get(0)?;
            let dossier_id: String = row.get(1)?;
            let embedding_bytes: Vec<u8> = row.get(2)?;
            let text: String = row.get(3)?;
            Ok((fact_id, dossier_id, embedding_bytes, text))
        })?;
        for row in rows {
            let (fact_id, dossier_id, embedding_bytes, text) = row?;
            let embedding = decode_embedding(&embedding_bytes);
            let similarity = hmlr_llm::cosine_similarity(query_embedding, &embedding);
            if similarity < threshold {
                continue;
            }
            candidates.push(DossierCandidate { dossier_id, fact_id, text, similarity });
        }
        candidates.sort_by(|a, b| b.similarity.partial_cmp(&a.similarity).unwrap_or(std::cmp::Ordering::Equal));
        candidates.truncate(top_k);
        Ok(candidates)
    }

    pub fn insert_dossier_provenance(&self, provenance: &DossierProvenance) -> Result<()> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        conn.execute(
            "INSERT INTO dossier_provenance (provenance_id, dossier_id, operation, timestamp, source_block_id, details)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                provenance.provenance_id,
                provenance.dossier_id,
                dossier_operation_str(provenance.operation),
                provenance.timestamp.to_rfc3339(),
                provenance.source_block_id,
                provenance.details,
            ],
        )?;
        Ok(())
    }

    pub fn provenance_for_dossier(&self, dossier_id: &str) -> Result<Vec<DossierProvenance>> {
        let conn = self.conn.lock().expect("storage mutex poisoned");
        let mut stmt = conn.prepare(
            "SELECT provenance_id, dossier_id, operation, timestamp, source_block_id, details
             FROM dossier_provenance WHERE dossier_id = ?1 ORDER BY timestamp ASC",
        )?;
        let rows = stmt.query_map(params![dossier_id], |row| {
            let operation: String = row.get(2)?;
            let timestamp: String = row.get(3)?;
            Ok(DossierProvenance {
                provenance_id: row.get(0)?,
                dossier_id: row.get(1)?,
                operation: parse_dossier_operation(&operation),
                timestamp: parse_utc(&timestamp).unwrap_or_else(|_| Utc::now()),
                source_block_id: row.get(4)?,
                details: row.get(5)?,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Into::into)
    }
}

fn level_str(level: ChunkLevel) -> &'static str {
    match level {
        ChunkLevel::Turn => "turn",
        ChunkLevel::Paragraph => "paragraph",
        ChunkLevel::Sentence => "sentence",
    }
}

fn parse_level(value: &str) -> ChunkLevel {
    match value {
        "paragraph" => ChunkLevel::Paragraph,
        "sentence" => ChunkLevel::Sentence,
        _ => ChunkLevel::Turn,
    }
}

fn dossier_status_str(status: DossierStatus) -> &'static str {
    match status {
        DossierStatus::Open => "open",
        DossierStatus::Closed => "closed",
    }
}

fn parse_dossier_status(value: &str) -> DossierStatus {
    match value {
        "closed" => DossierStatus::Closed,
        _ => DossierStatus::Open,
    }
}

fn dossier_operation_str(op: DossierOperation) -> &'static str {
    match op {
        DossierOperation::Created => "created",
        DossierOperation::FactAdded => "fact_added",
        DossierOperation::FactRemoved => "fact_removed",
        DossierOperation::SummaryUpdated => "summary_updated",
    }
}

fn parse_dossier_operation(value: &str) -> DossierOperation {
    match value {
        "fact_added" => DossierOperation::FactAdded,
        "fact_removed" => DossierOperation::FactRemoved,
        "summary_updated" => DossierOperation::SummaryUpdated,
        _ => DossierOperation::Created,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_round_trips() {
        let storage = Storage::in_memory().unwrap();
        let block = BridgeBlock::new("bb_20260101T000000Z_abcd1234".to_string(), "weather".to_string());
        storage.upsert_block(&block).unwrap();
        let loaded = storage.get_block(&block.block_id).unwrap().unwrap();
        assert_eq!(loaded.topic_label, "weather");
        assert_eq!(loaded.status, BlockStatus::Active);
    }

    #[test]
    fn facts_for_block_are_ordered_newest_first() {
        let storage = Storage::in_memory().unwrap();
        let older = Fact {
            fact_id: "f1".into(),
            key: "api_key".into(),
            value: "ABC123XYZ".into(),
            created_at: DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z").unwrap().with_timezone(&Utc),
            source_block_id: Some("bb_1".into()),
            source_chunk_id: Some("turn_1_p0_s0".into()),
        };
        let newer = Fact {
            fact_id: "f2".into(),
            key: "api_key".into(),
            value: "XYZ789".into(),
            created_at: DateTime::parse_from_rfc3339("2026-01-01T00:05:00Z").unwrap().with_timezone(&Utc),
            source_block_id: Some("bb_1".into()),
            source_chunk_id: Some("turn_2_p0_s0".into()),
        };
        storage.insert_fact(&older).unwrap();
        storage.insert_fact(&newer).unwrap();

        let facts = storage.get_facts_for_block("bb_1").unwrap();
        assert_eq!(facts[0].value, "XYZ789");
        assert_eq!(facts[1].value, "ABC123XYZ");
    }

    #[test]
    fn link_facts_to_block_matches_turn_prefix() {
        let storage = Storage::in_memory().unwrap();
        let fact = Fact {
            fact_id: "f1".into(),
            key: "k".into(),
            value: "v".into(),
            created_at: Utc::now(),
            source_block_id: None,
            source_chunk_id: Some("turn_20260101T000000Z_p0_s0".into()),
        };
        storage.insert_fact(&fact).unwrap();
        let updated = storage.link_facts_to_block("turn_20260101T000000Z", "bb_1").unwrap();
        assert_eq!(updated, 1);
        let facts = storage.get_facts_for_block("bb_1").unwrap();
        assert_eq!(facts.len(), 1);
    }

    #[test]
    fn block_isolation_holds_across_distinct_blocks() {
        let storage = Storage::in_memory().unwrap();
        for (block_id, key) in [("bb_a", "k_a"), ("bb_b", "k_b")] {
            let fact = Fact {
                fact_id: format!("f_{key}"),
                key: key.into(),
                value: "v".into(),
                created_at: Utc::now(),
                source_block_id: Some(block_id.into()),
                source_chunk_id: None,
            };
            storage.insert_fact(&fact).unwrap();
        }
        let a: std::collections::HashSet<_> = storage.get_facts_for_block("bb_a").unwrap().into_iter().map(|f| f.fact_id).collect();
        let b: std::collections::HashSet<_> = storage.get_facts_for_block("bb_b").unwrap().into_iter().map(|f| f.fact_id).collect();
        assert!(a.is_disjoint(&b));
    }
}
