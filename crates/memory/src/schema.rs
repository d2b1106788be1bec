//! Core data model: bridge blocks, turns, chunks, facts, dossiers and the
//! user profile document. See `daily_ledger` / `fact_store` / `embeddings` /
//! `gardened_memory` / `dossiers` in [`crate::storage`] for the tables these
//! types are mapped onto.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a [`BridgeBlock`]. Exactly one block is `Active` per
/// logical session at any moment (§3 invariant).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BlockStatus {
    Active,
    Paused,
    Closed,
}

impl BlockStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockStatus::Active => "ACTIVE",
            BlockStatus::Paused => "PAUSED",
            BlockStatus::Closed => "CLOSED",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "ACTIVE" => Some(BlockStatus::Active),
            "PAUSED" => Some(BlockStatus::Paused),
            "CLOSED" => Some(BlockStatus::Closed),
            _ => None,
        }
    }
}

/// A short-term, mutable container holding the turns of one ongoing
/// conversational topic plus its accumulated metadata (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeBlock {
    pub block_id: String,
    pub status: BlockStatus,
    pub topic_label: String,
    pub keywords: Vec<String>,
    pub rolling_summary: String,
    pub turn_ids: Vec<String>,
    pub open_loops: Vec<String>,
    pub decisions: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BridgeBlock {
    pub fn new(block_id: String, topic_label: String) -> Self {
        let now = Utc::now();
        Self {
            block_id,
            status: BlockStatus::Active,
            topic_label,
            keywords: Vec::new(),
            rolling_summary: String::new(),
            turn_ids: Vec::new(),
            open_loops: Vec::new(),
            decisions: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// One user/assistant exchange, appended to exactly one block and immutable
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub block_id: String,
    pub ordinal: u32,
    pub user_text: String,
    pub ai_text: String,
    pub created_at: DateTime<Utc>,
}

/// Granularity of a node in the Chunk Engine's turn → paragraph → sentence
/// tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChunkLevel {
    Turn,
    Paragraph,
    Sentence,
}

/// A node of the polymorphic chunk tree (§9: tagged variant with a common
/// `{id, parent_id, text, token_count}` interface plus level-specific
/// fields — `parent_id` is `None` only for the turn-level root).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: String,
    pub turn_id: String,
    pub parent_id: Option<String>,
    pub level: ChunkLevel,
    pub text: String,
    pub token_count: usize,
    pub ordinal: u32,
}

/// A durable key/value fact extracted by the Fact Scrubber. Never updated in
/// place; newest row wins via `created_at` ordering (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fact {
    pub fact_id: String,
    pub key: String,
    pub value: String,
    pub created_at: DateTime<Utc>,
    pub source_block_id: Option<String>,
    pub source_chunk_id: Option<String>,
}

/// Severity of a user-profile constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConstraintSeverity {
    Hard,
    Soft,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileConstraint {
    pub key: String,
    pub r#type: String,
    pub description: String,
    pub severity: ConstraintSeverity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfilePreference {
    pub key: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfileIdentity {
    pub key: String,
    pub description: String,
}

/// The singleton user-profile document: `{glossary: {constraints,
/// preferences, identities}}` (§6). Mutated only by the Scribe.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UserProfile {
    pub glossary: ProfileGlossary,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProfileGlossary {
    #[serde(default)]
    pub constraints: Vec<ProfileConstraint>,
    #[serde(default)]
    pub preferences: Vec<ProfilePreference>,
    #[serde(default)]
    pub identities: Vec<ProfileIdentity>,
}

/// A `{type, value}` annotation governing the interpretation of a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GlobalTagType {
    GlobalRule,
    Deprecation,
    Constraint,
    Decision,
    Fact,
    Alias,
    Status,
    Env,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalTag {
    pub r#type: GlobalTagType,
    pub value: String,
}

/// A turn-range-scoped rule produced by the Gardener's classification pass
/// (e.g. an alias that only holds within `[start_turn, end_turn]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionRule {
    pub start_turn: u32,
    pub end_turn: u32,
    pub rule: String,
}

/// Sticky tags for one gardened block, stored once and joined at read time
/// rather than duplicated onto every chunk (§9).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockMetadata {
    pub block_id: String,
    pub global_tags: Vec<GlobalTag>,
    pub section_rules: Vec<SectionRule>,
}

/// An immutable chunk promoted into the long-term store by the Gardener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GardenedChunk {
    pub chunk_id: String,
    pub level: ChunkLevel,
    pub parent_id: Option<String>,
    pub text: String,
    pub token_count: usize,
    pub source_block_id: String,
    pub turn_ordinal: u32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DossierStatus {
    Open,
    Closed,
}

/// A long-lived, named aggregation of facts on a single theme, built
/// incrementally across many blocks via Multi-Vector Voting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dossier {
    pub dossier_id: String,
    pub title: String,
    pub summary: String,
    pub status: DossierStatus,
    pub permissions: String,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DossierFact {
    pub fact_id: String,
    pub dossier_id: String,
    pub text: String,
    pub r#type: String,
    pub added_at: DateTime<Utc>,
    pub source_block_id: Option<String>,
    pub source_turn_id: Option<String>,
    pub confidence: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DossierOperation {
    Created,
    FactAdded,
    FactRemoved,
    SummaryUpdated,
}

/// Append-only audit row for a dossier mutation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DossierProvenance {
    pub provenance_id: String,
    pub dossier_id: String,
    pub operation: DossierOperation,
    pub timestamp: DateTime<Utc>,
    pub source_block_id: Option<String>,
    pub details: String,
}

/// The Governor's four routing outcomes (§4.5, GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RoutingScenario {
    Continuation,
    Resumption,
    NewTopic,
    TopicShift,
}

/// A candidate chunk or dossier fact returned by the Crawler, ranked by
/// cosine similarity against the query embedding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerCandidate {
    pub source_id: String,
    pub text: String,
    pub source_block_id: Option<String>,
    pub global_tags: Vec<GlobalTag>,
    pub similarity: f32,
    pub source_date: DateTime<Utc>,
    /// Position of the originating turn within its source block, used to
    /// check `SectionRule` turn ranges (§4.6).
    pub turn_ordinal: u32,
}

/// A retrieved dossier fact hit, used by both the Crawler and the
/// Dossier Governor's voting pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DossierCandidate {
    pub dossier_id: String,
    pub fact_id: String,
    pub text: String,
    pub similarity: f32,
}
