//! Offline/on-demand pipeline converting aged bridge blocks into block
//! metadata, dossiers, and finally deleting the consumed block (§4.7).
//! Failure on any step aborts gardening of that block; the block remains
//! intact for retry. Deletion is the atomic commit boundary and runs last.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use hmlr_llm::{EmbeddingClient, LlmClient, ResponseFormat};

use crate::dossier_governor::{DossierGovernor, FactPacket};
use crate::governor::GardenLocks;
use crate::schema::{BlockMetadata, Fact, GardenedChunk, GlobalTag, GlobalTagType, SectionRule};
use crate::storage::Storage;

#[derive(Debug, Deserialize)]
struct ClassificationResponse {
    #[serde(default)]
    classifications: Vec<FactClassification>,
}

#[derive(Debug, Deserialize)]
struct FactClassification {
    fact_id: String,
    category: String,
    #[serde(default)]
    tag_value: Option<String>,
    #[serde(default)]
    start_turn: Option<u32>,
    #[serde(default)]
    end_turn: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ClusterResponse {
    #[serde(default)]
    clusters: Vec<ClusterGroup>,
}

#[derive(Debug, Deserialize)]
struct ClusterGroup {
    label: String,
    fact_ids: Vec<String>,
}

pub struct Gardener {
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn EmbeddingClient>,
    model: String,
    dossier_governor: DossierGovernor,
    locks: GardenLocks,
}

impl Gardener {
    pub fn new(llm: Arc<dyn LlmClient>, embedder: Arc<dyn EmbeddingClient>, model: impl Into<String>, locks: GardenLocks) -> Self {
        let model = model.into();
        let dossier_governor = DossierGovernor::new(llm.clone(), embedder.clone(), model.clone());
        Self { llm, embedder, model, dossier_governor, locks }
    }

    #[instrument(skip(self, storage), fields(block_id = %block_id))]
    pub async fn garden(&self, storage: &Storage, block_id: &str) -> Result<()> {
        self.lock(block_id);
        let result = self.garden_inner(storage, block_id).await;
        self.unlock(block_id);
        result
    }

    async fn garden_inner(&self, storage: &Storage, block_id: &str) -> Result<()> {
        let Some(block) = storage.get_block(block_id)? else {
            warn!("gardener: block not found, nothing to do");
            return Ok(());
        };
        let facts = storage.get_facts_for_block(block_id)?;
        let turns = storage.turns_for_block(block_id)?;

        let classifications = self.classify_facts(&facts).await;

        let mut global_tags = Vec::new();
        let mut section_rules = Vec::new();
        let mut narrative_fact_ids: Vec<String> = facts.iter().map(|f| f.fact_id.clone()).collect();

        if let Some(classifications) = classifications {
            narrative_fact_ids.clear();
            let classified_ids: std::collections::HashSet<String> = classifications.iter().map(|c| c.fact_id.clone()).collect();

            for classification in &classifications {
                match classification.category.as_str() {
                    "environment" => {
                        if let Some(value) = &classification.tag_value {
                            global_tags.push(GlobalTag { r#type: GlobalTagType::Env, value: value.clone() });
                        }
                    }
                    "constraint" => {
                        if let Some(value) = &classification.tag_value {
                            global_tags.push(GlobalTag { r#type: GlobalTagType::Constraint, value: value.clone() });
                        }
                    }
                    "definition_alias" => {
                        if let (Some(value), Some(start), Some(end)) =
                            (&classification.tag_value, classification.start_turn, classification.end_turn)
                        {
                            section_rules.push(SectionRule { start_turn: start, end_turn: end, rule: value.clone() });
                        }
                    }
                    _ => narrative_fact_ids.push(classification.fact_id.clone()),
                }
            }

            for fact in &facts {
                if !classified_ids.contains(&fact.fact_id) {
                    narrative_fact_ids.push(fact.fact_id.clone());
                }
            }
        }

        storage.upsert_block_metadata(&BlockMetadata { block_id: block_id.to_string(), global_tags, section_rules })?;

        for (ordinal, turn) in turns.iter().enumerate() {
            let text = format!("{}\n{}", turn.user_text, turn.ai_text);
            if let Ok(embedding) = self.embedder.encode(&text).await {
                let gardened = GardenedChunk {
                    chunk_id: turn.turn_id.clone(),
                    level: crate::schema::ChunkLevel::Turn,
                    parent_id: None,
                    text,
                    token_count: turn.user_text.split_whitespace().count() + turn.ai_text.split_whitespace().count(),
                    source_block_id: block_id.to_string(),
                    turn_ordinal: ordinal as u32,
                    created_at: turn.created_at,
                };
                storage.insert_gardened_chunk(&gardened, &embedding)?;
            }
        }

        let narrative_facts: Vec<&Fact> = facts.iter().filter(|f| narrative_fact_ids.contains(&f.fact_id)).collect();
        let packets = self.cluster_into_packets(&narrative_facts, block_id).await;

        for packet in &packets {
            self.dossier_governor.process_packet(storage, packet).await?;
        }

        storage.delete_block(block_id)?;
        info!(block_id, facts = facts.len(), packets = packets.len(), "gardening complete");
        let _ = block;
        Ok(())
    }

    fn lock(&self, block_id: &str) {
        self.locks.lock().expect("garden locks poisoned").insert(block_id.to_string());
    }

    fn unlock(&self, block_id: &str) {
        self.locks.lock().expect("garden locks poisoned").remove(block_id);
    }

    /// One structured LLM call applying the three heuristics: environment,
    /// constraint, definition/alias. Facts matching none are narrative.
    async fn classify_facts(&self, facts: &[Fact]) -> Option<Vec<FactClassification>> {
        if facts.is_empty() {
            return Some(Vec::new());
        }
        let fact_view = facts.iter().map(|f| format!("fact_id={} key={} value={}", f.fact_id, f.key, f.value)).collect::<Vec<_>>().join("\n");
        let prompt = format!(
            r#"Classify each fact below into one of: environment (defines a setting/version/language),
constraint (forbids or mandates something), definition_alias (renames/redefines an entity
within a turn range), or narrative (none of the above). For environment/constraint, give a
short tag_value. For definition_alias, give tag_value, start_turn, end_turn.

Respond as JSON: {{"classifications": [{{"fact_id","category","tag_value","start_turn","end_turn"}}]}}

Facts:
{fact_view}"#
        );
        let raw = self.llm.query(&prompt, &self.model, ResponseFormat::Json).await.ok()?;
        serde_json::from_str::<ClassificationResponse>(&raw).ok().map(|r| r.classifications)
    }

    /// One LLM call groups narrative facts into semantic clusters, each
    /// becoming a fact packet for the Dossier Governor.
    async fn cluster_into_packets(&self, narrative_facts: &[&Fact], block_id: &str) -> Vec<FactPacket> {
        if narrative_facts.is_empty() {
            return Vec::new();
        }

        let fact_view = narrative_facts.iter().map(|f| format!("fact_id={} value={}", f.fact_id, f.value)).collect::<Vec<_>>().join("\n");
        let prompt = format!(
            r#"Group the following facts into semantic clusters, each with a short label.
Respond as JSON: {{"clusters": [{{"label","fact_ids":[...]}}]}}

Facts:
{fact_view}"#
        );

        let clusters = match self.llm.query(&prompt, &self.model, ResponseFormat::Json).await {
            Ok(raw) => serde_json::from_str::<ClusterResponse>(&raw).ok().map(|r| r.clusters),
            Err(_) => None,
        };

        let Some(clusters) = clusters else {
            return vec![FactPacket {
                cluster_label: "uncategorized".to_string(),
                facts: narrative_facts.iter().map(|f| f.value.clone()).collect(),
                source_block_id: block_id.to_string(),
                timestamp: Utc::now(),
            }];
        };

        clusters
            .into_iter()
            .map(|cluster| {
                let facts = narrative_facts
                    .iter()
                    .filter(|f| cluster.fact_ids.contains(&f.fact_id))
                    .map(|f| f.value.clone())
                    .collect();
                FactPacket { cluster_label: cluster.label, facts, source_block_id: block_id.to_string(), timestamp: Utc::now() }
            })
            .collect()
    }
}
