//! Write-side Multi-Vector Voting router (§4.8). Appends fact packets to
//! existing dossiers or creates new ones; specific facts outvote vague ones
//! and pull the packet toward the correct dossier even when it contains
//! noise — the core innovation over naive nearest-neighbor routing.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::instrument;

use hmlr_llm::{EmbeddingClient, LlmClient, ResponseFormat};

use crate::ids;
use crate::schema::{Dossier, DossierFact, DossierOperation, DossierProvenance, DossierStatus};
use crate::storage::Storage;

pub const VOTING_TOP_K: usize = 10;
pub const VOTING_THRESHOLD: f32 = 0.4;
const VOTING_CANDIDATE_LIMIT: usize = 5;

/// A group of narrative facts from one Gardener pass, sharing a semantic
/// cluster label (§4.7 dossier pass).
#[derive(Debug, Clone)]
pub struct FactPacket {
    pub cluster_label: String,
    pub facts: Vec<String>,
    pub source_block_id: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct RoutingDecision {
    action: String,
    #[serde(default)]
    target_dossier_id: Option<String>,
}

#[derive(Debug, Clone)]
struct VoteTally {
    dossier_id: String,
    hit_count: usize,
    score_sum: f32,
}

pub struct DossierGovernor {
    llm: Arc<dyn LlmClient>,
    embedder: Arc<dyn EmbeddingClient>,
    model: String,
}

impl DossierGovernor {
    pub fn new(llm: Arc<dyn LlmClient>, embedder: Arc<dyn EmbeddingClient>, model: impl Into<String>) -> Self {
        Self { llm, embedder, model: model.into() }
    }

    #[instrument(skip(self, storage, packet), fields(cluster = %packet.cluster_label))]
    pub async fn process_packet(&self, storage: &Storage, packet: &FactPacket) -> Result<String> {
        let tallies = self.vote(storage, packet).await?;

        if tallies.is_empty() {
            return self.create_dossier(storage, packet).await;
        }

        let decision = self.choose(storage, packet, &tallies).await;
        match decision {
            Some(decision) if decision.action == "append" => {
                if let Some(target_id) = decision.target_dossier_id {
                    if storage.get_dossier(&target_id)?.is_some() {
                        return self.append_to_dossier(storage, &target_id, packet).await;
                    }
                }
                self.create_dossier(storage, packet).await
            }
            _ => self.create_dossier(storage, packet).await,
        }
    }

    /// Step 1-3 of Multi-Vector Voting: crawl dossier fact embeddings per
    /// fact, tally hits per dossier_id, sum similarity as tiebreaker, sort
    /// by (hit_count DESC, score_sum DESC), take top 5. Deterministic given
    /// identical embeddings and thresholds (§8 voting-determinism).
    async fn vote(&self, storage: &Storage, packet: &FactPacket) -> Result<Vec<VoteTally>> {
        let mut tallies: HashMap<String, (usize, f32)> = HashMap::new();

        for fact_text in &packet.facts {
            let Ok(embedding) = self.embedder.encode(fact_text).await else { continue };
            let hits = storage.search_dossier_fact_embeddings(&embedding, VOTING_THRESHOLD, VOTING_TOP_K)?;
            for hit in hits {
                let entry = tallies.entry(hit.dossier_id).or_insert((0, 0.0));
                entry.0 += 1;
                entry.1 += hit.similarity;
            }
        }

        let mut ranked: Vec<VoteTally> = tallies
            .into_iter()
            .map(|(dossier_id, (hit_count, score_sum))| VoteTally { dossier_id, hit_count, score_sum })
            .collect();
        ranked.sort_by(|a, b| b.hit_count.cmp(&a.hit_count).then(b.score_sum.partial_cmp(&a.score_sum).unwrap_or(std::cmp::Ordering::Equal)));
        ranked.truncate(VOTING_CANDIDATE_LIMIT);
        Ok(ranked)
    }

    async fn choose(&self, storage: &Storage, packet: &FactPacket, tallies: &[VoteTally]) -> Option<RoutingDecision> {
        let mut candidate_views = Vec::new();
        for tally in tallies {
            let Some(dossier) = storage.get_dossier(&tally.dossier_id).ok().flatten() else { continue };
            let facts = storage.facts_for_dossier(&tally.dossier_id).ok().unwrap_or_default();
            let fact_list = facts.iter().map(|f| f.text.clone()).collect::<Vec<_>>().join("; ");
            candidate_views.push(format!(
                "dossier_id={} title=\"{}\" summary=\"{}\" facts=\"{fact_list}\"",
                dossier.dossier_id, dossier.title, dossier.summary
            ));
        }

        let prompt = format!(
            r#"Incoming facts (cluster "{}"): {}

Candidate dossiers, ranked by vote:
{}

Choose whether to append the incoming facts to one of these dossiers or create a new
one. Respond as JSON: {{"action": "append"|"create", "target_dossier_id": "..."}}"#,
            packet.cluster_label,
            packet.facts.join("; "),
            candidate_views.join("\n")
        );

        let raw = self.llm.query(&prompt, &self.model, ResponseFormat::Json).await.ok()?;
        serde_json::from_str(&raw).ok()
    }

    async fn append_to_dossier(&self, storage: &Storage, dossier_id: &str, packet: &FactPacket) -> Result<String> {
        let dossier = storage.get_dossier(dossier_id)?.expect("checked by caller");

        for fact_text in &packet.facts {
            let fact = DossierFact {
                fact_id: ids::dossier_fact_id(),
                dossier_id: dossier_id.to_string(),
                text: fact_text.clone(),
                r#type: "narrative".to_string(),
                added_at: packet.timestamp,
                source_block_id: Some(packet.source_block_id.clone()),
                source_turn_id: None,
                confidence: 0.8,
            };
            let embedding = self.embedder.encode(fact_text).await.unwrap_or_default();
            storage.insert_dossier_fact(&fact, &embedding)?;
            storage.insert_dossier_provenance(&DossierProvenance {
                provenance_id: ids::provenance_id(),
                dossier_id: dossier_id.to_string(),
                operation: DossierOperation::FactAdded,
                timestamp: Utc::now(),
                source_block_id: Some(packet.source_block_id.clone()),
                details: fact_text.clone(),
            })?;
        }

        let summary_prompt = format!(
            "Rewrite this dossier summary given new facts, without duplicating existing content.\nOld summary: {}\nNew facts: {}",
            dossier.summary,
            packet.facts.join("; ")
        );
        if let Ok(new_summary) = self.llm.query(&summary_prompt, &self.model, ResponseFormat::Text).await {
            storage.update_dossier_summary(dossier_id, &new_summary)?;
            storage.insert_dossier_provenance(&DossierProvenance {
                provenance_id: ids::provenance_id(),
                dossier_id: dossier_id.to_string(),
                operation: DossierOperation::SummaryUpdated,
                timestamp: Utc::now(),
                source_block_id: Some(packet.source_block_id.clone()),
                details: "summary rewritten".to_string(),
            })?;
        }

        Ok(dossier_id.to_string())
    }

    async fn create_dossier(&self, storage: &Storage, packet: &FactPacket) -> Result<String> {
        let dossier_id = ids::dossier_id();
        let summary_prompt = format!("Write a one-paragraph summary of these facts: {}", packet.facts.join("; "));
        let summary = self.llm.query(&summary_prompt, &self.model, ResponseFormat::Text).await.unwrap_or_else(|_| packet.facts.join("; "));

        let now = Utc::now();
        storage.insert_dossier(&Dossier {
            dossier_id: dossier_id.clone(),
            title: packet.cluster_label.clone(),
            summary,
            status: DossierStatus::Open,
            permissions: "owner".to_string(),
            created_at: now,
            last_updated: now,
        })?;
        storage.insert_dossier_provenance(&DossierProvenance {
            provenance_id: ids::provenance_id(),
            dossier_id: dossier_id.clone(),
            operation: DossierOperation::Created,
            timestamp: now,
            source_block_id: Some(packet.source_block_id.clone()),
            details: format!("created from cluster '{}'", packet.cluster_label),
        })?;

        for fact_text in &packet.facts {
            let fact = DossierFact {
                fact_id: ids::dossier_fact_id(),
                dossier_id: dossier_id.clone(),
                text: fact_text.clone(),
                r#type: "narrative".to_string(),
                added_at: packet.timestamp,
                source_block_id: Some(packet.source_block_id.clone()),
                source_turn_id: None,
                confidence: 0.8,
            };
            let embedding = self.embedder.encode(fact_text).await.unwrap_or_default();
            storage.insert_dossier_fact(&fact, &embedding)?;
            storage.insert_dossier_provenance(&DossierProvenance {
                provenance_id: ids::provenance_id(),
                dossier_id: dossier_id.clone(),
                operation: DossierOperation::FactAdded,
                timestamp: now,
                source_block_id: Some(packet.source_block_id.clone()),
                details: fact_text.clone(),
            })?;
        }

        Ok(dossier_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hmlr_llm::HashEmbeddingClient;

    struct StubLlm(std::sync::Mutex<Vec<String>>);

    impl StubLlm {
        fn sequence(responses: Vec<&str>) -> Self {
            Self(std::sync::Mutex::new(responses.into_iter().rev().map(String::from).collect()))
        }
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn query(&self, _prompt: &str, _model: &str, _format: ResponseFormat) -> anyhow::Result<String> {
            Ok(self.0.lock().unwrap().pop().unwrap_or_else(|| "unused summary".to_string()))
        }
    }

    #[tokio::test]
    async fn creates_dossier_when_no_candidates_exist() {
        let storage = Storage::in_memory().unwrap();
        let llm = StubLlm::sequence(vec!["Vegetarian, avoids meat."]);
        let governor = DossierGovernor::new(Arc::new(llm), Arc::new(HashEmbeddingClient::new(32)), "mini");

        let packet = FactPacket {
            cluster_label: "Vegetarian Diet".to_string(),
            facts: vec!["avoids meat".to_string()],
            source_block_id: "bb_1".to_string(),
            timestamp: Utc::now(),
        };

        let dossier_id = governor.process_packet(&storage, &packet).await.unwrap();
        let provenance = storage.provenance_for_dossier(&dossier_id).unwrap();
        assert_eq!(provenance[0].operation, DossierOperation::Created);
        assert!(provenance.iter().any(|p| p.operation == DossierOperation::FactAdded));
    }

    #[tokio::test]
    async fn incremental_build_appends_to_existing_dossier() {
        let storage = Storage::in_memory().unwrap();
        let embedder = Arc::new(HashEmbeddingClient::new(32));

        let first_llm = StubLlm::sequence(vec!["Vegetarian diet summary."]);
        let governor_one = DossierGovernor::new(Arc::new(first_llm), embedder.clone(), "mini");
        let first_packet = FactPacket {
            cluster_label: "Vegetarian Diet".to_string(),
            facts: vec!["avoids meat".to_string(), "vegetarian".to_string()],
            source_block_id: "bb_1".to_string(),
            timestamp: Utc::now(),
        };
        let dossier_id = governor_one.process_packet(&storage, &first_packet).await.unwrap();

        let second_llm = StubLlm::sequence(vec![
            &format!(r#"{{"action":"append","target_dossier_id":"{dossier_id}"}}"#),
            "Vegetarian diet; also avoids eggs and dairy.",
        ]);
        let governor_two = DossierGovernor::new(Arc::new(second_llm), embedder, "mini");
        let second_packet = FactPacket {
            cluster_label: "Vegetarian Diet".to_string(),
            facts: vec!["avoids eggs and dairy".to_string()],
            source_block_id: "bb_2".to_string(),
            timestamp: Utc::now(),
        };
        let result_id = governor_two.process_packet(&storage, &second_packet).await.unwrap();

        assert_eq!(result_id, dossier_id);
        let facts = storage.facts_for_dossier(&dossier_id).unwrap();
        assert!(facts.len() >= 2);
        let provenance = storage.provenance_for_dossier(&dossier_id).unwrap();
        assert_eq!(provenance.iter().filter(|p| p.operation == DossierOperation::Created).count(), 1);
        assert!(provenance.iter().filter(|p| p.operation == DossierOperation::FactAdded).count() >= 1);
    }
}
