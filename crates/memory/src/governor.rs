//! The router (§4.5). Classifies each query into one of four scenarios,
//! chooses or creates the active bridge block, and LLM-filters the
//! Crawler's candidates down to what is truly relevant.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::Utc;
use serde::Deserialize;
use tracing::{info, instrument, warn};

use hmlr_llm::{LlmClient, ResponseFormat};

use crate::crawler::CrawlResult;
use crate::ids;
use crate::schema::{BlockStatus, BridgeBlock, CrawlerCandidate, RoutingScenario};
use crate::storage::Storage;

/// Block IDs currently being gardened. The Governor must treat a resumption
/// attempt on a locked block as CLOSED rather than racing the Gardener (§5).
pub type GardenLocks = Arc<Mutex<HashSet<String>>>;

pub fn new_garden_locks() -> GardenLocks {
    Arc::new(Mutex::new(HashSet::new()))
}

#[derive(Debug, Clone)]
pub struct GovernorDecision {
    pub target_block_id: String,
    pub scenario: RoutingScenario,
    pub filtered_memories: Vec<CrawlerCandidate>,
}

#[derive(Debug, Deserialize)]
struct RoutingResponse {
    scenario: u8,
    #[serde(default)]
    block_id: Option<String>,
    #[serde(default)]
    topic_label: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FilterResponse {
    #[serde(default)]
    relevant_ids: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summary: String,
    #[serde(default)]
    open_loops: Vec<String>,
    #[serde(default)]
    decisions: Vec<String>,
}

pub struct Governor {
    llm: Arc<dyn LlmClient>,
    model: String,
    locks: GardenLocks,
}

impl Governor {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>, locks: GardenLocks) -> Self {
        Self { llm, model: model.into(), locks }
    }

    #[instrument(skip(self, storage, crawl_result, query), fields(query_len = query.len()))]
    pub async fn route(&self, storage: &Storage, query: &str, crawl_result: &CrawlResult, keywords: &[String]) -> Result<GovernorDecision> {
        let ledger = storage.ledger_snapshot()?;
        self.enforce_active_singleton(storage, &ledger)?;

        let active = ledger.iter().find(|b| b.status == BlockStatus::Active).cloned();
        let paused: Vec<&BridgeBlock> = ledger.iter().filter(|b| b.status == BlockStatus::Paused).collect();

        let routing = self.classify(query, active.as_ref(), &paused).await;

        let (target_block_id, scenario) = match routing {
            Some(resp) => self.apply_routing(storage, resp, active.as_ref())?,
            None => self.fallback_routing(storage, active.as_ref())?,
        };

        self.update_block_fields(storage, &target_block_id, keywords).await?;

        let filtered_memories = self.filter_candidates(query, crawl_result, storage).await;

        Ok(GovernorDecision { target_block_id, scenario, filtered_memories })
    }

    /// Invariant check at Governor entry (§7): two ACTIVE blocks is a bug
    /// elsewhere in the pipeline; self-heal by force-pausing the older one.
    fn enforce_active_singleton(&self, storage: &Storage, ledger: &[BridgeBlock]) -> Result<()> {
        let mut actives: Vec<&BridgeBlock> = ledger.iter().filter(|b| b.status == BlockStatus::Active).collect();
        if actives.len() <= 1 {
            return Ok(());
        }
        actives.sort_by_key(|b| b.created_at);
        warn!(count = actives.len(), "invariant violation: multiple ACTIVE blocks observed, force-pausing all but the newest");
        for stale in &actives[..actives.len() - 1] {
            let mut block = (*stale).clone();
            block.status = BlockStatus::Paused;
            block.updated_at = Utc::now();
            storage.upsert_block(&block)?;
        }
        Ok(())
    }

    async fn classify(&self, query: &str, active: Option<&BridgeBlock>, paused: &[&BridgeBlock]) -> Option<RoutingResponse> {
        let prompt = build_routing_prompt(query, active, paused);
        let raw = self.llm.query(&prompt, &self.model, ResponseFormat::Json).await.ok()?;
        serde_json::from_str::<RoutingResponse>(&raw).ok()
    }

    fn apply_routing(&self, storage: &Storage, resp: RoutingResponse, active: Option<&BridgeBlock>) -> Result<(String, RoutingScenario)> {
        match resp.scenario {
            1 if active.is_some() => {
                let block = active.unwrap().clone();
                Ok((block.block_id, RoutingScenario::Continuation))
            }
            2 if resp.block_id.is_some() => {
                let target_id = resp.block_id.unwrap();
                if self.is_locked(&target_id) {
                    info!(block_id = %target_id, "resumption target is locked for gardening, treating as CLOSED");
                    return self.create_new_block(storage, active, resp.topic_label, RoutingScenario::NewTopic);
                }
                if let Some(mut target) = storage.get_block(&target_id)? {
                    if let Some(current) = active {
                        self.pause_block(storage, current)?;
                    }
                    target.status = BlockStatus::Active;
                    target.updated_at = Utc::now();
                    storage.upsert_block(&target)?;
                    Ok((target.block_id, RoutingScenario::Resumption))
                } else {
                    self.create_new_block(storage, active, resp.topic_label, RoutingScenario::NewTopic)
                }
            }
            4 if active.is_some() => {
                self.pause_block(storage, active.unwrap())?;
                self.create_new_block(storage, None, resp.topic_label, RoutingScenario::TopicShift)
            }
            _ => self.create_new_block(storage, active, resp.topic_label, RoutingScenario::NewTopic),
        }
    }

    fn fallback_routing(&self, storage: &Storage, active: Option<&BridgeBlock>) -> Result<(String, RoutingScenario)> {
        match active {
            Some(block) => Ok((block.block_id.clone(), RoutingScenario::Continuation)),
            None => self.create_new_block(storage, None, None, RoutingScenario::NewTopic),
        }
    }

    fn create_new_block(
        &self,
        storage: &Storage,
        current_active: Option<&BridgeBlock>,
        topic_label: Option<String>,
        scenario: RoutingScenario,
    ) -> Result<(String, RoutingScenario)> {
        if let Some(current) = current_active {
            if scenario != RoutingScenario::TopicShift {
                self.pause_block(storage, current)?;
            }
        }
        let block = BridgeBlock::new(ids::block_id(), topic_label.unwrap_or_else(|| "general".to_string()));
        storage.upsert_block(&block)?;
        Ok((block.block_id, scenario))
    }

    fn pause_block(&self, storage: &Storage, block: &BridgeBlock) -> Result<()> {
        let mut paused = block.clone();
        paused.status = BlockStatus::Paused;
        paused.updated_at = Utc::now();
        storage.upsert_block(&paused)
    }

    fn is_locked(&self, block_id: &str) -> bool {
        self.locks.lock().expect("garden locks poisoned").contains(block_id)
    }

    /// Unions keywords into the chosen block and regenerates its rolling
    /// summary from the turn list (§4.5). The topic_label is never reverted
    /// to a generic default once set to something specific.
    async fn update_block_fields(&self, storage: &Storage, block_id: &str, keywords: &[String]) -> Result<()> {
        let Some(mut block) = storage.get_block(block_id)? else {
            return Ok(());
        };
        for keyword in keywords {
            if !block.keywords.contains(keyword) {
                block.keywords.push(keyword.clone());
            }
        }

        let turns = storage.turns_for_block(block_id)?;
        if !turns.is_empty() {
            let prompt = build_summary_prompt(&block, &turns);
            if let Ok(raw) = self.llm.query(&prompt, &self.model, ResponseFormat::Json).await {
                if let Ok(parsed) = serde_json::from_str::<SummaryResponse>(&raw) {
                    block.rolling_summary = parsed.summary;
                    block.open_loops = parsed.open_loops;
                    block.decisions = parsed.decisions;
                }
            }
        }

        block.updated_at = Utc::now();
        storage.upsert_block(&block)
    }

    /// Second structured call: prune Crawler candidates to what is truly
    /// relevant, using their source block summaries as context. Falls back
    /// to returning all candidates unfiltered on LLM failure — over-recall
    /// is safer than silently dropping relevant memories (§9).
    async fn filter_candidates(&self, query: &str, crawl_result: &CrawlResult, storage: &Storage) -> Vec<CrawlerCandidate> {
        if crawl_result.memories.is_empty() {
            return Vec::new();
        }

        let prompt = build_filter_prompt(query, &crawl_result.memories, storage);
        match self.llm.query(&prompt, &self.model, ResponseFormat::Json).await {
            Ok(raw) => match serde_json::from_str::<FilterResponse>(&raw) {
                Ok(parsed) => {
                    let keep: HashSet<String> = parsed.relevant_ids.into_iter().collect();
                    crawl_result.memories.iter().filter(|c| keep.contains(&c.source_id)).cloned().collect()
                }
                Err(_) => crawl_result.memories.clone(),
            },
            Err(_) => crawl_result.memories.clone(),
        }
    }
}

fn build_routing_prompt(query: &str, active: Option<&BridgeBlock>, paused: &[&BridgeBlock]) -> String {
    let active_view = active
        .map(|b| format!("ACTIVE {}: topic={} keywords={:?} summary={}", b.block_id, b.topic_label, b.keywords, b.rolling_summary))
        .unwrap_or_else(|| "ACTIVE: none".to_string());
    let paused_view = paused
        .iter()
        .map(|b| format!("PAUSED {}: topic={} keywords={:?} summary={}", b.block_id, b.topic_label, b.keywords, b.rolling_summary))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Given the conversation ledger below, classify the new query into exactly one scenario:
1 = continuation of the ACTIVE block's topic
2 = resumption of a PAUSED block's topic (set block_id to that block)
3 = new topic, no existing block matches
4 = topic shift away from the ACTIVE block into a new topic

Favor semantic continuity over recency: a vague follow-up like "Why?" routes to the
semantically nearest block even if it isn't the most recent. Gradual drift within a
domain stays in the same block; abrupt cross-domain jumps are scenario 4.

Respond as JSON: {{"scenario": 1-4, "block_id": "...", "topic_label": "..."}}.
block_id is only meaningful for scenario 2. topic_label is only meaningful for 3/4 and
should be specific, never a generic placeholder.

{active_view}
{paused_view}

Query: "{query}""#
    )
}

fn build_summary_prompt(block: &BridgeBlock, turns: &[crate::schema::Turn]) -> String {
    let transcript = turns
        .iter()
        .map(|t| format!("User: {}\nAssistant: {}", t.user_text, t.ai_text))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"Regenerate the rolling summary for this conversation block from its full turn list.
Also extract any open loops (unresolved questions) and decisions made.
Respond as JSON: {{"summary": "...", "open_loops": [...], "decisions": [...]}}.

Prior summary: {}

Turns:
{transcript}"#,
        block.rolling_summary
    )
}

fn build_filter_prompt(query: &str, candidates: &[CrawlerCandidate], storage: &Storage) -> String {
    let candidate_view = candidates
        .iter()
        .map(|c| {
            let summary = c
                .source_block_id
                .as_deref()
                .and_then(|id| storage.get_block(id).ok().flatten())
                .map(|b| b.rolling_summary)
                .unwrap_or_default();
            format!("id={} similarity={:.2} text=\"{}\" block_summary=\"{summary}\"", c.source_id, c.similarity, c.text)
        })
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        r#"Query: "{query}"

Candidates retrieved by vector search:
{candidate_view}

Return only the ids of candidates truly relevant to answering the query, as JSON:
{{"relevant_ids": ["..."]}}"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubLlm(std::sync::Mutex<Vec<String>>);

    impl StubLlm {
        fn sequence(responses: Vec<&str>) -> Self {
            Self(std::sync::Mutex::new(responses.into_iter().rev().map(String::from).collect()))
        }
    }

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn query(&self, _prompt: &str, _model: &str, _format: ResponseFormat) -> anyhow::Result<String> {
            Ok(self.0.lock().unwrap().pop().unwrap_or_else(|| "{}".to_string()))
        }
    }

    #[tokio::test]
    async fn new_topic_creates_active_block_when_ledger_empty() {
        let storage = Storage::in_memory().unwrap();
        let llm = StubLlm::sequence(vec![r#"{"scenario":3,"topic_label":"weather"}"#, r#"{"summary":"","open_loops":[],"decisions":[]}"#, "{}"]);
        let governor = Governor::new(Arc::new(llm), "mini", new_garden_locks());

        let crawl = CrawlResult { memories: Vec::new(), dossier_facts: Vec::new() };
        let decision = governor.route(&storage, "what's the weather", &crawl, &[]).await.unwrap();

        assert_eq!(decision.scenario, RoutingScenario::NewTopic);
        let block = storage.get_block(&decision.target_block_id).unwrap().unwrap();
        assert_eq!(block.status, BlockStatus::Active);
    }

    #[tokio::test]
    async fn active_singleton_holds_after_routing() {
        let storage = Storage::in_memory().unwrap();
        let llm = StubLlm::sequence(vec![r#"{"scenario":3,"topic_label":"python debugging"}"#, r#"{"summary":"","open_loops":[],"decisions":[]}"#, "{}"]);
        let governor = Governor::new(Arc::new(llm), "mini", new_garden_locks());

        let pre_existing = BridgeBlock::new("bb_existing".to_string(), "hiking".to_string());
        storage.upsert_block(&pre_existing).unwrap();

        let crawl = CrawlResult { memories: Vec::new(), dossier_facts: Vec::new() };
        governor.route(&storage, "help me debug this python error", &crawl, &[]).await.unwrap();

        let actives = storage.all_active_blocks().unwrap();
        assert_eq!(actives.len(), 1);
    }

    #[tokio::test]
    async fn llm_parse_failure_falls_back_to_continuation() {
        let storage = Storage::in_memory().unwrap();
        let active = BridgeBlock::new("bb_active".to_string(), "weather".to_string());
        storage.upsert_block(&active).unwrap();

        let llm = StubLlm::sequence(vec!["not json"]);
        let governor = Governor::new(Arc::new(llm), "mini", new_garden_locks());
        let crawl = CrawlResult { memories: Vec::new(), dossier_facts: Vec::new() };
        let decision = governor.route(&storage, "why?", &crawl, &[]).await.unwrap();

        assert_eq!(decision.scenario, RoutingScenario::Continuation);
        assert_eq!(decision.target_block_id, "bb_active");
    }

    #[tokio::test]
    async fn locked_resumption_target_is_treated_as_closed() {
        let storage = Storage::in_memory().unwrap();
        let paused = {
            let mut b = BridgeBlock::new("bb_locked".to_string(), "vegetarian diet".to_string());
            b.status = BlockStatus::Paused;
            b
        };
        storage.upsert_block(&paused).unwrap();

        let locks = new_garden_locks();
        locks.lock().unwrap().insert("bb_locked".to_string());

        let llm = StubLlm::sequence(vec![
            r#"{"scenario":2,"block_id":"bb_locked"}"#,
            r#"{"summary":"","open_loops":[],"decisions":[]}"#,
            "{}",
        ]);
        let governor = Governor::new(Arc::new(llm), "mini", locks);
        let crawl = CrawlResult { memories: Vec::new(), dossier_facts: Vec::new() };
        let decision = governor.route(&storage, "back to diet", &crawl, &[]).await.unwrap();

        assert_eq!(decision.scenario, RoutingScenario::NewTopic);
        assert_ne!(decision.target_block_id, "bb_locked");
    }
}
