//! Top-level entry point (§6 Public API, §5 Concurrency Model). Wires every
//! component into the per-query pipeline: Chunk Engine, the Scribe/Fact
//! Scrubber/Crawler/Governor fan-out, fact linking, Hydration, and turn
//! append. The downstream generator that turns a hydrated prompt into a
//! reply is out of scope (§1) and is supplied by the caller as a closure.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tracing::{info, instrument};

use hmlr_config::AppConfig;
use hmlr_llm::{EmbeddingClient, LlmClient};

use crate::chunk_engine::ChunkEngine;
use crate::crawler::Crawler;
use crate::dossier_retriever::DossierRetriever;
use crate::fact_scrubber::FactScrubber;
use crate::gardener::Gardener;
use crate::governor::{GardenLocks, Governor, new_garden_locks};
use crate::hydrator::Hydrator;
use crate::ids;
use crate::profile::ProfileStore;
use crate::schema::Turn;
use crate::scribe::Scribe;
use crate::storage::Storage;

/// The downstream generator (§1 Non-goal): given a hydrated prompt, produce
/// the assistant's reply text. Supplied by the caller, never implemented here.
pub type Generator = Arc<dyn Fn(String) -> Pin<Box<dyn Future<Output = Result<String>> + Send>> + Send + Sync>;

pub struct ConversationEngine {
    storage: Storage,
    profile_store: ProfileStore,
    chunk_engine: ChunkEngine,
    fact_scrubber: FactScrubber,
    scribe: Arc<Scribe>,
    crawler: Crawler,
    governor: Governor,
    dossier_retriever: DossierRetriever,
    gardener: Gardener,
    locks: GardenLocks,
    generator: Generator,
    config: AppConfig,
}

impl ConversationEngine {
    pub fn new(config: AppConfig, llm: Arc<dyn LlmClient>, embedder: Arc<dyn EmbeddingClient>, generator: Generator) -> Result<Self> {
        let storage = Storage::open(&config.storage.db_path)?;
        let profile_store = ProfileStore::new(&config.storage.user_profile_path);
        let locks = new_garden_locks();

        let model = config.llm.model.clone();
        Ok(Self {
            storage,
            profile_store,
            chunk_engine: ChunkEngine::new(embedder.clone()),
            fact_scrubber: FactScrubber::new(llm.clone(), model.clone()),
            scribe: Arc::new(Scribe::new(llm.clone(), model.clone())),
            crawler: Crawler::new(embedder.clone()),
            governor: Governor::new(llm.clone(), model.clone(), locks.clone()),
            dossier_retriever: DossierRetriever::new(embedder.clone()),
            gardener: Gardener::new(llm, embedder, model, locks.clone()),
            locks,
            generator,
            config,
        })
    }

    /// Runs the full per-query pipeline (§5) and returns the generator's
    /// reply. Order of operations:
    /// 1. Crawler and Fact Scrubber run concurrently (Scribe fire-and-forget).
    /// 2. Governor awaits the Crawler result, routes, and filters memories.
    /// 3. Facts extracted from this turn's chunks are linked to the chosen
    ///    block synchronously, before Hydration (§4.2).
    /// 4. Hydrator assembles the prompt; the generator produces the reply.
    /// 5. The turn is appended, immutably, to the chosen block.
    #[instrument(skip(self, user_text), fields(len = user_text.len()))]
    pub async fn process_user_message(&self, user_text: &str) -> Result<String> {
        let turn_id = ids::turn_id();

        let profile = self.profile_store.load()?;
        tokio::spawn({
            let message = user_text.to_string();
            let profile_path = self.profile_store.path().to_path_buf();
            let scribe = self.scribe.clone();
            async move {
                let store = ProfileStore::new(profile_path);
                scribe.observe(&store, &message).await;
            }
        });

        let embedded_chunks = self.chunk_engine.process_turn(&turn_id, user_text, "").await?;
        let chunks: Vec<_> = embedded_chunks.iter().map(|e| e.chunk.clone()).collect();
        for embedded in &embedded_chunks {
            self.storage.insert_chunk(&embedded.chunk)?;
            self.storage.insert_embedding(&embedded.chunk.chunk_id, &embedded.embedding)?;
        }

        let crawl = self.crawler.crawl(
            &self.storage,
            user_text,
            self.config.retrieval.similarity_threshold,
            self.config.retrieval.top_k_memory,
        );
        let scrub = self.fact_scrubber.scrub(&self.storage, &chunks);
        let (crawl_result, _scrub_count) = tokio::join!(crawl, scrub);
        let crawl_result = crawl_result?;
        let _scrub_count = _scrub_count?;

        let keywords = extract_keywords(user_text);
        let decision = self.governor.route(&self.storage, user_text, &crawl_result, &keywords).await?;

        self.storage.link_facts_to_block(&turn_id, &decision.target_block_id)?;

        let dossier_section = self
            .dossier_retriever
            .retrieve(&self.storage, user_text, self.config.retrieval.similarity_threshold, self.config.retrieval.top_k_dossiers)
            .await?;

        let hydrator = Hydrator::new(&self.storage);
        let prompt = hydrator.assemble(&profile, &decision.target_block_id, &decision.filtered_memories, dossier_section.as_deref(), user_text)?;

        let reply = (self.generator)(prompt).await?;

        self.storage.insert_turn(&Turn {
            turn_id: turn_id.clone(),
            block_id: decision.target_block_id.clone(),
            ordinal: self.storage.turns_for_block(&decision.target_block_id)?.len() as u32,
            user_text: user_text.to_string(),
            ai_text: reply.clone(),
            created_at: Utc::now(),
        })?;

        info!(block_id = %decision.target_block_id, scenario = ?decision.scenario, "turn appended");
        Ok(reply)
    }

    /// Gardens a specific block on demand (§4.7); normally invoked by an
    /// external scheduler once a block has aged out, never by the hot path.
    pub async fn garden(&self, block_id: &str) -> Result<()> {
        self.gardener.garden(&self.storage, block_id).await
    }

    /// Clears the in-process gardening locks. Intended for session reset in
    /// tests and embedding hosts; does not touch persisted state.
    pub fn reset_session(&self) {
        self.locks.lock().expect("garden locks poisoned").clear();
    }
}

fn extract_keywords(text: &str) -> Vec<String> {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| w.len() > 3)
        .take(8)
        .collect()
}
