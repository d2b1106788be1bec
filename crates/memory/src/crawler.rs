//! Vector search over `gardened_memory` and `dossier_fact_embeddings`
//! (§4.4). Does not search `daily_ledger` — short-term blocks live in the
//! Hydrator's direct load path.

use std::sync::Arc;

use anyhow::Result;

use hmlr_llm::EmbeddingClient;

use crate::schema::{CrawlerCandidate, DossierCandidate};
use crate::storage::Storage;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.4;

pub struct Crawler {
    embedder: Arc<dyn EmbeddingClient>,
}

#[derive(Debug, Clone)]
pub struct CrawlResult {
    pub memories: Vec<CrawlerCandidate>,
    pub dossier_facts: Vec<DossierCandidate>,
}

impl Crawler {
    pub fn new(embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { embedder }
    }

    /// Embeds `query` once and searches both stores in parallel cosine
    /// scans. Embedding failure downstream means the caller proceeds with
    /// empty retrieval (§4.5 failure semantics) rather than erroring.
    pub async fn crawl(&self, storage: &Storage, query: &str, threshold: f32, top_k: usize) -> Result<CrawlResult> {
        let embedding = match self.embedder.encode(query).await {
            Ok(embedding) => embedding,
            Err(_) => {
                return Ok(CrawlResult { memories: Vec::new(), dossier_facts: Vec::new() });
            }
        };

        let memories = storage.search_gardened_memory(&embedding, threshold, top_k)?;
        let dossier_facts = storage.search_dossier_fact_embeddings(&embedding, threshold, top_k)?;

        Ok(CrawlResult { memories, dossier_facts })
    }

    pub async fn embed_query(&self, query: &str) -> Option<Vec<f32>> {
        self.embedder.encode(query).await.ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hmlr_llm::HashEmbeddingClient;

    use crate::schema::{ChunkLevel, GardenedChunk};

    #[tokio::test]
    async fn returns_candidates_above_threshold() {
        let storage = Storage::in_memory().unwrap();
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbeddingClient::new(32));

        let chunk = GardenedChunk {
            chunk_id: "c1".into(),
            level: ChunkLevel::Sentence,
            parent_id: None,
            text: "the weather API key is ABC123XYZ".into(),
            token_count: 6,
            source_block_id: "bb_1".into(),
            turn_ordinal: 0,
            created_at: Utc::now(),
        };
        let embedding = embedder.encode(&chunk.text).await.unwrap();
        storage.insert_gardened_chunk(&chunk, &embedding).unwrap();

        let crawler = Crawler::new(embedder);
        let result = crawler.crawl(&storage, "what is the weather API key", DEFAULT_SIMILARITY_THRESHOLD, 5).await.unwrap();
        assert!(!result.memories.is_empty());
    }

    #[tokio::test]
    async fn empty_store_returns_empty_lists() {
        let storage = Storage::in_memory().unwrap();
        let crawler = Crawler::new(Arc::new(HashEmbeddingClient::new(32)));
        let result = crawler.crawl(&storage, "anything", DEFAULT_SIMILARITY_THRESHOLD, 5).await.unwrap();
        assert!(result.memories.is_empty());
        assert!(result.dossier_facts.is_empty());
    }
}
