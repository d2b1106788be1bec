//! Deterministic hierarchical splitter: turn → paragraph → sentence (§4.1).
//!
//! Pure and synchronous except for the embedding step, which is the only
//! failure mode — retried once, then surfaced to the caller.

use std::sync::Arc;

use anyhow::{Context, Result};
use regex::Regex;
use tracing::warn;

use hmlr_llm::EmbeddingClient;

use crate::ids;
use crate::schema::{Chunk, ChunkLevel};

pub struct ChunkEngine {
    embedder: Arc<dyn EmbeddingClient>,
}

/// A chunk paired with its computed embedding, ready for storage.
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub embedding: Vec<f32>,
}

impl ChunkEngine {
    pub fn new(embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { embedder }
    }

    /// Splits one turn's user and assistant text into a rooted tree: one
    /// turn node, paragraph nodes split on blank lines, sentence nodes via
    /// sentence-boundary detection. Returns every node with its embedding.
    pub async fn process_turn(
        &self,
        turn_id: &str,
        user_text: &str,
        ai_text: &str,
    ) -> Result<Vec<EmbeddedChunk>> {
        let mut nodes = Vec::new();

        let turn_chunk = Chunk {
            chunk_id: turn_id.to_string(),
            turn_id: turn_id.to_string(),
            parent_id: None,
            level: ChunkLevel::Turn,
            text: format!("{user_text}\n{ai_text}"),
            token_count: estimate_tokens(user_text) + estimate_tokens(ai_text),
            ordinal: 0,
        };
        nodes.push(turn_chunk);

        for (source_label, text) in [("user", user_text), ("assistant", ai_text)] {
            if text.trim().is_empty() {
                continue;
            }
            self.split_into_paragraphs(turn_id, source_label, text, &mut nodes);
        }

        let mut embedded = Vec::with_capacity(nodes.len());
        for chunk in nodes {
            let embedding = self.embed_with_retry(&chunk.text).await?;
            embedded.push(EmbeddedChunk { chunk, embedding });
        }
        Ok(embedded)
    }

    fn split_into_paragraphs(&self, turn_id: &str, source_label: &str, text: &str, out: &mut Vec<Chunk>) {
        let paragraphs: Vec<&str> = text.split("\n\n").map(str::trim).filter(|p| !p.is_empty()).collect();
        let paragraphs = if paragraphs.is_empty() { vec![text.trim()] } else { paragraphs };

        for (p_idx, paragraph) in paragraphs.iter().enumerate() {
            let parent_id = turn_id.to_string();
            let paragraph_id = ids::chunk_id(&format!("{turn_id}_{source_label}"), "p", p_idx as u32);
            out.push(Chunk {
                chunk_id: paragraph_id.clone(),
                turn_id: turn_id.to_string(),
                parent_id: Some(parent_id),
                level: ChunkLevel::Paragraph,
                text: (*paragraph).to_string(),
                token_count: estimate_tokens(paragraph),
                ordinal: p_idx as u32,
            });

            for (s_idx, sentence) in split_sentences(paragraph).into_iter().enumerate() {
                if sentence.trim().is_empty() {
                    continue;
                }
                out.push(Chunk {
                    chunk_id: ids::chunk_id(&paragraph_id, "s", s_idx as u32),
                    turn_id: turn_id.to_string(),
                    parent_id: Some(paragraph_id.clone()),
                    level: ChunkLevel::Sentence,
                    text: sentence.trim().to_string(),
                    token_count: estimate_tokens(&sentence),
                    ordinal: s_idx as u32,
                });
            }
        }
    }

    async fn embed_with_retry(&self, text: &str) -> Result<Vec<f32>> {
        match self.embedder.encode(text).await {
            Ok(embedding) => Ok(embedding),
            Err(first_error) => {
                warn!(error = %first_error, "embedding failed, retrying once");
                self.embedder
                    .encode(text)
                    .await
                    .context("embedding failed after one retry")
            }
        }
    }
}

fn sentence_boundary_regex() -> &'static Regex {
    static RE: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?<=[.!?])\s+(?=[A-Z0-9])").expect("valid sentence boundary regex"))
}

fn split_sentences(paragraph: &str) -> Vec<String> {
    sentence_boundary_regex()
        .split(paragraph)
        .map(str::to_string)
        .filter(|s| !s.trim().is_empty())
        .collect()
}

fn estimate_tokens(text: &str) -> usize {
    text.split_whitespace().count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use hmlr_llm::HashEmbeddingClient;

    #[tokio::test]
    async fn produces_turn_paragraph_and_sentence_nodes() {
        let engine = ChunkEngine::new(Arc::new(HashEmbeddingClient::new(32)));
        let result = engine
            .process_turn("turn_20260101T000000Z", "Hi there. How are you?", "I am well. Thanks for asking.")
            .await
            .unwrap();

        assert!(result.iter().any(|n| n.chunk.level == ChunkLevel::Turn));
        assert!(result.iter().any(|n| n.chunk.level == ChunkLevel::Paragraph));
        assert!(result.iter().any(|n| n.chunk.level == ChunkLevel::Sentence));
    }

    #[tokio::test]
    async fn sentence_ids_are_deterministic() {
        let engine = ChunkEngine::new(Arc::new(HashEmbeddingClient::new(32)));
        let first = engine.process_turn("turn_x", "One. Two.", "").await.unwrap();
        let second = engine.process_turn("turn_x", "One. Two.", "").await.unwrap();
        let ids_a: Vec<_> = first.iter().map(|n| n.chunk.chunk_id.clone()).collect();
        let ids_b: Vec<_> = second.iter().map(|n| n.chunk.chunk_id.clone()).collect();
        assert_eq!(ids_a, ids_b);
    }

    #[tokio::test]
    async fn every_node_has_an_embedding() {
        let engine = ChunkEngine::new(Arc::new(HashEmbeddingClient::new(32)));
        let result = engine.process_turn("turn_x", "Hello world.", "Goodbye world.").await.unwrap();
        for node in result {
            assert!(!node.embedding.is_empty());
        }
    }
}
