//! LLM-driven extractor of durable key/value facts from sentence-level
//! chunks (§4.2). Runs concurrently with the Governor; never updates a
//! prior row, only appends.

use std::sync::Arc;

use chrono::Utc;
use serde::Deserialize;
use tracing::warn;

use hmlr_llm::{LlmClient, ResponseFormat};

use crate::ids;
use crate::schema::{Chunk, ChunkLevel, Fact};
use crate::storage::Storage;

const EXTRACTION_PROMPT_TEMPLATE: &str = r#"Extract zero or more durable facts (credentials, identifiers, definitions) from the
following sentence as a JSON object: {"facts": [{"key": "...", "value": "..."}]}.
Only extract facts that would still be true days from now. If none, return {"facts": []}.

Sentence: "{sentence}""#;

#[derive(Debug, Deserialize)]
struct ExtractionResponse {
    #[serde(default)]
    facts: Vec<ExtractedFact>,
}

#[derive(Debug, Deserialize)]
struct ExtractedFact {
    key: String,
    value: String,
}

pub struct FactScrubber {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl FactScrubber {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self { llm, model: model.into() }
    }

    /// Extracts facts from every sentence-level chunk and inserts them into
    /// `fact_store` with `source_block_id = NULL`. Transient failures are
    /// treated as "zero facts for this chunk" (§7) rather than aborting the
    /// whole pass.
    pub async fn scrub(&self, storage: &Storage, chunks: &[Chunk]) -> anyhow::Result<usize> {
        let mut inserted = 0;
        for chunk in chunks.iter().filter(|c| c.level == ChunkLevel::Sentence) {
            let facts = self.extract_one(&chunk.text).await;
            for extracted in facts {
                let fact = Fact {
                    fact_id: ids::fact_id(),
                    key: extracted.key,
                    value: extracted.value,
                    created_at: Utc::now(),
                    source_block_id: None,
                    source_chunk_id: Some(chunk.chunk_id.clone()),
                };
                storage.insert_fact(&fact)?;
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn extract_one(&self, sentence: &str) -> Vec<ExtractedFact> {
        let prompt = EXTRACTION_PROMPT_TEMPLATE.replace("{sentence}", sentence);
        match self.llm.query(&prompt, &self.model, ResponseFormat::Json).await {
            Ok(raw) => match serde_json::from_str::<ExtractionResponse>(&raw) {
                Ok(parsed) => parsed.facts,
                Err(error) => {
                    warn!(error = %error, "fact scrubber: failed to parse LLM JSON, emitting zero facts");
                    Vec::new()
                }
            },
            Err(error) => {
                warn!(error = %error, "fact scrubber: LLM call failed, emitting zero facts");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct StubLlm(String);

    #[async_trait]
    impl LlmClient for StubLlm {
        async fn query(&self, _prompt: &str, _model: &str, _format: ResponseFormat) -> anyhow::Result<String> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn inserts_extracted_facts_with_null_block_id() {
        let storage = Storage::in_memory().unwrap();
        let llm = StubLlm(r#"{"facts":[{"key":"api_key","value":"ABC123XYZ"}]}"#.to_string());
        let scrubber = FactScrubber::new(Arc::new(llm), "mini");
        let chunk = Chunk {
            chunk_id: "turn_1_p00_s00".into(),
            turn_id: "turn_1".into(),
            parent_id: Some("turn_1_p00".into()),
            level: ChunkLevel::Sentence,
            text: "My weather API key is ABC123XYZ.".into(),
            token_count: 6,
            ordinal: 0,
        };

        let inserted = scrubber.scrub(&storage, std::slice::from_ref(&chunk)).await.unwrap();
        assert_eq!(inserted, 1);

        let facts = storage.facts_by_key("api_key").unwrap();
        assert_eq!(facts.len(), 1);
        assert!(facts[0].source_block_id.is_none());
        assert_eq!(facts[0].source_chunk_id.as_deref(), Some("turn_1_p00_s00"));
    }

    #[tokio::test]
    async fn malformed_json_yields_zero_facts_not_an_error() {
        let storage = Storage::in_memory().unwrap();
        let llm = StubLlm("not json".to_string());
        let scrubber = FactScrubber::new(Arc::new(llm), "mini");
        let chunk = Chunk {
            chunk_id: "turn_1_p00_s00".into(),
            turn_id: "turn_1".into(),
            parent_id: None,
            level: ChunkLevel::Sentence,
            text: "Some unrelated sentence.".into(),
            token_count: 3,
            ordinal: 0,
        };
        let inserted = scrubber.scrub(&storage, std::slice::from_ref(&chunk)).await.unwrap();
        assert_eq!(inserted, 0);
    }
}
