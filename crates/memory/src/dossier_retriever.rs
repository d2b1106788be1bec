//! Read-side companion to the Crawler for dossier search (§4.9). Vector
//! search over `dossier_fact_embeddings`, dedupe by dossier_id, fetch full
//! dossier rows and their facts, format as a `=== FACT DOSSIERS ===` block.

use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::Result;

use hmlr_llm::EmbeddingClient;

use crate::storage::Storage;

pub struct DossierRetriever {
    embedder: Arc<dyn EmbeddingClient>,
}

impl DossierRetriever {
    pub fn new(embedder: Arc<dyn EmbeddingClient>) -> Self {
        Self { embedder }
    }

    pub async fn retrieve(&self, storage: &Storage, query: &str, threshold: f32, top_k: usize) -> Result<Option<String>> {
        let Ok(embedding) = self.embedder.encode(query).await else {
            return Ok(None);
        };

        let hits = storage.search_dossier_fact_embeddings(&embedding, threshold, top_k)?;
        if hits.is_empty() {
            return Ok(None);
        }

        let mut seen = BTreeSet::new();
        let mut rendered = Vec::new();
        for hit in &hits {
            if !seen.insert(hit.dossier_id.clone()) {
                continue;
            }
            let Some(dossier) = storage.get_dossier(&hit.dossier_id)? else { continue };
            let facts = storage.facts_for_dossier(&hit.dossier_id)?;
            let fact_lines = facts.iter().map(|f| format!("  - {}", f.text)).collect::<Vec<_>>().join("\n");
            rendered.push(format!("{} — {}\n{}\n{fact_lines}", dossier.title, dossier.summary, hit.text));
        }

        if rendered.is_empty() {
            return Ok(None);
        }

        Ok(Some(format!("=== FACT DOSSIERS ===\n{}", rendered.join("\n\n"))))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hmlr_llm::HashEmbeddingClient;

    use crate::schema::{Dossier, DossierFact, DossierStatus};

    #[tokio::test]
    async fn dedupes_by_dossier_id() {
        let storage = Storage::in_memory().unwrap();
        let embedder: Arc<dyn EmbeddingClient> = Arc::new(HashEmbeddingClient::new(32));
        let now = Utc::now();
        storage
            .insert_dossier(&Dossier {
                dossier_id: "dos_1".into(),
                title: "Vegetarian Diet".into(),
                summary: "User is vegetarian.".into(),
                status: DossierStatus::Open,
                permissions: "owner".into(),
                created_at: now,
                last_updated: now,
            })
            .unwrap();

        for text in ["avoids meat", "avoids eggs"] {
            let fact = DossierFact {
                fact_id: format!("fact_{text}"),
                dossier_id: "dos_1".into(),
                text: text.into(),
                r#type: "narrative".into(),
                added_at: now,
                source_block_id: None,
                source_turn_id: None,
                confidence: 0.8,
            };
            let embedding = embedder.encode(text).await.unwrap();
            storage.insert_dossier_fact(&fact, &embedding).unwrap();
        }

        let retriever = DossierRetriever::new(embedder);
        let result = retriever.retrieve(&storage, "avoids meat", 0.0, 10).await.unwrap().unwrap();
        assert_eq!(result.matches("Vegetarian Diet").count(), 1);
    }
}
