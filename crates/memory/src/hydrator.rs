//! Context Assembler (§4.6). Builds the final prompt in a fixed order:
//! user profile → known facts → retrieved dossiers → retrieved memories
//! grouped by source block → current block's turn history → current query.

use std::collections::BTreeMap;

use anyhow::Result;

use crate::profile::render_profile_block;
use crate::schema::{CrawlerCandidate, GlobalTag, SectionRule};
use crate::storage::Storage;

pub struct Hydrator<'a> {
    storage: &'a Storage,
}

impl<'a> Hydrator<'a> {
    pub fn new(storage: &'a Storage) -> Self {
        Self { storage }
    }

    pub fn assemble(
        &self,
        profile: &crate::schema::UserProfile,
        active_block_id: &str,
        filtered_memories: &[CrawlerCandidate],
        dossier_section: Option<&str>,
        query: &str,
    ) -> Result<String> {
        let mut sections = Vec::new();

        if let Some(profile_block) = render_profile_block(profile) {
            sections.push(format!("=== USER PROFILE ===\n{profile_block}"));
        }

        let facts = self.storage.get_facts_for_block(active_block_id)?;
        if !facts.is_empty() {
            let rendered = facts.iter().map(|f| format!("  - {}: {}", f.key, f.value)).collect::<Vec<_>>().join("\n");
            sections.push(format!("=== KNOWN FACTS ===\n{rendered}"));
        }

        if let Some(dossiers) = dossier_section {
            if !dossiers.trim().is_empty() {
                sections.push(dossiers.to_string());
            }
        }

        if !filtered_memories.is_empty() {
            sections.push(self.render_grouped_memories(filtered_memories)?);
        }

        let turns = self.storage.turns_for_block(active_block_id)?;
        if !turns.is_empty() {
            let rendered = turns.iter().map(|t| format!("User: {}\nAssistant: {}", t.user_text, t.ai_text)).collect::<Vec<_>>().join("\n");
            sections.push(format!("=== CONVERSATION ===\n{rendered}"));
        }

        sections.push(format!("=== CURRENT QUERY ===\n{query}"));

        Ok(sections.join("\n\n"))
    }

    /// Groups chunks sharing a `source_block_id` under one header with the
    /// block's tag list rendered exactly once (§4.6, §8 group-by-block
    /// idempotence). Section rules are applied per-chunk by turn ordinal.
    fn render_grouped_memories(&self, candidates: &[CrawlerCandidate]) -> Result<String> {
        let mut by_block: BTreeMap<String, Vec<&CrawlerCandidate>> = BTreeMap::new();
        for candidate in candidates {
            let key = candidate.source_block_id.clone().unwrap_or_else(|| "unscoped".to_string());
            by_block.entry(key).or_default().push(candidate);
        }

        let mut blocks_rendered = Vec::new();
        for (block_id, chunks) in by_block {
            let metadata = self.storage.block_metadata(&block_id)?;
            let tags: Vec<GlobalTag> = metadata.as_ref().map(|m| m.global_tags.clone()).unwrap_or_default();
            let rules: Vec<SectionRule> = metadata.as_ref().map(|m| m.section_rules.clone()).unwrap_or_default();
            let tag_list = tags.iter().map(|t| format!("[{:?}] {}", t.r#type, t.value)).collect::<Vec<_>>().join(", ");

            let mut lines = vec![format!("### Context Block: {block_id}"), format!("Active Rules: {tag_list}")];
            for chunk in chunks {
                let applicable = rules.iter().filter(|r| chunk.turn_ordinal >= r.start_turn && chunk.turn_ordinal <= r.end_turn);
                let prefix = applicable.map(|r| format!("[{}] ", r.rule)).collect::<String>();
                lines.push(format!("{prefix}{}", chunk.text));
            }
            blocks_rendered.push(lines.join("\n"));
        }

        Ok(format!("=== RETRIEVED MEMORIES ===\n{}", blocks_rendered.join("\n\n")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    use crate::schema::{BlockMetadata, BlockStatus, BridgeBlock, ConstraintSeverity, GlobalTagType, ProfileConstraint, Turn, UserProfile};

    #[test]
    fn assembles_sections_in_fixed_order() {
        let storage = Storage::in_memory().unwrap();
        let mut block = BridgeBlock::new("bb_1".to_string(), "diet".to_string());
        block.status = BlockStatus::Active;
        storage.upsert_block(&block).unwrap();
        storage
            .insert_turn(&Turn {
                turn_id: "turn_1".into(),
                block_id: "bb_1".into(),
                ordinal: 0,
                user_text: "hi".into(),
                ai_text: "hello".into(),
                created_at: Utc::now(),
            })
            .unwrap();

        let mut profile = UserProfile::default();
        profile.glossary.constraints.push(ProfileConstraint {
            key: "diet_vegetarian".into(),
            r#type: "diet".into(),
            description: "Vegetarian".into(),
            severity: ConstraintSeverity::Hard,
        });

        let hydrator = Hydrator::new(&storage);
        let prompt = hydrator.assemble(&profile, "bb_1", &[], None, "what should I eat?").unwrap();

        let profile_pos = prompt.find("USER PROFILE").unwrap();
        let conversation_pos = prompt.find("CONVERSATION").unwrap();
        let query_pos = prompt.find("CURRENT QUERY").unwrap();
        assert!(profile_pos < conversation_pos);
        assert!(conversation_pos < query_pos);
    }

    #[test]
    fn group_by_block_emits_tags_exactly_once() {
        let storage = Storage::in_memory().unwrap();
        storage
            .upsert_block_metadata(&BlockMetadata {
                block_id: "bb_1".into(),
                global_tags: vec![crate::schema::GlobalTag { r#type: GlobalTagType::Deprecation, value: "Titan deprecated".into() }],
                section_rules: vec![],
            })
            .unwrap();

        let candidates = vec![
            CrawlerCandidate {
                source_id: "c1".into(),
                text: "Titan is deprecated".into(),
                source_block_id: Some("bb_1".into()),
                global_tags: vec![],
                similarity: 0.9,
                source_date: Utc::now(),
                turn_ordinal: 0,
            },
            CrawlerCandidate {
                source_id: "c2".into(),
                text: "use Olympus instead".into(),
                source_block_id: Some("bb_1".into()),
                global_tags: vec![],
                similarity: 0.8,
                source_date: Utc::now(),
                turn_ordinal: 0,
            },
        ];

        let hydrator = Hydrator::new(&storage);
        let rendered = hydrator.render_grouped_memories(&candidates).unwrap();
        assert_eq!(rendered.matches("Active Rules:").count(), 1);
        assert!(rendered.contains("Titan deprecated"));
    }

    #[test]
    fn section_rule_prefixes_only_chunks_in_its_turn_range() {
        let storage = Storage::in_memory().unwrap();
        storage
            .upsert_block_metadata(&BlockMetadata {
                block_id: "bb_1".into(),
                global_tags: vec![],
                section_rules: vec![crate::schema::SectionRule { start_turn: 0, end_turn: 1, rule: "Titan means Olympus here".into() }],
            })
            .unwrap();

        let candidates = vec![
            CrawlerCandidate {
                source_id: "c1".into(),
                text: "Titan ships next week".into(),
                source_block_id: Some("bb_1".into()),
                global_tags: vec![],
                similarity: 0.9,
                source_date: Utc::now(),
                turn_ordinal: 1,
            },
            CrawlerCandidate {
                source_id: "c2".into(),
                text: "unrelated later remark".into(),
                source_block_id: Some("bb_1".into()),
                global_tags: vec![],
                similarity: 0.8,
                source_date: Utc::now(),
                turn_ordinal: 5,
            },
        ];

        let hydrator = Hydrator::new(&storage);
        let rendered = hydrator.render_grouped_memories(&candidates).unwrap();
        assert!(rendered.contains("[Titan means Olympus here] Titan ships next week"));
        assert!(rendered.contains("\nunrelated later remark"), "chunk outside the rule's turn range must not be prefixed");
    }
}
