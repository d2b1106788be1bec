//! Fire-and-forget extractor of user-profile constraints, preferences and
//! identities (§4.3). Never awaited by the conversation engine; if the
//! process exits before it completes, the update is simply lost (§5).

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use hmlr_llm::{LlmClient, ResponseFormat};

use crate::profile::ProfileStore;
use crate::schema::{ConstraintSeverity, ProfileConstraint, ProfileIdentity, ProfilePreference};

const CLASSIFICATION_PROMPT_TEMPLATE: &str = r#"Classify any profile-relevant statements in the user's message into
{"constraints": [{"key","type","description","severity"}], "preferences": [{"key","description"}],
"identities": [{"key","description"}]}. severity is "hard" or "soft". Omit categories with nothing to report.

Message: "{message}""#;

#[derive(Debug, Default, Deserialize)]
struct ScribeResponse {
    #[serde(default)]
    constraints: Vec<ScribeConstraint>,
    #[serde(default)]
    preferences: Vec<ProfilePreference>,
    #[serde(default)]
    identities: Vec<ProfileIdentity>,
}

#[derive(Debug, Deserialize)]
struct ScribeConstraint {
    key: String,
    r#type: String,
    description: String,
    severity: String,
}

pub struct Scribe {
    llm: Arc<dyn LlmClient>,
    model: String,
}

impl Scribe {
    pub fn new(llm: Arc<dyn LlmClient>, model: impl Into<String>) -> Self {
        Self { llm, model: model.into() }
    }

    /// Classifies `user_text` and writes any profile updates. Failures are
    /// logged but never propagated — callers should spawn this, not await
    /// its result on the hot path.
    pub async fn observe(&self, profile_store: &ProfileStore, user_text: &str) {
        let prompt = CLASSIFICATION_PROMPT_TEMPLATE.replace("{message}", user_text);
        let raw = match self.llm.query(&prompt, &self.model, ResponseFormat::Json).await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(error = %error, "scribe: LLM call failed, dropping update");
                return;
            }
        };

        let parsed: ScribeResponse = match serde_json::from_str(&raw) {
            Ok(parsed) => parsed,
            Err(error) => {
                warn!(error = %error, raw = %raw, "scribe: failed to parse LLM JSON, dropping update");
                return;
            }
        };

        if parsed.constraints.is_empty() && parsed.preferences.is_empty() && parsed.identities.is_empty() {
            return;
        }

        let result = profile_store.update(|profile| {
            for constraint in parsed.constraints {
                let severity = if constraint.severity.eq_ignore_ascii_case("hard") {
                    ConstraintSeverity::Hard
                } else {
                    ConstraintSeverity::Soft
                };
                upsert_constraint(
                    &mut profile.glossary.constraints,
                    ProfileConstraint {
                        key: constraint.key,
                        r#type: constraint.r#type,
                        description: constraint.description,
                        severity,
                    },
                );
            }
            for preference in parsed.preferences {
                upsert_preference(&mut profile.glossary.preferences, preference);
            }
            for identity in parsed.identities {
                upsert_identity(&mut profile.glossary.identities, identity);
            }
        });

        if let Err(error) = result {
            warn!(error = %error, "scribe: failed to persist profile update");
        }
    }
}

fn upsert_constraint(items: &mut Vec<ProfileConstraint>, new: ProfileConstraint) {
    if let Some(existing) = items.iter_mut().find(|c| c.key == new.key) {
        *existing = new;
    } else {
        items.push(new);
    }
}

fn upsert_preference(items: &mut Vec<ProfilePreference>, new: ProfilePreference) {
    if let Some(existing) = items.iter_mut().find(|p| p.key == new.key) {
        *existing = new;
    } else {
        items.push(new);
    }
}

fn upsert_identity(items: &mut Vec<ProfileIdentity>, new: ProfileIdentity) {
    if let Some(existing) = items.iter_mut().find(|i| i.key == new.key) {
        *existing = new;
    } else {
        items.push(new);
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
    async fn writes_constraint_to_profile() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("profile.json"));
        let llm = StubLlm(
            r#"{"constraints":[{"key":"diet_vegetarian","type":"diet","description":"Vegetarian, no meat","severity":"hard"}]}"#
                .to_string(),
        );
        let scribe = Scribe::new(Arc::new(llm), "mini");

        scribe.observe(&store, "I'm vegetarian, no meat please.").await;

        let profile = store.load().unwrap();
        assert_eq!(profile.glossary.constraints.len(), 1);
        assert_eq!(profile.glossary.constraints[0].key, "diet_vegetarian");
    }

    #[tokio::test]
    async fn malformed_llm_output_never_panics() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::new(dir.path().join("profile.json"));
        let scribe = Scribe::new(Arc::new(StubLlm("not json".to_string())), "mini");
        scribe.observe(&store, "hello").await;
        let profile = store.load().unwrap();
        assert!(profile.glossary.constraints.is_empty());
    }
}
