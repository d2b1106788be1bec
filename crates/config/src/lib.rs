use std::env;
use std::fs;
use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub user_profile_path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: ".hmlr/hmlr.db".to_string(),
            user_profile_path: ".hmlr/user_profile.json".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: String,
    /// Populated at runtime from `HMLR_API_KEY` if unset here — never
    /// serialized back out so a committed config can't leak a key.
    #[serde(skip_serializing)]
    pub api_key: String,
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "mini".to_string(),
            base_url: "http://localhost:11434".to_string(),
            api_key: String::new(),
            request_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub model: String,
    pub dimensions: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            model: "sentence-encoder-384".to_string(),
            dimensions: 384,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    pub similarity_threshold: f32,
    pub top_k_memory: usize,
    pub top_k_dossiers: usize,
    pub top_k_voting: usize,
    pub dossier_token_budget: usize,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.4,
            top_k_memory: 5,
            top_k_dossiers: 3,
            top_k_voting: 10,
            dossier_token_budget: 3000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub log_level: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub storage: StorageConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub retrieval: RetrievalConfig,
    pub telemetry: TelemetryConfig,
}

impl AppConfig {
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = fs::read_to_string(path) {
            config = toml::from_str(&raw)?;
        }

        if let Ok(key) = env::var("HMLR_API_KEY") {
            if !key.is_empty() {
                config.llm.api_key = key;
            }
        }

        Ok(config)
    }

    pub fn save_to(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        let rendered = toml::to_string_pretty(self)?;
        fs::write(path, rendered)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert_eq!(config.retrieval.similarity_threshold, 0.4);
        assert_eq!(config.retrieval.top_k_memory, 5);
        assert_eq!(config.retrieval.top_k_dossiers, 3);
        assert_eq!(config.retrieval.top_k_voting, 10);
        assert_eq!(config.retrieval.dossier_token_budget, 3000);
    }

    #[test]
    fn round_trips_through_toml() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("hmlr.toml");

        let mut config = AppConfig::default();
        config.retrieval.similarity_threshold = 0.55;
        config.save_to(&path)?;

        let loaded = AppConfig::load_from(&path)?;
        assert_eq!(loaded.retrieval.similarity_threshold, 0.55);
        Ok(())
    }

    #[test]
    fn missing_file_falls_back_to_defaults() -> Result<()> {
        let config = AppConfig::load_from("/nonexistent/path/hmlr.toml")?;
        assert_eq!(config.llm.model, "mini");
        Ok(())
    }
}
