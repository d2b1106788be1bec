//! Error taxonomy (§7): transient LLM/network errors are retried by the
//! caller and fall back per-component; storage errors are fatal to the
//! in-flight query; invariant violations are logged and self-healed where
//! possible. This enum exists for callers that need to branch on the
//! category — everywhere else in the pipeline returns `anyhow::Result` and
//! lets `?` do the work.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HmlrError>;

#[derive(Error, Debug)]
pub enum HmlrError {
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("transient error (retry exhausted): {0}")]
    Transient(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("configuration error: {0}")]
    Config(String),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),

    #[error("block not found: {block_id}")]
    BlockNotFound { block_id: String },

    #[error("dossier not found: {dossier_id}")]
    DossierNotFound { dossier_id: String },

    #[error("block {block_id} is locked for gardening")]
    BlockLocked { block_id: String },

    #[error("migration error: {0}")]
    Migration(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for HmlrError {
    fn from(err: rusqlite::Error) -> Self {
        HmlrError::Storage(StorageError::Database(err.to_string()))
    }
}

impl From<serde_json::Error> for HmlrError {
    fn from(err: serde_json::Error) -> Self {
        HmlrError::Storage(StorageError::Serialization(err.to_string()))
    }
}
