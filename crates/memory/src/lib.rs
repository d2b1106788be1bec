//! Hierarchical Memory Lookup & Routing: the conversational memory layer
//! behind a chat agent. A per-query pipeline (Chunk Engine → Scribe / Fact
//! Scrubber / Crawler / Governor → Hydrator) keeps an agent's working
//! context small and relevant; an offline Gardener pipeline promotes aged
//! conversations into durable gardened memory and long-lived dossiers.

pub mod chunk_engine;
pub mod conversation_engine;
pub mod crawler;
pub mod dossier_governor;
pub mod dossier_retriever;
pub mod error;
pub mod fact_scrubber;
pub mod gardener;
pub mod governor;
pub mod hydrator;
pub mod ids;
pub mod profile;
pub mod schema;
pub mod scribe;
pub mod storage;

pub use conversation_engine::{ConversationEngine, Generator};
pub use error::{HmlrError, Result as HmlrResult, StorageError};
pub use governor::{GardenLocks, GovernorDecision, new_garden_locks};
pub use schema::{BridgeBlock, Dossier, Fact, RoutingScenario, Turn, UserProfile};
pub use storage::Storage;
