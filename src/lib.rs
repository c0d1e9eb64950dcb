//! # graphrag
//!
//! A graph-augmented retrieval engine. Documents are chunked and embedded,
//! an entity/relationship graph is extracted with an LLM, the graph is
//! clustered into a hierarchy of communities with per-community summaries,
//! and queries are answered through three search modes (LOCAL, GLOBAL,
//! DRIFT) behind a mode router.
//!
//! ## Features
//!
//! - Idempotent ingestion: unchanged inputs are skipped by content hash
//! - Bounded LLM gateway with continuation stitching and strict JSON markers
//! - Deterministic hierarchical community detection over the entity graph
//! - Three persisted vector indexes (chunks, entities, community summaries)
//! - Map-reduce GLOBAL search with weighted community reports
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use graphrag::config::AppConfig;
//! use graphrag::embedding::FastembedEmbedder;
//! use graphrag::ingest::IngestionPipeline;
//! use graphrag::llm::{build_provider, LlmGateway};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     graphrag::init()?;
//!     let config = AppConfig::load("config/config.yaml")?;
//!
//!     let provider = build_provider(&config).await?;
//!     let gateway = LlmGateway::new(provider, config.max_continuation_attempts);
//!     let embedder = Arc::new(FastembedEmbedder::new(&config.embedding_model.name)?);
//!
//!     let pipeline = IngestionPipeline::new(config, gateway, embedder);
//!     let report = pipeline.add_documents().await?;
//!     println!("ingested: {report:?}");
//!     Ok(())
//! }
//! ```

pub mod chunking;
pub mod community;
pub mod config;
pub mod drift_search;
pub mod embedding;
pub mod error;
pub mod extractor;
pub mod global_search;
pub mod graph;
pub mod index;
pub mod ingest;
pub mod llm;
pub mod loader;
pub mod local_search;
pub mod router;
pub mod store;
pub mod vector;

pub use config::AppConfig;
pub use drift_search::{DriftSearchEngine, SearchContext};
pub use error::{Error, Result};
pub use global_search::{GlobalSearchEngine, GlobalSearchResult};
pub use ingest::{IngestionPipeline, IngestionReport};
pub use llm::{LlmGateway, LlmProvider};
pub use local_search::LocalSearchEngine;
pub use router::{RouterResult, SearchMode, SearchRouter};
pub use store::ArtifactStore;

/// Initialize the library by loading a `.env` file if present
///
/// Call this at the start of an application so API keys and filter settings
/// from a `.env` file land in the environment.
///
/// # Errors
///
/// Currently infallible; the signature leaves room for startup checks.
pub fn init() -> Result<()> {
    dotenvy::dotenv().ok();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init() {
        // Must not fail even without a .env file
        assert!(init().is_ok());
    }
}
