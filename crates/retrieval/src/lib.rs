//! Hybrid retrieval: Reciprocal Rank Fusion, the tiered query cache, and
//! the search engine that orchestrates vector, full-text, and structured
//! strategies over the vector store.

pub mod cache;
pub mod rrf;
pub mod search;

pub use cache::{query_fingerprint, CacheLookup, SearchFilters, TieredCache};
pub use rrf::{
    consensus_analysis, fuse, ConsensusAnalysis, FusedItem, FusionOptions, RankedItem, RankedList,
    SystemContribution, DEFAULT_RRF_K,
};
pub use search::{
    HybridSearchEngine, SearchHit, SearchRequest, SearchResponse, SearchStrategy,
};
