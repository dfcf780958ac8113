//! Database adapters: Postgres + pgvector for chunks and embeddings,
//! Redis for the shared cache tier, and the budget row store.

pub mod budget;
pub mod migrations;
pub mod postgres;
pub mod redis;

pub use self::budget::BudgetStore;
pub use self::postgres::{
    with_retry, AnnQuery, DocumentValidators, FtsQuery, IndexHint, PostgresStore, RankedChunk,
    ReindexKind, StoreStats, StructuredQuery,
};
pub use self::redis::RedisCache;
