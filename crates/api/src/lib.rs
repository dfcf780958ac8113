//! HTTP ingress for the knowledge base engine: crawl triggers, hybrid
//! search, manifest fetch, budget management, and operational endpoints.

pub mod bootstrap;
pub mod openapi;
pub mod routes;
pub mod server;
pub mod types;

pub use bootstrap::build_state;
pub use server::{router, run, AppState};
