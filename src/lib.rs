//! # ragline
//!
//! **A multi-tenant retrieval-augmented generation engine.**
//!
//! Documents are ingested into per-tenant semantic indexes; a query entry
//! point answers questions grounded strictly in retrieved passages,
//! gated by per-tenant quotas, rate limits, and a response cache.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────┐   ┌───────────────────┐
//! │  upload  │──▶│  Ingestion Pipeline   │──▶│ SQLite rows +     │
//! │  (blob)  │   │ extract→chunk→embed  │   │ per-tenant vector │
//! └──────────┘   └──────────────────────┘   │ index (blob+map)  │
//!                                           └─────────┬─────────┘
//!                ┌──────────────────────┐             │
//! ┌──────────┐   │    Query Pipeline     │◀────────────┘
//! │ question │──▶│ govern→cache→retrieve│
//! └──────────┘   │ →rerank→compress→LLM │──▶ answer + sources +
//!                │ →score→suggest→audit │    confidence + suggestions
//!                └──────────────────────┘
//! ```
//!
//! ## Data Flow
//!
//! 1. [`Engine::ingest`] decodes the blob ([`extract`]), splits it
//!    deterministically ([`chunk`]), embeds the pieces ([`embedding`]),
//!    appends vectors to the tenant's [`index`], and commits chunk rows
//!    and the `ready` transition in one transaction ([`ingest`]).
//! 2. [`Engine::query`] admits the request ([`quota`], [`rate_limit`]),
//!    consults the [`response_cache`], and on a miss retrieves densely
//!    and lexically ([`lexical`]), fuses via RRF ([`hybrid`]), rescores
//!    ([`rerank`]), budgets context ([`compress`]), calls the model
//!    ([`llm`]), scores grounding ([`confidence`]), and proposes
//!    follow-ups ([`suggest`]). Every completed query is recorded
//!    ([`audit`]).
//!
//! ## Isolation
//!
//! The tenant id is the isolation boundary: every row carries it, every
//! SQL predicate filters on it, and every index artifact lives under a
//! tenant-scoped path. Ids from another tenant behave as missing.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | Typed TOML configuration with validation |
//! | [`models`] | Core data types |
//! | [`error`] | Engine error taxonomy |
//! | [`extract`] | Binary → page-tagged normalized text |
//! | [`chunk`] | Deterministic token-window chunker |
//! | [`embedding`] | Embedding providers (HTTP, null) |
//! | [`llm`] | Answer-generation providers (HTTP, null) |
//! | [`index`] | Per-tenant inner-product vector index |
//! | [`index_cache`] | Bounded LRU of loaded indexes |
//! | [`object_store`] | Atomic blob persistence |
//! | [`lexical`] | BM25 retrieval |
//! | [`hybrid`] | Reciprocal Rank Fusion |
//! | [`rerank`] | Cross-encoder / overlap rescoring |
//! | [`compress`] | Token-budgeted context selection |
//! | [`confidence`] | Grounding confidence scoring |
//! | [`suggest`] | Follow-up query generation |
//! | [`response_cache`] | Single-flight answer cache |
//! | [`quota`] | Per-tenant usage quotas |
//! | [`rate_limit`] | RPM/TPM token buckets |
//! | [`audit`] | Audit trail and feedback |
//! | [`ingest`] | Ingestion pipeline |
//! | [`query`] | Query pipeline |
//! | [`engine`] | Owned state and entry points |

pub mod audit;
pub mod chunk;
pub mod compress;
pub mod confidence;
pub mod config;
pub mod db;
pub mod docs;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod extract;
pub mod hybrid;
pub mod index;
pub mod index_cache;
pub mod ingest;
pub mod lexical;
pub mod llm;
pub mod migrate;
pub mod models;
pub mod object_store;
pub mod query;
pub mod quota;
pub mod rate_limit;
pub mod rerank;
pub mod response_cache;
pub mod suggest;

// Re-export the surface most callers need.
pub use config::Config;
pub use engine::Engine;
pub use error::{Error, Result};
pub use models::{
    Confidence, ConfidenceLevel, Document, DocumentStatus, IngestReceipt, QueryEvent,
    QueryOptions, QueryResult, SourceRef,
};
