//! Core data models flowing through the ingestion and query pipelines.
//!
//! ```text
//! blob → extract() → PageText → chunk() → ChunkPiece → embed() → slots
//!                                                          ↓
//!                                         retrieve() → RetrievedChunk
//!                                                          ↓
//!                                           answer() → QueryResult
//! ```
//!
//! Every stored row carries its `tenant_id`; the tenant is the isolation
//! boundary and no read or write ever crosses it.

use serde::Serialize;

/// Lifecycle state of an uploaded document.
///
/// `Pending → Processing → Ready | Failed`. There is no partial-ready
/// state: a failure at any pipeline stage leaves the document `Failed`
/// with no committed chunks or vectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Ready => "ready",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<DocumentStatus> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "ready" => Some(DocumentStatus::Ready),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// A document row in the `documents` table.
///
/// `(tenant_id, content_digest)` appears at most once with status `ready`;
/// re-uploading identical bytes returns the existing row (idempotent upload).
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    /// UUID v4 primary key.
    pub id: String,
    pub tenant_id: String,
    /// Name declared at upload.
    pub name: String,
    pub byte_size: i64,
    /// SHA-256 of the uploaded bytes, the idempotency key for retries.
    pub content_digest: String,
    pub status: DocumentStatus,
    pub page_count: i64,
    pub chunk_count: i64,
    /// Failure reason when status is `failed`.
    pub error: Option<String>,
    /// Unix epoch seconds.
    pub created_at: i64,
}

/// A chunk row in the `chunks` table.
///
/// Ordinals are dense and 0-based per document. `embedding_slot` is set
/// iff the parent document is `ready` and names a live slot in the
/// tenant's vector index.
#[derive(Debug, Clone)]
pub struct Chunk {
    /// UUID v4 primary key.
    pub id: String,
    pub document_id: String,
    pub tenant_id: String,
    pub ordinal: i64,
    pub text: String,
    pub token_count: i64,
    /// Page of the chunk's first token.
    pub page: i64,
    pub embedding_slot: Option<i64>,
}

/// One page of extracted text, before chunking.
#[derive(Debug, Clone, PartialEq)]
pub struct PageText {
    /// 1-based page number.
    pub page: u32,
    pub text: String,
}

/// Output of the chunker, not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkPiece {
    pub ordinal: usize,
    pub text: String,
    pub token_count: usize,
    pub page: u32,
}

/// Returned by `Engine::ingest`.
#[derive(Debug, Clone, Serialize)]
pub struct IngestReceipt {
    pub document_id: String,
    pub status: DocumentStatus,
    pub page_count: i64,
    pub chunk_count: i64,
    /// True when the upload matched an existing ready document.
    pub deduplicated: bool,
}

/// Per-call options for `Engine::query`. The set is closed: callers cannot
/// smuggle arbitrary knobs past the configuration.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    /// Conversation grouping, recorded in the audit trail.
    pub session_id: Option<String>,
    /// Retrieval size override, clamped to the configured `k_retrieval`.
    pub top_k: Option<usize>,
    /// Restrict retrieval to these document ids.
    pub doc_scope: Option<Vec<String>>,
    pub enable_rerank: bool,
    pub enable_cache: bool,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            session_id: None,
            top_k: None,
            doc_scope: None,
            enable_rerank: true,
            enable_cache: true,
        }
    }
}

/// A source citation in a query answer.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SourceRef {
    pub doc_id: String,
    pub chunk_id: String,
    pub page: i64,
    pub score: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    None,
}

impl ConfidenceLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConfidenceLevel::High => "high",
            ConfidenceLevel::Medium => "medium",
            ConfidenceLevel::Low => "low",
            ConfidenceLevel::None => "none",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct Confidence {
    pub level: ConfidenceLevel,
    pub score: f32,
}

impl Confidence {
    pub fn none() -> Self {
        Self {
            level: ConfidenceLevel::None,
            score: 0.0,
        }
    }

    /// Lower the level to at most `cap`, keeping the score.
    pub fn capped_at(self, cap: ConfidenceLevel) -> Self {
        let rank = |l: ConfidenceLevel| match l {
            ConfidenceLevel::None => 0,
            ConfidenceLevel::Low => 1,
            ConfidenceLevel::Medium => 2,
            ConfidenceLevel::High => 3,
        };
        if rank(self.level) > rank(cap) {
            Self {
                level: cap,
                score: self.score,
            }
        } else {
            self
        }
    }
}

/// Returned by `Engine::query`.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub answer: String,
    pub sources: Vec<SourceRef>,
    pub confidence: Confidence,
    pub suggestions: Vec<String>,
    pub cache_hit: bool,
    pub tokens_used: i64,
    pub latency_ms: i64,
    /// Id under which feedback on this answer is accepted.
    pub message_id: String,
}

/// Event emitted by `Engine::query_stream`: answer tokens followed by one
/// terminal payload. The sequence is finite and not restartable.
#[derive(Debug, Clone)]
pub enum QueryEvent {
    Token(String),
    Done(Box<QueryResult>),
}

/// A chunk as it moves through retrieve → rerank → compress → score.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub page: i64,
    pub text: String,
    pub score: f32,
}

/// Read-side aggregation over feedback rows.
#[derive(Debug, Clone, Serialize)]
pub struct FeedbackStats {
    pub total: i64,
    pub positive: i64,
    pub negative: i64,
}

/// Vector-index statistics for one tenant.
#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub tenant_id: String,
    pub vectors: usize,
    pub tombstones: usize,
    pub dims: usize,
}
