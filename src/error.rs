//! Error taxonomy for the retrieval-augmented query pipeline.
//!
//! Protocol-visible failures map to a stable numeric close code (see
//! [`ChatError::close_code`]); everything the client sees is a short
//! message plus that code, never an internal trace.

use thiserror::Error;

/// Ingestion stage at which a pipeline failure occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Extract,
    Chunk,
    Index,
}

impl std::fmt::Display for IngestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngestStage::Extract => write!(f, "extract"),
            IngestStage::Chunk => write!(f, "chunk"),
            IngestStage::Index => write!(f, "index"),
        }
    }
}

/// Domain error for docchat.
#[derive(Debug, Error)]
pub enum ChatError {
    /// Missing, malformed, expired, or forged bearer credential.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The requested document is not owned by the principal (or does not exist).
    #[error("document not found or access denied")]
    AccessDenied,

    /// No persisted index exists yet for the resolved scope.
    #[error("index not ready; upload and process a document first")]
    NotReady,

    /// An index cannot be built over zero texts.
    #[error("cannot build an index over an empty corpus")]
    EmptyCorpus,

    /// Persisted index artifacts are missing, unreadable, or inconsistent.
    #[error("index corrupt at {path}: {reason}")]
    IndexCorrupt { path: String, reason: String },

    /// A pipeline stage failed; the caller rolls back all partial state.
    #[error("ingestion failed at {stage} stage: {cause}")]
    Ingestion { stage: IngestStage, cause: String },

    /// Generation backend unreachable or misconfigured (missing key, timeout).
    #[error("generation backend unavailable: {0}")]
    GenerationUnavailable(String),

    /// Generation backend reported an error for this request.
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    /// Malformed or unsupported client message.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ChatError {
    /// Stable numeric code delivered to WebSocket clients alongside the
    /// human-readable message. Matches the close-code space of the wire
    /// protocol (4000-4009).
    pub fn close_code(&self) -> u16 {
        match self {
            ChatError::Auth(_) => 4001,
            ChatError::AccessDenied => 4003,
            ChatError::Protocol(_) => 4005,
            ChatError::NotReady
            | ChatError::EmptyCorpus
            | ChatError::IndexCorrupt { .. }
            | ChatError::Db(_)
            | ChatError::Io(_) => 4008,
            ChatError::GenerationUnavailable(_) | ChatError::GenerationFailed(_) => 4009,
            ChatError::Ingestion { .. } | ChatError::Json(_) => 4006,
        }
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
