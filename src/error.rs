//! Domain errors for the ingestion and retrieval core.
//!
//! Only a few of these ever reach a caller. Ingestion failures end up in a
//! document's status record, embedding batch failures are absorbed by
//! zero-vector substitution, and completion failures become an apology
//! answer. What does propagate is caller input errors and a fatally
//! misconfigured index.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RagError {
    /// The extractor produced no text segments for a document.
    #[error("no extractable text found in {0}")]
    ExtractionEmpty(String),

    /// Extraction produced text but chunking yielded nothing indexable.
    #[error("document {0} produced no chunks")]
    ChunkingEmpty(String),

    /// An embedding batch exhausted its retries.
    #[error("embedding batch {batch} failed after {attempts} attempts: {reason}")]
    EmbeddingBatchFailed {
        batch: usize,
        attempts: u32,
        reason: String,
    },

    /// The vector index could not be initialized; calls fail fast.
    #[error("vector index unavailable: {0}")]
    IndexUninitialized(String),

    /// Persisted index artifacts were unreadable or disagreed with each other.
    #[error("persisted index is corrupt: {0}")]
    IndexCorruptPersisted(String),

    /// Embedding dimension disagrees with the index dimension.
    #[error("embedding dimension mismatch: index expects {expected}, provider returned {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// The chat-completion provider failed (network, status, or payload).
    #[error("completion provider error: {0}")]
    CompletionProvider(String),

    #[error("query must not be empty")]
    EmptyQuery,

    #[error("unknown document: {0}")]
    UnknownDocument(String),

    #[error("upload rejected: {0}")]
    UploadRejected(String),

    /// A status record was asked to move backwards or out of a terminal state.
    #[error("invalid status transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: &'static str,
        to: &'static str,
    },

    #[error("ingestion queue is closed")]
    QueueClosed,

    #[error("IO error: {context}: {source}")]
    Io {
        source: std::io::Error,
        context: String,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        source: serde_json::Error,
        context: String,
    },
}

impl RagError {
    pub(crate) fn io(source: std::io::Error, context: impl Into<String>) -> Self {
        Self::Io {
            source,
            context: context.into(),
        }
    }

    pub(crate) fn json(source: serde_json::Error, context: impl Into<String>) -> Self {
        Self::Json {
            source,
            context: context.into(),
        }
    }

    /// True for errors caused by the caller's input rather than the system.
    pub fn is_input_error(&self) -> bool {
        matches!(
            self,
            RagError::EmptyQuery | RagError::UnknownDocument(_) | RagError::UploadRejected(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RagError>;
