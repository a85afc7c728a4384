//! Core data models used throughout ragbase.
//!
//! These types represent the segments, status records, and answers that flow
//! through the ingestion and retrieval pipelines.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::{RagError, Result};

/// Where a segment came from inside its source document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Position {
    /// 1-based page number, when the extractor knows it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page: Option<u32>,
    /// Character offset of the segment within the extracted page/section text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_offset: Option<usize>,
}

/// A bounded span of document text with its provenance.
///
/// Extractors produce one segment per page or section; the chunker turns
/// those into overlapping windows that carry the same `source_id` and page
/// plus their starting offset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub text: String,
    pub source_id: String,
    #[serde(default)]
    pub position: Position,
}

impl Segment {
    pub fn new(text: impl Into<String>, source_id: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_id: source_id.into(),
            position: Position::default(),
        }
    }

    pub fn with_page(mut self, page: u32) -> Self {
        self.position.page = Some(page);
        self
    }
}

/// Processing state of an uploaded document.
///
/// States are strictly ordered; `Completed` and `Failed` are terminal and
/// only `Failed` carries an error message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum DocumentState {
    Pending,
    Extracting,
    Chunking,
    Embedding,
    Indexing,
    Completed,
    Failed { error: String },
}

impl DocumentState {
    pub fn name(&self) -> &'static str {
        match self {
            DocumentState::Pending => "pending",
            DocumentState::Extracting => "extracting",
            DocumentState::Chunking => "chunking",
            DocumentState::Embedding => "embedding",
            DocumentState::Indexing => "indexing",
            DocumentState::Completed => "completed",
            DocumentState::Failed { .. } => "failed",
        }
    }

    /// Progress percentage reported while in this state.
    pub fn progress(&self) -> u8 {
        match self {
            DocumentState::Pending => 0,
            DocumentState::Extracting => 10,
            DocumentState::Chunking => 30,
            DocumentState::Embedding => 50,
            DocumentState::Indexing => 80,
            DocumentState::Completed => 100,
            DocumentState::Failed { .. } => 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DocumentState::Completed | DocumentState::Failed { .. }
        )
    }

    fn rank(&self) -> u8 {
        match self {
            DocumentState::Pending => 0,
            DocumentState::Extracting => 1,
            DocumentState::Chunking => 2,
            DocumentState::Embedding => 3,
            DocumentState::Indexing => 4,
            DocumentState::Completed => 5,
            DocumentState::Failed { .. } => 6,
        }
    }

    /// Forward moves only; `Failed` is reachable from any non-terminal state.
    pub fn can_transition_to(&self, next: &DocumentState) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            DocumentState::Failed { .. } => true,
            _ => next.rank() > self.rank(),
        }
    }
}

/// Status record for one logical document, keyed by its identifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub storage_path: PathBuf,
    pub upload_time: DateTime<Utc>,
    pub file_size: u64,
    #[serde(flatten)]
    pub state: DocumentState,
    pub progress: u8,
    pub chunk_count: usize,
}

impl DocumentRecord {
    /// A freshly accepted upload.
    pub fn pending(id: impl Into<String>, storage_path: impl Into<PathBuf>, file_size: u64) -> Self {
        Self {
            id: id.into(),
            storage_path: storage_path.into(),
            upload_time: Utc::now(),
            file_size,
            state: DocumentState::Pending,
            progress: 0,
            chunk_count: 0,
        }
    }

    /// Move to `next`, updating progress from the state.
    pub fn advance(&mut self, next: DocumentState) -> Result<()> {
        if !self.state.can_transition_to(&next) {
            return Err(RagError::InvalidTransition {
                id: self.id.clone(),
                from: self.state.name(),
                to: next.name(),
            });
        }
        self.progress = next.progress();
        self.state = next;
        Ok(())
    }

    pub fn error(&self) -> Option<&str> {
        match &self.state {
            DocumentState::Failed { error } => Some(error),
            _ => None,
        }
    }
}

/// All status records plus the most recent upload time.
#[derive(Debug, Clone, Serialize)]
pub struct DocumentListing {
    pub documents: Vec<DocumentRecord>,
    pub last_updated: Option<DateTime<Utc>>,
}

/// One retrieved passage backing an answer.
#[derive(Debug, Clone, Serialize)]
pub struct Passage {
    pub source_id: String,
    pub text: String,
    pub position: Position,
    /// Squared Euclidean distance to the query (lower is closer).
    pub distance: f32,
}

/// A grounded answer with its cited documents.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub answer: String,
    /// Deduplicated source document ids, in first-seen rank order.
    pub sources: Vec<String>,
    pub passages: Vec<Passage>,
}

impl Answer {
    pub fn without_sources(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
            sources: Vec::new(),
            passages: Vec::new(),
        }
    }
}

/// Events emitted by a streaming answer, in order: tokens, sources, done.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum StreamEvent {
    Token(String),
    Error(String),
    Sources(Vec<String>),
    Done,
}
