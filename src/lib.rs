//! # ragbase
//!
//! Document ingestion and retrieval-augmented question answering.
//!
//! Uploaded documents are extracted, chunked, embedded, and appended to a
//! flat nearest-neighbor index. Questions are embedded the same way,
//! matched against the index, and answered by a chat model that is told to
//! use only the retrieved passages. Answers cite the documents they drew
//! from.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────────────────────┐   ┌──────────────┐
//! │  Upload  │──▶│ Ingest workers            │──▶│ Vector index │
//! │  (queue) │   │ extract→chunk→embed→index │   │ .index/.meta │
//! └──────────┘   └────────────┬─────────────┘   └──────┬───────┘
//!                             ▼                        │
//!                      ┌─────────────┐                 ▼
//!                      │ Status JSON │          ┌─────────────┐
//!                      └─────────────┘          │ RAG answer  │──▶ chat model
//!                                               └─────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Domain error type |
//! | [`models`] | Segments, status records, answers |
//! | [`chunk`] | Overlapping text chunker |
//! | [`embedding`] | Embedding providers and the batching client |
//! | [`vector_index`] | Flat L2 index with paired persistence |
//! | [`status`] | Document status records |
//! | [`knowledge_base`] | Shared index + status, writer discipline |
//! | [`extract`] | Text extraction from stored files |
//! | [`ingest`] | Ingestion state machine and worker pool |
//! | [`completion`] | Chat-completion providers |
//! | [`rag`] | Retrieval and answer generation |

pub mod chunk;
pub mod completion;
pub mod config;
pub mod embedding;
pub mod error;
pub mod extract;
pub mod ingest;
pub mod knowledge_base;
pub mod models;
pub mod rag;
pub mod status;
pub mod vector_index;
