//! Document ingestion.
//!
//! Each accepted upload gets a `pending` status record and is queued. A fixed
//! pool of workers drains the bounded queue and drives every document
//! through the status machine:
//!
//! | State | Progress | Work |
//! |-------|----------|------|
//! | `pending` | 0 | record written on acceptance |
//! | `extracting` | 10 | [`Extractor`] turns the stored file into segments |
//! | `chunking` | 30 | segments split into overlapping chunks |
//! | `embedding` | 50 | chunks hashed and counted |
//! | `indexing` | 80 | chunks embedded and appended to the index |
//! | `completed` | 100 | `chunk_count` set |
//! | `failed` | 0 | terminal; `error` holds the reason |
//!
//! Failures never propagate to the uploader; they end in `failed`.
//!
//! The index has no per-document delete. Removing a document resets the
//! index and re-adds every other completed document from its stored file.
//! All index mutations, including the final `completed` transition, happen
//! under the store's writer lock, so a rebuild always sees a status
//! collection that matches the index.

use anyhow::bail;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::chunk::{chunk_segments, content_hash};
use crate::config::IngestConfig;
use crate::error::{RagError, Result};
use crate::extract::Extractor;
use crate::knowledge_base::{IndexWriter, KnowledgeBase};
use crate::models::{DocumentRecord, DocumentState};

// ============ Pipeline ============

/// Runs the status machine for one document at a time.
pub struct Ingestor {
    kb: Arc<KnowledgeBase>,
    extractor: Arc<dyn Extractor>,
}

impl Ingestor {
    pub fn new(kb: Arc<KnowledgeBase>, extractor: Arc<dyn Extractor>) -> Self {
        Self { kb, extractor }
    }

    pub fn knowledge_base(&self) -> &Arc<KnowledgeBase> {
        &self.kb
    }

    /// Process a `pending` document to a terminal state and return its
    /// final record.
    pub async fn run_document(&self, id: &str) -> Result<DocumentRecord> {
        let record = self
            .kb
            .status()
            .get(id)
            .ok_or_else(|| RagError::UnknownDocument(id.to_string()))?;

        match self.process(&record).await {
            Ok(chunks) => {
                info!(doc_id = id, chunks, "document ingested");
            }
            Err(e) => {
                let reason = format!("{:#}", e);
                warn!(doc_id = id, error = %reason, "document ingestion failed");
                match self.kb.status().advance(id, DocumentState::Failed { error: reason }) {
                    Ok(_) => info!(doc_id = id, state = "failed", progress = 0, "status"),
                    Err(e) => error!(doc_id = id, error = %e, "could not record ingestion failure"),
                }
                if let Err(e) = self.drop_stale_chunks(id).await {
                    warn!(doc_id = id, error = %e, "could not drop chunks of previous version");
                }
            }
        }

        self.kb
            .status()
            .get(id)
            .ok_or_else(|| RagError::UnknownDocument(id.to_string()))
    }

    async fn process(&self, record: &DocumentRecord) -> anyhow::Result<usize> {
        let id = record.id.as_str();
        let config = self.kb.config();

        self.enter(id, DocumentState::Extracting)?;
        let segments = self.extractor.extract(id, &record.storage_path).await?;
        if segments.is_empty() {
            return Err(RagError::ExtractionEmpty(id.to_string()).into());
        }

        self.enter(id, DocumentState::Chunking)?;
        let chunks = chunk_segments(
            &segments,
            config.chunking.chunk_size,
            config.chunking.chunk_overlap,
        );
        if chunks.is_empty() {
            return Err(RagError::ChunkingEmpty(id.to_string()).into());
        }

        self.enter(id, DocumentState::Embedding)?;
        let hashes: Vec<String> = chunks.iter().map(|c| content_hash(&c.text)).collect();
        let digest = content_hash(&hashes.concat());
        debug!(
            doc_id = id,
            chunks = chunks.len(),
            digest = &digest[..12],
            "chunks prepared for indexing"
        );

        self.enter(id, DocumentState::Indexing)?;
        let store = self.kb.index().await?;
        let writer = store.writer().await;

        if !self.kb.status().contains(id) {
            bail!("document was removed while it was being processed");
        }
        if writer.contains_source(id).await {
            // Re-upload of an indexed document: drop its previous chunks.
            self.rebuild(&writer).await?;
        }

        let added = writer.add(chunks).await?;
        if added == 0 {
            bail!("no vectors were added to the index");
        }
        self.kb.status().update(id, |r| {
            r.chunk_count = added;
            r.advance(DocumentState::Completed)
        })?;
        info!(doc_id = id, state = "completed", progress = 100, "status");
        Ok(added)
    }

    /// A failed re-upload must not leave the previous version searchable.
    async fn drop_stale_chunks(&self, id: &str) -> Result<()> {
        let store = self.kb.index().await?;
        let writer = store.writer().await;
        if writer.contains_source(id).await {
            let remaining = self.rebuild(&writer).await?;
            info!(doc_id = id, remaining, "dropped chunks of previous version");
        }
        Ok(())
    }

    fn enter(&self, id: &str, state: DocumentState) -> Result<()> {
        let record = self.kb.status().advance(id, state)?;
        info!(doc_id = id, state = record.state.name(), progress = record.progress, "status");
        Ok(())
    }

    /// Reset the index and re-add every completed document from its stored
    /// file. Caller holds the writer.
    async fn rebuild(&self, writer: &IndexWriter<'_>) -> Result<usize> {
        writer.reset().await?;
        let config = self.kb.config();
        let mut total = 0;

        let completed = self
            .kb
            .status()
            .list()
            .into_iter()
            .filter(|r| r.state == DocumentState::Completed);

        for record in completed {
            let chunks = match self.extractor.extract(&record.id, &record.storage_path).await {
                Ok(segments) => chunk_segments(
                    &segments,
                    config.chunking.chunk_size,
                    config.chunking.chunk_overlap,
                ),
                Err(e) => {
                    warn!(doc_id = %record.id, error = %e, "could not re-extract document during rebuild");
                    Vec::new()
                }
            };
            let added = writer.add(chunks).await?;
            total += added;
            self.kb.status().update(&record.id, |r| {
                r.chunk_count = added;
                Ok(())
            })?;
        }

        info!(size = total, "index rebuilt");
        Ok(total)
    }

    /// Remove a document's record, stored file, and index entries.
    pub async fn delete_document(&self, id: &str) -> Result<()> {
        let record = self
            .kb
            .status()
            .get(id)
            .ok_or_else(|| RagError::UnknownDocument(id.to_string()))?;

        let store = self.kb.index().await?;
        let writer = store.writer().await;

        self.kb.status().remove(id)?;
        match tokio::fs::remove_file(&record.storage_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(doc_id = id, error = %e, "could not remove stored file"),
        }

        let remaining = self.rebuild(&writer).await?;
        info!(doc_id = id, remaining, "document deleted");
        Ok(())
    }

    /// Empty the index and forget every document.
    pub async fn reset_all(&self) -> Result<()> {
        let store = self.kb.index().await?;
        let writer = store.writer().await;
        writer.reset().await?;
        self.kb.status().clear()?;
        info!("knowledge base reset");
        Ok(())
    }
}

// ============ Worker Pool ============

/// Bounded job queue drained by a fixed number of workers.
pub struct IngestQueue {
    ingestor: Arc<Ingestor>,
    sender: mpsc::Sender<String>,
    workers: Vec<JoinHandle<()>>,
}

impl IngestQueue {
    pub fn start(ingestor: Arc<Ingestor>, config: &IngestConfig) -> Self {
        let (sender, receiver) = mpsc::channel::<String>(config.queue_capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));

        let workers = (0..config.workers.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let ingestor = ingestor.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(id) = next else { break };
                        debug!(worker, doc_id = %id, "picked up document");
                        if let Err(e) = ingestor.run_document(&id).await {
                            warn!(worker, doc_id = %id, error = %e, "ingestion job dropped");
                        }
                    }
                    debug!(worker, "ingest worker stopped");
                })
            })
            .collect();

        Self {
            ingestor,
            sender,
            workers,
        }
    }

    /// Queue a document that already has a `pending` record. Waits while
    /// the queue is full.
    pub async fn submit(&self, id: String) -> Result<()> {
        self.sender.send(id).await.map_err(|_| RagError::QueueClosed)
    }

    /// Store an upload, create its `pending` record, and queue it.
    ///
    /// Returns as soon as the job is queued; progress is observed through
    /// the status record.
    pub async fn accept_upload(&self, filename: &str, bytes: &[u8]) -> Result<DocumentRecord> {
        let kb = self.ingestor.knowledge_base();
        let config = kb.config();

        let id = sanitize_filename(filename)
            .ok_or_else(|| RagError::UploadRejected(format!("invalid file name {:?}", filename)))?;

        let limit = config.ingest.max_upload_bytes();
        if bytes.len() as u64 > limit {
            return Err(RagError::UploadRejected(format!(
                "{} is {} bytes, limit is {} bytes",
                id,
                bytes.len(),
                limit
            )));
        }

        // Claim the id before touching the stored file of a running job.
        let path = config.storage.upload_dir.join(&id);
        let record = DocumentRecord::pending(id.clone(), path.clone(), bytes.len() as u64);
        kb.status().insert_unless_active(record.clone())?;

        if let Err(e) = store_upload(&config.storage.upload_dir, &path, bytes).await {
            let failed = DocumentState::Failed {
                error: e.to_string(),
            };
            if let Err(status_err) = kb.status().advance(&id, failed) {
                error!(doc_id = %id, error = %status_err, "could not record upload failure");
            }
            return Err(e);
        }
        info!(doc_id = %id, size = bytes.len(), "upload accepted");

        self.submit(id).await?;
        Ok(record)
    }

    /// Stop accepting jobs and wait for queued ones to finish.
    pub async fn shutdown(self) {
        drop(self.sender);
        for worker in self.workers {
            if let Err(e) = worker.await {
                error!(error = %e, "ingest worker panicked");
            }
        }
    }
}

/// Reduce an uploaded name to a safe single file name: directories are
/// dropped and whitespace becomes `_`.
pub fn sanitize_filename(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default().trim();
    let cleaned: String = base
        .chars()
        .filter(|c| !c.is_control())
        .map(|c| if c.is_whitespace() { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => None,
        _ => Some(cleaned),
    }
}

async fn store_upload(dir: &Path, path: &Path, bytes: &[u8]) -> Result<()> {
    tokio::fs::create_dir_all(dir)
        .await
        .map_err(|e| RagError::io(e, format!("creating {}", dir.display())))?;
    tokio::fs::write(path, bytes)
        .await
        .map_err(|e| RagError::io(e, format!("writing {}", path.display())))
}
