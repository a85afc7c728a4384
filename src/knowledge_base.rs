//! The shared knowledge base: vector store plus document status records.
//!
//! A [`KnowledgeBase`] is constructed once and handed to every caller as an
//! `Arc`. Its vector store is opened lazily on first use, because opening it
//! needs the embedding dimension and that may require a live provider. If
//! opening fails the knowledge base stays unusable and every later call
//! fails fast with [`RagError::IndexUninitialized`].
//!
//! # Locking
//!
//! | Lock | Guards | Held by |
//! |------|--------|---------|
//! | `writer` (`Mutex<()>`) | the sequence of mutations | add, reset, rebuild; includes embedding time |
//! | `index` (`RwLock`) | the in-memory rows | searches (read), append/reset (write, brief) |
//!
//! Embedding happens under `writer` only, so searches keep running while a
//! document is being embedded; they never observe a half-appended batch.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::embedding::{create_provider, EmbeddingClient, EmbeddingProvider};
use crate::error::{RagError, Result};
use crate::models::Segment;
use crate::status::StatusStore;
use crate::vector_index::VectorIndex;

// ============ Vector Store ============

/// A [`VectorIndex`] paired with the client that embeds its text.
pub struct VectorStore {
    embedder: EmbeddingClient,
    index: RwLock<VectorIndex>,
    writer: Mutex<()>,
}

impl VectorStore {
    /// Open (or create) the index under `prefix` at the client's dimension.
    pub fn open(embedder: EmbeddingClient, prefix: &Path) -> Result<Self> {
        let index = VectorIndex::open(prefix, embedder.dims())?;
        Ok(Self {
            embedder,
            index: RwLock::new(index),
            writer: Mutex::new(()),
        })
    }

    pub fn dims(&self) -> usize {
        self.embedder.dims()
    }

    pub async fn size(&self) -> usize {
        self.index.read().await.len()
    }

    /// Nearest segments to `query`, closest first. An empty index returns
    /// nothing without embedding the query.
    pub async fn search(&self, query: &str, k: usize) -> Result<Vec<(Segment, f32)>> {
        if k == 0 || self.size().await == 0 {
            return Ok(Vec::new());
        }
        let vector = self.embedder.embed_query(query).await?;
        self.index.read().await.search(&vector, k)
    }

    /// Exclusive write access for a sequence of mutations.
    pub async fn writer(&self) -> IndexWriter<'_> {
        IndexWriter {
            store: self,
            _guard: self.writer.lock().await,
        }
    }

    /// Embed and append `segments`, then persist. Returns the number added.
    pub async fn add(&self, segments: Vec<Segment>) -> Result<usize> {
        self.writer().await.add(segments).await
    }

    pub async fn reset(&self) -> Result<()> {
        self.writer().await.reset().await
    }
}

/// Holds the store's writer lock; mutations through it cannot interleave
/// with mutations from anywhere else.
pub struct IndexWriter<'a> {
    store: &'a VectorStore,
    _guard: MutexGuard<'a, ()>,
}

impl IndexWriter<'_> {
    pub async fn add(&self, segments: Vec<Segment>) -> Result<usize> {
        if segments.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = segments.iter().map(|s| s.text.clone()).collect();
        let vectors = self.store.embedder.embed(&texts).await?;
        if vectors.is_empty() {
            return Ok(0);
        }

        let mut index = self.store.index.write().await;
        let added = index.append(vectors, segments)?;
        if let Err(e) = index.save() {
            // The rows stay in memory; the next successful save catches up.
            error!(error = %e, "failed to persist vector index");
        }
        debug!(added, size = index.len(), "segments indexed");
        Ok(added)
    }

    pub async fn reset(&self) -> Result<()> {
        self.store.index.write().await.reset()
    }

    /// Whether any indexed segment came from `source_id`.
    pub async fn contains_source(&self, source_id: &str) -> bool {
        self.store
            .index
            .read()
            .await
            .segments()
            .iter()
            .any(|s| s.source_id == source_id)
    }
}

// ============ Knowledge Base ============

enum IndexSlot {
    Uninitialized,
    Ready(Arc<VectorStore>),
    Unusable(String),
}

/// Process-wide state: lazily opened vector store plus status records.
pub struct KnowledgeBase {
    config: Config,
    provider: Arc<dyn EmbeddingProvider>,
    slot: Mutex<IndexSlot>,
    status: StatusStore,
}

impl KnowledgeBase {
    pub fn new(config: Config, provider: Arc<dyn EmbeddingProvider>) -> Self {
        let status = StatusStore::open(config.storage.status_path());
        Self {
            config,
            provider,
            slot: Mutex::new(IndexSlot::Uninitialized),
            status,
        }
    }

    /// Build with the embedding provider named in `config`.
    pub fn from_config(config: Config) -> anyhow::Result<Self> {
        let provider = create_provider(&config.embedding)?;
        Ok(Self::new(config, provider))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    /// The vector store, opening it on first call.
    pub async fn index(&self) -> Result<Arc<VectorStore>> {
        let mut slot = self.slot.lock().await;
        match &*slot {
            IndexSlot::Ready(store) => return Ok(store.clone()),
            IndexSlot::Unusable(reason) => return Err(RagError::IndexUninitialized(reason.clone())),
            IndexSlot::Uninitialized => {}
        }

        let opened = match EmbeddingClient::connect(
            self.provider.clone(),
            &self.config.embedding,
            &self.config.index,
        )
        .await
        {
            Ok(embedder) => VectorStore::open(embedder, &self.config.storage.index_prefix()),
            Err(e) => Err(e),
        };

        match opened {
            Ok(store) => {
                let store = Arc::new(store);
                let size = store.size().await;
                info!(dims = store.dims(), size, "knowledge base ready");
                *slot = IndexSlot::Ready(store.clone());
                Ok(store)
            }
            Err(e) => {
                let reason = e.to_string();
                warn!(error = %reason, "knowledge base index is unusable");
                *slot = IndexSlot::Unusable(reason.clone());
                match e {
                    RagError::DimensionMismatch { .. } => Err(e),
                    _ => Err(RagError::IndexUninitialized(reason)),
                }
            }
        }
    }

    /// Number of indexed segments.
    pub async fn size(&self) -> Result<usize> {
        Ok(self.index().await?.size().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    /// Two-dimensional vectors: (text length, count of 'a').
    struct CountingProvider {
        dims: Option<usize>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl EmbeddingProvider for CountingProvider {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn dims(&self) -> Option<usize> {
            self.dims
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.dims.is_none() {
                anyhow::bail!("backend down");
            }
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, t.matches('a').count() as f32])
                .collect())
        }
    }

    fn config(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().to_path_buf();
        config.embedding.backoff_ms = 1;
        config.index.init_retry_delay_ms = 1;
        config
    }

    fn kb(dir: &TempDir, dims: Option<usize>) -> (KnowledgeBase, Arc<CountingProvider>) {
        let provider = Arc::new(CountingProvider {
            dims,
            calls: AtomicUsize::new(0),
        });
        (KnowledgeBase::new(config(dir), provider.clone()), provider)
    }

    #[tokio::test]
    async fn test_lazy_open_and_reuse() {
        let dir = TempDir::new().unwrap();
        let (kb, _) = kb(&dir, Some(2));
        let first = kb.index().await.unwrap();
        let second = kb.index().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(kb.size().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unusable_index_fails_fast() {
        let dir = TempDir::new().unwrap();
        let (kb, provider) = kb(&dir, None);
        assert!(matches!(kb.index().await, Err(RagError::IndexUninitialized(_))));
        let probes = provider.calls.load(Ordering::SeqCst);
        assert_eq!(probes, 3);

        assert!(matches!(kb.size().await, Err(RagError::IndexUninitialized(_))));
        assert_eq!(provider.calls.load(Ordering::SeqCst), probes);
    }

    #[tokio::test]
    async fn test_add_and_search() {
        let dir = TempDir::new().unwrap();
        let (kb, _) = kb(&dir, Some(2));
        let store = kb.index().await.unwrap();

        let added = store
            .add(vec![
                Segment::new("aaaa", "A.pdf"),
                Segment::new("bbbbbbbb", "B.pdf"),
            ])
            .await
            .unwrap();
        assert_eq!(added, 2);
        assert_eq!(store.size().await, 2);

        let hits = store.search("aaab", 1).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].0.source_id, "A.pdf");
    }

    #[tokio::test]
    async fn test_empty_add_is_noop() {
        let dir = TempDir::new().unwrap();
        let (kb, provider) = kb(&dir, Some(2));
        let store = kb.index().await.unwrap();
        assert_eq!(store.add(Vec::new()).await.unwrap(), 0);
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_search_empty_index_skips_embedding() {
        let dir = TempDir::new().unwrap();
        let (kb, provider) = kb(&dir, Some(2));
        let store = kb.index().await.unwrap();
        assert!(store.search("anything", 5).await.unwrap().is_empty());
        assert_eq!(provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_index_survives_restart() {
        let dir = TempDir::new().unwrap();
        {
            let (kb, _) = kb(&dir, Some(2));
            let store = kb.index().await.unwrap();
            store.add(vec![Segment::new("abc", "A.pdf")]).await.unwrap();
        }
        let (kb, _) = kb(&dir, Some(2));
        assert_eq!(kb.size().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dimension_change_is_fatal() {
        let dir = TempDir::new().unwrap();
        {
            let (kb, _) = kb(&dir, Some(2));
            let store = kb.index().await.unwrap();
            store.add(vec![Segment::new("abc", "A.pdf")]).await.unwrap();
        }
        let provider = Arc::new(CountingProvider {
            dims: Some(3),
            calls: AtomicUsize::new(0),
        });
        let kb = KnowledgeBase::new(config(&dir), provider);
        assert!(matches!(
            kb.index().await,
            Err(RagError::DimensionMismatch { .. })
        ));
        assert!(matches!(kb.index().await, Err(RagError::IndexUninitialized(_))));
    }
}
