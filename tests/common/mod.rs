//! In-process fakes shared by the integration tests.

#![allow(dead_code)]

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::mpsc;

use ragbase::completion::{ChatMessage, CompletionProvider};
use ragbase::config::Config;
use ragbase::embedding::EmbeddingProvider;
use ragbase::extract::Extractor;
use ragbase::ingest::Ingestor;
use ragbase::knowledge_base::KnowledgeBase;
use ragbase::models::{DocumentRecord, Segment};

pub const DIMS: usize = 8;

// ─── Embedding ──────────────────────────────────────────────────────

/// Letter histogram folded into `DIMS` buckets.
pub struct FakeEmbedder {
    pub calls: AtomicUsize,
    pub failing: AtomicBool,
}

impl FakeEmbedder {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

pub fn letter_vector(text: &str) -> Vec<f32> {
    let mut v = vec![0.0; DIMS];
    for c in text.chars().filter(|c| c.is_ascii_alphabetic()) {
        let bucket = (c.to_ascii_lowercase() as u8 - b'a') as usize % DIMS;
        v[bucket] += 1.0;
    }
    v
}

#[async_trait]
impl EmbeddingProvider for FakeEmbedder {
    fn model_name(&self) -> &str {
        "fake-letters"
    }

    fn dims(&self) -> Option<usize> {
        Some(DIMS)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            bail!("embedding backend unavailable");
        }
        Ok(texts.iter().map(|t| letter_vector(t)).collect())
    }
}

// ─── Extraction ─────────────────────────────────────────────────────

/// Returns pre-registered segments by document id.
pub struct FakeExtractor {
    documents: Mutex<HashMap<String, Vec<Segment>>>,
    delay: Duration,
}

impl FakeExtractor {
    pub fn new() -> Self {
        Self::with_delay(Duration::ZERO)
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            documents: Mutex::new(HashMap::new()),
            delay,
        }
    }

    /// Register a document whose pages have the given texts.
    pub fn set(&self, id: &str, pages: &[&str]) {
        let segments = pages
            .iter()
            .enumerate()
            .map(|(i, text)| Segment::new(*text, id).with_page(i as u32 + 1))
            .collect();
        self.documents.lock().unwrap().insert(id.to_string(), segments);
    }
}

#[async_trait]
impl Extractor for FakeExtractor {
    async fn extract(&self, source_id: &str, _path: &Path) -> Result<Vec<Segment>> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.documents
            .lock()
            .unwrap()
            .get(source_id)
            .cloned()
            .ok_or_else(|| anyhow!("no such file: {}", source_id))
    }
}

// ─── Completion ─────────────────────────────────────────────────────

pub struct FakeCompletion {
    pub calls: AtomicUsize,
    pub failing: AtomicBool,
    pub last_prompt: Mutex<Option<String>>,
}

impl FakeCompletion {
    pub fn new() -> Self {
        Self {
            calls: AtomicUsize::new(0),
            failing: AtomicBool::new(false),
            last_prompt: Mutex::new(None),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn fail(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn record(&self, messages: &[ChatMessage]) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        *self.last_prompt.lock().unwrap() = messages.last().map(|m| m.content.clone());
        if self.failing.load(Ordering::SeqCst) {
            bail!("completion backend returned 503");
        }
        Ok(())
    }
}

#[async_trait]
impl CompletionProvider for FakeCompletion {
    async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
        self.record(messages)?;
        Ok("grounded answer".to_string())
    }

    async fn complete_stream(
        &self,
        messages: &[ChatMessage],
        tokens: mpsc::Sender<String>,
    ) -> Result<()> {
        self.record(messages)?;
        for token in ["grounded", " ", "answer"] {
            tokens.send(token.to_string()).await?;
        }
        Ok(())
    }
}

// ─── Harness ────────────────────────────────────────────────────────

pub struct Harness {
    pub dir: TempDir,
    pub kb: Arc<KnowledgeBase>,
    pub ingestor: Arc<Ingestor>,
    pub embedder: Arc<FakeEmbedder>,
    pub extractor: Arc<FakeExtractor>,
}

pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.storage.data_dir = dir.join("data");
    config.storage.upload_dir = dir.join("uploads");
    config.chunking.chunk_size = 200;
    config.chunking.chunk_overlap = 20;
    config.embedding.batch_size = 2;
    config.embedding.max_retries = 1;
    config.embedding.backoff_ms = 1;
    config.index.init_retry_delay_ms = 1;
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_extractor(FakeExtractor::new())
    }

    pub fn with_extractor(extractor: FakeExtractor) -> Self {
        let dir = TempDir::new().unwrap();
        Self::build(dir, test_config, Arc::new(extractor))
    }

    pub fn with_config(edit: impl FnOnce(&mut Config)) -> Self {
        let dir = TempDir::new().unwrap();
        let mut config = test_config(dir.path());
        edit(&mut config);
        Self::build(dir, move |_| config, Arc::new(FakeExtractor::new()))
    }

    fn build(
        dir: TempDir,
        config: impl FnOnce(&Path) -> Config,
        extractor: Arc<FakeExtractor>,
    ) -> Self {
        let embedder = Arc::new(FakeEmbedder::new());
        let kb = Arc::new(KnowledgeBase::new(config(dir.path()), embedder.clone()));
        let ingestor = Arc::new(Ingestor::new(kb.clone(), extractor.clone()));
        Self {
            dir,
            kb,
            ingestor,
            embedder,
            extractor,
        }
    }

    /// A second knowledge base over the same directory, as after a restart.
    pub fn reopen(&self) -> Arc<KnowledgeBase> {
        Arc::new(KnowledgeBase::new(
            test_config(self.dir.path()),
            Arc::new(FakeEmbedder::new()),
        ))
    }

    /// Register `pages` for `id`, create its pending record, and run the
    /// pipeline to completion.
    pub async fn ingest(&self, id: &str, pages: &[&str]) -> DocumentRecord {
        self.extractor.set(id, pages);
        let path = self.dir.path().join("uploads").join(id);
        self.kb
            .status()
            .upsert(DocumentRecord::pending(id, path, 100))
            .unwrap();
        self.ingestor.run_document(id).await.unwrap()
    }
}
