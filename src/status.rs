//! Persistent document status records.
//!
//! Records live in one JSON object keyed by document id and the whole map is
//! rewritten after every mutation. A single mutex serializes mutations, so
//! concurrent pipelines cannot interleave a read-modify-write and lose an
//! update. Readers get clones.

use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::error::{RagError, Result};
use crate::models::{DocumentListing, DocumentRecord, DocumentState};

pub struct StatusStore {
    path: PathBuf,
    records: Mutex<BTreeMap<String, DocumentRecord>>,
}

impl StatusStore {
    /// Load records from `path`. A missing file is an empty store; an
    /// unreadable one is logged and replaced on the next write.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let records = match std::fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(records) => records,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable status file");
                    BTreeMap::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "could not read status file");
                BTreeMap::new()
            }
        };

        Self {
            path,
            records: Mutex::new(records),
        }
    }

    /// Insert or replace a record.
    pub fn upsert(&self, record: DocumentRecord) -> Result<()> {
        let mut records = self.lock();
        records.insert(record.id.clone(), record);
        self.persist(&records)
    }

    /// Insert `record` unless a record with the same id is still in
    /// progress. The check and the insert happen under one lock.
    pub fn insert_unless_active(&self, record: DocumentRecord) -> Result<()> {
        let mut records = self.lock();
        if let Some(existing) = records.get(&record.id) {
            if !existing.state.is_terminal() {
                return Err(RagError::UploadRejected(format!(
                    "{} is still being processed ({})",
                    record.id,
                    existing.state.name()
                )));
            }
        }
        records.insert(record.id.clone(), record);
        self.persist(&records)
    }

    pub fn get(&self, id: &str) -> Option<DocumentRecord> {
        self.lock().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    /// All records, oldest upload first.
    pub fn list(&self) -> Vec<DocumentRecord> {
        let mut documents: Vec<DocumentRecord> = self.lock().values().cloned().collect();
        documents.sort_by(|a, b| a.upload_time.cmp(&b.upload_time).then_with(|| a.id.cmp(&b.id)));
        documents
    }

    pub fn listing(&self) -> DocumentListing {
        let documents = self.list();
        let last_updated: Option<DateTime<Utc>> = documents.iter().map(|d| d.upload_time).max();
        DocumentListing {
            documents,
            last_updated,
        }
    }

    /// Apply `f` to a copy of the record and store it only if `f` succeeds.
    pub fn update<F>(&self, id: &str, f: F) -> Result<DocumentRecord>
    where
        F: FnOnce(&mut DocumentRecord) -> Result<()>,
    {
        let mut records = self.lock();
        let mut record = records
            .get(id)
            .cloned()
            .ok_or_else(|| RagError::UnknownDocument(id.to_string()))?;
        f(&mut record)?;
        records.insert(id.to_string(), record.clone());
        self.persist(&records)?;
        Ok(record)
    }

    /// Move a document to `next`.
    pub fn advance(&self, id: &str, next: DocumentState) -> Result<DocumentRecord> {
        let record = self.update(id, |r| r.advance(next))?;
        debug!(id, state = record.state.name(), progress = record.progress, "status updated");
        Ok(record)
    }

    pub fn remove(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let mut records = self.lock();
        let removed = records.remove(id);
        if removed.is_some() {
            self.persist(&records)?;
        }
        Ok(removed)
    }

    pub fn clear(&self) -> Result<()> {
        let mut records = self.lock();
        records.clear();
        self.persist(&records)
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, DocumentRecord>> {
        // Mutations go through a clone, so a poisoned map is still consistent.
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn persist(&self, records: &BTreeMap<String, DocumentRecord>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RagError::io(e, format!("creating {}", parent.display())))?;
        }
        let json = serde_json::to_vec_pretty(records)
            .map_err(|e| RagError::json(e, "encoding status records"))?;
        let mut tmp = self.path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        std::fs::write(&tmp, json)
            .map_err(|e| RagError::io(e, format!("writing {}", tmp.display())))?;
        std::fs::rename(&tmp, &self.path)
            .map_err(|e| RagError::io(e, format!("replacing {}", self.path.display())))
    }
}
