//! Flat, exact k-nearest-neighbor index over squared Euclidean distance.
//!
//! Vectors are stored row-major in one `Vec<f32>`; the segment at ordinal
//! `i` belongs to row `i`. There is no id column, so the two sequences must
//! always have the same length and can only grow by appending. Removing
//! anything means [`VectorIndex::reset`] followed by re-adding what should
//! remain.
//!
//! # Persistence
//!
//! Two artifacts share a path prefix and are always written and read
//! together, vectors first:
//!
//! | File | Contents |
//! |------|----------|
//! | `<prefix>.index` | `RBIX` magic, format version, dims (u32 LE), count (u64 LE), `count × dims` f32 LE |
//! | `<prefix>.meta.json` | JSON array of segments, one per row |
//!
//! A missing counterpart, an unreadable file, or a row count that differs
//! between the two is treated as corruption: the index starts empty instead
//! of attempting a partial load. A readable pair with a different
//! dimension is a configuration error.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::{RagError, Result};
use crate::models::Segment;

const MAGIC: &[u8; 4] = b"RBIX";
const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 4 + 8;

pub struct VectorIndex {
    dims: usize,
    data: Vec<f32>,
    segments: Vec<Segment>,
    index_file: PathBuf,
    metadata_file: PathBuf,
}

impl VectorIndex {
    /// An empty in-memory index that persists under `prefix`.
    pub fn new(prefix: &Path, dims: usize) -> Self {
        Self {
            dims,
            data: Vec::new(),
            segments: Vec::new(),
            index_file: with_suffix(prefix, ".index"),
            metadata_file: with_suffix(prefix, ".meta.json"),
        }
    }

    /// Load the persisted pair under `prefix`, or start empty.
    ///
    /// # Errors
    ///
    /// [`RagError::DimensionMismatch`] when a valid persisted index was built
    /// with a different dimension than `dims`.
    pub fn open(prefix: &Path, dims: usize) -> Result<Self> {
        let mut index = Self::new(prefix, dims);

        match (index.index_file.exists(), index.metadata_file.exists()) {
            (false, false) => {
                info!(dims, "initialized new empty vector index");
            }
            (true, true) => match read_pair(&index.index_file, &index.metadata_file) {
                Ok((stored_dims, data, segments)) => {
                    if stored_dims != dims {
                        return Err(RagError::DimensionMismatch {
                            expected: stored_dims,
                            actual: dims,
                        });
                    }
                    index.data = data;
                    index.segments = segments;
                    info!(size = index.len(), dims, "loaded persisted vector index");
                }
                Err(e) => warn!(error = %e, "starting with an empty vector index"),
            },
            (has_index, _) => {
                let missing = if has_index {
                    &index.metadata_file
                } else {
                    &index.index_file
                };
                let e = RagError::IndexCorruptPersisted(format!(
                    "counterpart {} is missing",
                    missing.display()
                ));
                warn!(error = %e, "starting with an empty vector index");
            }
        }

        Ok(index)
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Append rows. Either every row is appended or none is.
    pub fn append(&mut self, vectors: Vec<Vec<f32>>, segments: Vec<Segment>) -> Result<usize> {
        if vectors.len() != segments.len() {
            return Err(RagError::IndexCorruptPersisted(format!(
                "refusing to append {} vectors with {} segments",
                vectors.len(),
                segments.len()
            )));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != self.dims) {
            return Err(RagError::DimensionMismatch {
                expected: self.dims,
                actual: bad.len(),
            });
        }

        let added = vectors.len();
        self.data.reserve(added * self.dims);
        for v in vectors {
            self.data.extend_from_slice(&v);
        }
        self.segments.extend(segments);
        Ok(added)
    }

    /// Up to `k` rows nearest to `query`, by ascending squared distance.
    ///
    /// Ties keep insertion order.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<(Segment, f32)>> {
        if query.len() != self.dims {
            return Err(RagError::DimensionMismatch {
                expected: self.dims,
                actual: query.len(),
            });
        }
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }

        let mut scored: Vec<(usize, f32)> = self
            .data
            .chunks_exact(self.dims)
            .map(|row| squared_l2(query, row))
            .enumerate()
            .collect();

        let by_distance = |a: &(usize, f32), b: &(usize, f32)| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0));
        if k < scored.len() {
            scored.select_nth_unstable_by(k - 1, by_distance);
            scored.truncate(k);
        }
        scored.sort_by(by_distance);

        Ok(scored
            .into_iter()
            .map(|(row, distance)| (self.segments[row].clone(), distance))
            .collect())
    }

    /// Drop every row and delete both artifacts.
    pub fn reset(&mut self) -> Result<()> {
        self.data.clear();
        self.segments.clear();
        remove_if_exists(&self.index_file)?;
        remove_if_exists(&self.metadata_file)?;
        info!(dims = self.dims, "vector index reset");
        Ok(())
    }

    /// Write the vector file, then the segment file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.index_file.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| RagError::io(e, format!("creating {}", parent.display())))?;
        }

        let mut bytes = Vec::with_capacity(HEADER_LEN + self.data.len() * 4);
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.dims as u32).to_le_bytes());
        bytes.extend_from_slice(&(self.len() as u64).to_le_bytes());
        bytes.extend_from_slice(&vec_to_blob(&self.data));
        write_atomic(&self.index_file, &bytes)?;

        let meta = serde_json::to_vec(&self.segments)
            .map_err(|e| RagError::json(e, "encoding index metadata"))?;
        write_atomic(&self.metadata_file, &meta)?;
        Ok(())
    }
}

/// Squared Euclidean distance. Slices must have equal length.
pub fn squared_l2(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| {
            let d = x - y;
            d * d
        })
        .sum()
}

/// Encode a float vector as little-endian f32 bytes.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode little-endian f32 bytes. Trailing bytes that do not form a float are ignored.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn read_pair(index_file: &Path, metadata_file: &Path) -> Result<(usize, Vec<f32>, Vec<Segment>)> {
    let corrupt = |msg: String| RagError::IndexCorruptPersisted(msg);

    let bytes = std::fs::read(index_file)
        .map_err(|e| corrupt(format!("reading {}: {}", index_file.display(), e)))?;
    if bytes.len() < HEADER_LEN || &bytes[0..4] != MAGIC {
        return Err(corrupt(format!("{} has no valid header", index_file.display())));
    }
    let version = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
    if version != FORMAT_VERSION {
        return Err(corrupt(format!("unsupported index format version {}", version)));
    }
    let dims = u32::from_le_bytes([bytes[8], bytes[9], bytes[10], bytes[11]]) as usize;
    let mut count_bytes = [0u8; 8];
    count_bytes.copy_from_slice(&bytes[12..20]);
    let count = u64::from_le_bytes(count_bytes);

    let body = &bytes[HEADER_LEN..];
    let expected = usize::try_from(count)
        .ok()
        .and_then(|n| n.checked_mul(dims))
        .and_then(|n| n.checked_mul(4));
    if dims == 0 || expected != Some(body.len()) {
        return Err(corrupt(format!(
            "{} declares {} rows of {} dims but holds {} bytes",
            index_file.display(),
            count,
            dims,
            body.len()
        )));
    }

    let meta = std::fs::read(metadata_file)
        .map_err(|e| corrupt(format!("reading {}: {}", metadata_file.display(), e)))?;
    let segments: Vec<Segment> = serde_json::from_slice(&meta)
        .map_err(|e| corrupt(format!("parsing {}: {}", metadata_file.display(), e)))?;
    if segments.len() as u64 != count {
        return Err(corrupt(format!(
            "index holds {} vectors but metadata holds {} segments",
            count,
            segments.len()
        )));
    }

    Ok((dims, blob_to_vec(body), segments))
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut name = prefix.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = with_suffix(path, ".tmp");
    std::fs::write(&tmp, bytes).map_err(|e| RagError::io(e, format!("writing {}", tmp.display())))?;
    std::fs::rename(&tmp, path).map_err(|e| RagError::io(e, format!("replacing {}", path.display())))
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(RagError::io(e, format!("removing {}", path.display()))),
    }
}
