//! Durable embedding store
//!
//! Content-addressed cache of the (N, D) embedding matrix, keyed by
//! (corpus-id, model-id). The matrix persists as a single binary blob with
//! an `EMB1` header and loads memory-mapped; a blake3 sidecar guards
//! against torn or corrupted files. Builds write to a temp file and rename
//! into place, so a failed build never leaves a partial blob.
//!
//! Blob layout (little-endian): `EMB1` magic, version u32, n u64, d u32,
//! dtype u8 (1 = f32), padding up to a 32-byte header, then n·d f32 values.
//! The padding keeps the payload 4-byte aligned under mmap.

use std::io::Write;
use std::path::{Path, PathBuf};

use indicatif::ProgressBar;
use ndarray::ArrayView2;
use rayon::prelude::*;
use thiserror::Error;

use crate::embedder::{Embedder, EmbedderError, Embedding};
use crate::CancelToken;

const MAGIC: &[u8; 4] = b"EMB1";
const VERSION: u32 = 1;
const DTYPE_F32: u8 = 1;
const HEADER_LEN: usize = 32;

/// Tolerance for the unit-norm check on load.
const NORM_TOLERANCE: f32 = 1e-4;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt embeddings blob {path}: {reason}")]
    CorruptEmbeddings { path: String, reason: String },
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        file: String,
        expected: String,
        actual: String,
    },
    #[error(transparent)]
    Embedder(#[from] EmbedderError),
    #[error("embedder returned {actual} values where {expected} were expected")]
    EmbedderShape { expected: usize, actual: usize },
    #[error("embedding build cancelled")]
    Cancelled,
}

/// Options controlling a matrix build.
#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Texts per embedder call. Clamped to 256..=1024.
    pub chunk_size: usize,
    /// Suppress the progress bar.
    pub quiet: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            chunk_size: 512,
            quiet: false,
        }
    }
}

impl BuildOptions {
    fn effective_chunk_size(&self) -> usize {
        self.chunk_size.clamp(256, 1024)
    }
}

/// Read-only (N, D) embedding matrix, mmap- or heap-backed.
///
/// Row i is the embedding of doc-id i. Handed out by value from the store
/// and shared via `Arc` between the index and the runner.
pub struct EmbeddingMatrix {
    backing: Backing,
    n: usize,
    d: usize,
}

enum Backing {
    Mapped(memmap2::Mmap),
    Owned(Vec<f32>),
}

impl EmbeddingMatrix {
    /// Build an in-memory matrix from embedder output rows.
    ///
    /// Used for query matrices that are not worth persisting.
    pub fn from_rows(rows: Vec<Embedding>, d: usize) -> Result<Self, StoreError> {
        let mut data = Vec::with_capacity(rows.len() * d);
        let n = rows.len();
        for row in rows {
            if row.len() != d {
                return Err(StoreError::EmbedderShape {
                    expected: d,
                    actual: row.len(),
                });
            }
            data.extend_from_slice(row.as_slice());
        }
        Ok(Self {
            backing: Backing::Owned(data),
            n,
            d,
        })
    }

    pub fn n(&self) -> usize {
        self.n
    }

    pub fn d(&self) -> usize {
        self.d
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    fn floats(&self) -> &[f32] {
        match &self.backing {
            // Offset 32 into a page-aligned map is 4-byte aligned and the
            // payload length was validated at load.
            Backing::Mapped(map) => bytemuck::cast_slice(&map[HEADER_LEN..]),
            Backing::Owned(data) => data,
        }
    }

    /// Embedding of doc-id `i`. Panics if `i >= n`.
    pub fn row(&self, i: usize) -> &[f32] {
        &self.floats()[i * self.d..(i + 1) * self.d]
    }

    /// The full matrix as an (N, D) view.
    pub fn view(&self) -> ArrayView2<'_, f32> {
        ArrayView2::from_shape((self.n, self.d), self.floats())
            .expect("matrix length validated against (n, d) at construction")
    }
}

/// Cache of persisted embedding matrices under one directory.
pub struct EmbeddingStore {
    dir: PathBuf,
}

impl EmbeddingStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    /// Blob path for a (corpus-id, model-id) key.
    pub fn blob_path(&self, corpus_id: &str, model_id: &str) -> PathBuf {
        self.dir
            .join(format!("{}--{}.emb", sanitize(corpus_id), sanitize(model_id)))
    }

    /// Return the cached matrix for the key, building and persisting it if
    /// absent. A cached blob whose shape disagrees with `texts` (the corpus
    /// changed under the same id) is rebuilt; a blob that fails integrity
    /// checks is an error.
    pub fn get_or_build(
        &self,
        corpus_id: &str,
        model_id: &str,
        texts: &[&str],
        embedder: &dyn Embedder,
        opts: &BuildOptions,
        cancel: &CancelToken,
    ) -> Result<EmbeddingMatrix, StoreError> {
        let path = self.blob_path(corpus_id, model_id);
        if path.exists() {
            let matrix = self.load(&path)?;
            if matrix.n() == texts.len() && matrix.d() == embedder.dim() {
                tracing::info!(
                    path = %path.display(),
                    n = matrix.n(),
                    d = matrix.d(),
                    "Loaded embedding matrix"
                );
                return Ok(matrix);
            }
            tracing::warn!(
                path = %path.display(),
                stored_n = matrix.n(),
                stored_d = matrix.d(),
                texts = texts.len(),
                model_d = embedder.dim(),
                "Embedding blob shape disagrees with inputs, rebuilding"
            );
        }
        self.build(&path, texts, embedder, opts, cancel)?;
        self.load(&path)
    }

    /// Load a persisted blob, verifying header, checksum, and row norms.
    pub fn load(&self, path: &Path) -> Result<EmbeddingMatrix, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptEmbeddings {
            path: path.display().to_string(),
            reason,
        };

        let file = std::fs::File::open(path)?;
        // SAFETY: the blob is treated as immutable for the lifetime of the
        // map; writers go through the atomic temp-then-rename path and never
        // touch a published file in place.
        let map = unsafe { memmap2::Mmap::map(&file)? };

        if map.len() < HEADER_LEN {
            return Err(corrupt(format!("file too short ({} bytes)", map.len())));
        }
        if &map[0..4] != MAGIC {
            return Err(corrupt("bad magic".into()));
        }
        let version = u32::from_le_bytes(map[4..8].try_into().expect("4-byte slice"));
        if version != VERSION {
            return Err(corrupt(format!("unsupported version {}", version)));
        }
        let n = u64::from_le_bytes(map[8..16].try_into().expect("8-byte slice"));
        let d = u32::from_le_bytes(map[16..20].try_into().expect("4-byte slice"));
        let dtype = map[20];
        if dtype != DTYPE_F32 {
            return Err(corrupt(format!("unsupported dtype {}", dtype)));
        }

        let expected = n
            .checked_mul(d as u64)
            .and_then(|cells| cells.checked_mul(4))
            .and_then(|bytes| bytes.checked_add(HEADER_LEN as u64))
            .ok_or_else(|| corrupt("shape overflows".into()))?;
        if map.len() as u64 != expected {
            return Err(corrupt(format!(
                "expected {} bytes for ({}, {}) f32, found {}",
                expected,
                n,
                d,
                map.len()
            )));
        }

        verify_checksum(path, &map)?;

        let matrix = EmbeddingMatrix {
            backing: Backing::Mapped(map),
            n: n as usize,
            d: d as usize,
        };

        // Every row must be unit-norm within tolerance; anything else means
        // the blob does not hold what the embedder contract promises.
        if matrix.d > 0 {
            let bad = (0..matrix.n).into_par_iter().find_first(|&i| {
                let norm = matrix.row(i).iter().map(|x| x * x).sum::<f32>().sqrt();
                (norm - 1.0).abs() > NORM_TOLERANCE
            });
            if let Some(i) = bad {
                let norm = matrix.row(i).iter().map(|x| x * x).sum::<f32>().sqrt();
                return Err(corrupt(format!("row {} has L2 norm {}", i, norm)));
            }
        }

        Ok(matrix)
    }

    /// Embed `texts` in chunks and atomically persist the matrix.
    fn build(
        &self,
        path: &Path,
        texts: &[&str],
        embedder: &dyn Embedder,
        opts: &BuildOptions,
        cancel: &CancelToken,
    ) -> Result<(), StoreError> {
        let _span = tracing::info_span!("embed_build", texts = texts.len()).entered();
        let d = embedder.dim();
        let chunk_size = opts.effective_chunk_size();

        tracing::info!(
            model = embedder.model_id(),
            texts = texts.len(),
            d,
            chunk_size,
            "Building embedding matrix"
        );

        let pb = if opts.quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(texts.len() as u64)
        };

        let mut data: Vec<f32> = Vec::with_capacity(texts.len() * d);
        for chunk in texts.chunks(chunk_size) {
            if cancel.is_cancelled() {
                return Err(StoreError::Cancelled);
            }
            let rows = embedder.embed(chunk)?;
            if rows.len() != chunk.len() {
                return Err(StoreError::EmbedderShape {
                    expected: chunk.len(),
                    actual: rows.len(),
                });
            }
            for row in &rows {
                if row.len() != d {
                    return Err(StoreError::EmbedderShape {
                        expected: d,
                        actual: row.len(),
                    });
                }
                data.extend_from_slice(row.as_slice());
            }
            pb.inc(chunk.len() as u64);
        }
        pb.finish_and_clear();

        let mut header = [0u8; HEADER_LEN];
        header[0..4].copy_from_slice(MAGIC);
        header[4..8].copy_from_slice(&VERSION.to_le_bytes());
        header[8..16].copy_from_slice(&(texts.len() as u64).to_le_bytes());
        header[16..20].copy_from_slice(&(d as u32).to_le_bytes());
        header[20] = DTYPE_F32;

        let payload: &[u8] = bytemuck::cast_slice(&data);

        let mut hasher = blake3::Hasher::new();
        hasher.update(&header);
        hasher.update(payload);
        let checksum = hasher.finalize().to_hex().to_string();

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(&header)?;
        tmp.write_all(payload)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| StoreError::Io(e.error))?;

        std::fs::write(checksum_path(path), &checksum)?;

        tracing::info!(
            path = %path.display(),
            n = texts.len(),
            d,
            "Embedding matrix persisted"
        );
        Ok(())
    }
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".checksum");
    PathBuf::from(name)
}

/// Verify the blake3 sidecar. Missing sidecar is a warning, not an error
/// (pre-existing blobs from older layouts stay loadable).
fn verify_checksum(path: &Path, bytes: &[u8]) -> Result<(), StoreError> {
    let sidecar = checksum_path(path);
    let expected = match std::fs::read_to_string(&sidecar) {
        Ok(s) => s.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "No checksum sidecar for embeddings blob");
            return Ok(());
        }
        Err(e) => return Err(StoreError::Io(e)),
    };
    let actual = blake3::hash(bytes).to_hex().to_string();
    if actual != expected {
        return Err(StoreError::ChecksumMismatch {
            file: path.display().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Keep blob names filesystem-safe; ids like `BAAI/bge-large-en-v1.5` are
/// common.
pub(crate) fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
