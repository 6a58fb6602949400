//! Index persistence (save/load)
//!
//! Little-endian blob: `HNSW` magic, version u32, n u64, d u32, m u32,
//! lmax u32, entry u64, padding up to a 40-byte header; then the per-node
//! top-layer array (n × u32); then for each layer 0..=lmax a neighbor
//! count u64, a dense offset array ((n+1) × u64), and the neighbor words
//! (u32 each). A blake3 sidecar (`<blob>.checksum`) detects accidental
//! corruption; writes go through a temp file and rename so a failed save
//! never publishes a partial blob.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::store::EmbeddingMatrix;
use crate::CancelToken;

use super::{HnswError, HnswIndex, HnswParams, LayerCsr, MAX_LEVEL};

const MAGIC: &[u8; 4] = b"HNSW";
const VERSION: u32 = 1;
const HEADER_LEN: usize = 40;

impl HnswIndex {
    /// Atomically persist the graph (not the vectors; those live in the
    /// embedding store) and write the checksum sidecar.
    pub fn save(&self, path: &Path) -> Result<(), HnswError> {
        let dir = path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let n = self.len() as u64;
        let mut buf: Vec<u8> = Vec::with_capacity(HEADER_LEN + self.len() * 4);
        buf.extend_from_slice(MAGIC);
        buf.extend_from_slice(&VERSION.to_le_bytes());
        buf.extend_from_slice(&n.to_le_bytes());
        buf.extend_from_slice(&(self.dim() as u32).to_le_bytes());
        buf.extend_from_slice(&(self.params.m as u32).to_le_bytes());
        buf.extend_from_slice(&self.max_layer().to_le_bytes());
        buf.extend_from_slice(&(self.entry as u64).to_le_bytes());
        buf.resize(HEADER_LEN, 0);

        for &layer in &self.node_layers {
            buf.extend_from_slice(&layer.to_le_bytes());
        }
        for csr in &self.layers {
            buf.extend_from_slice(&(csr.neighbors.len() as u64).to_le_bytes());
            for &offset in &csr.offsets {
                buf.extend_from_slice(&offset.to_le_bytes());
            }
            for &nb in &csr.neighbors {
                buf.extend_from_slice(&nb.to_le_bytes());
            }
        }

        let checksum = blake3::hash(&buf).to_hex().to_string();

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(&buf)?;
        tmp.flush()?;
        tmp.persist(path).map_err(|e| HnswError::Io(e.error))?;
        std::fs::write(checksum_path(path), &checksum)?;

        tracing::info!(
            path = %path.display(),
            n = self.len(),
            max_layer = self.max_layer(),
            "HNSW index persisted"
        );
        Ok(())
    }

    /// Load a persisted graph over the matrix it was built from.
    ///
    /// Structural damage reports as [`HnswError::IndexCorrupt`] (or
    /// [`HnswError::ChecksumMismatch`]); a blob that is internally
    /// consistent but disagrees with the matrix shape or requested `m`
    /// reports as [`HnswError::Stale`] so callers can rebuild.
    pub fn load(
        path: &Path,
        vectors: Arc<EmbeddingMatrix>,
        params: &HnswParams,
    ) -> Result<Self, HnswError> {
        if !path.exists() {
            return Err(HnswError::NotFound(path.display().to_string()));
        }
        verify_checksum(path)?;

        let bytes = std::fs::read(path)?;
        let mut r = Reader {
            buf: &bytes,
            pos: 0,
            path,
        };

        let magic = r.take(4)?;
        if magic != MAGIC {
            return Err(r.corrupt("bad magic"));
        }
        let version = r.u32()?;
        if version != VERSION {
            return Err(r.corrupt(&format!("unsupported version {}", version)));
        }
        let n = r.u64()? as usize;
        let d = r.u32()? as usize;
        let m = r.u32()? as usize;
        let lmax = r.u32()?;
        let entry = r.u64()?;
        r.take(HEADER_LEN - r.pos)?;

        if lmax > MAX_LEVEL {
            return Err(r.corrupt(&format!("implausible max layer {}", lmax)));
        }
        if n != vectors.n() || d != vectors.d() {
            return Err(HnswError::Stale {
                path: path.display().to_string(),
                reason: format!(
                    "blob shape ({}, {}) vs matrix ({}, {})",
                    n,
                    d,
                    vectors.n(),
                    vectors.d()
                ),
            });
        }
        if m != params.m {
            return Err(HnswError::Stale {
                path: path.display().to_string(),
                reason: format!("blob m={} vs requested m={}", m, params.m),
            });
        }
        if n > 0 && entry as usize >= n {
            return Err(r.corrupt(&format!("entry point {} out of range", entry)));
        }

        let mut node_layers = Vec::with_capacity(n);
        for _ in 0..n {
            let layer = r.u32()?;
            if layer > lmax {
                return Err(r.corrupt(&format!("node layer {} above max {}", layer, lmax)));
            }
            node_layers.push(layer);
        }
        if n > 0 && node_layers[entry as usize] != lmax {
            return Err(r.corrupt("entry point does not hold the maximum layer"));
        }

        let mut layers = Vec::with_capacity(lmax as usize + 1);
        for _ in 0..=lmax {
            let neighbor_len = r.u64()? as usize;
            let mut offsets = Vec::with_capacity(n + 2);
            for _ in 0..=n {
                offsets.push(r.u64()?);
            }
            if offsets[0] != 0 || offsets[n] as usize != neighbor_len {
                return Err(r.corrupt("offset array does not span the neighbor array"));
            }
            if offsets.windows(2).any(|w| w[0] > w[1]) {
                return Err(r.corrupt("offsets are not monotone"));
            }
            let mut neighbors = Vec::with_capacity(neighbor_len);
            for _ in 0..neighbor_len {
                let nb = r.u32()?;
                // Rejects the 0xFFFFFFFF empty-slot sentinel along with any
                // other out-of-range word.
                if nb as usize >= n {
                    return Err(r.corrupt(&format!("neighbor id {} out of range", nb)));
                }
                neighbors.push(nb);
            }
            layers.push(LayerCsr { offsets, neighbors });
        }
        if r.pos != bytes.len() {
            return Err(r.corrupt("trailing bytes after graph data"));
        }

        tracing::info!(path = %path.display(), n, max_layer = lmax, "HNSW index loaded");
        Ok(HnswIndex {
            params: HnswParams {
                m,
                ef_construction: params.ef_construction,
                seed: params.seed,
            },
            vectors,
            node_layers,
            layers,
            entry: entry as u32,
        })
    }

    pub fn exists(path: &Path) -> bool {
        path.exists()
    }
}

/// Load the index at `path` if it matches the matrix and parameters,
/// otherwise build and persist a fresh one. Corruption is an error, not a
/// rebuild trigger.
pub fn open_or_build(
    path: &Path,
    vectors: Arc<EmbeddingMatrix>,
    params: &HnswParams,
    cancel: &CancelToken,
) -> Result<HnswIndex, HnswError> {
    match HnswIndex::load(path, Arc::clone(&vectors), params) {
        Ok(index) => return Ok(index),
        Err(HnswError::NotFound(_)) => {
            tracing::info!(path = %path.display(), "No index blob, building");
        }
        Err(HnswError::Stale { reason, .. }) => {
            tracing::warn!(path = %path.display(), reason, "Index blob is stale, rebuilding");
        }
        Err(e) => return Err(e),
    }

    let index = HnswIndex::build_with_cancel(vectors, params.clone(), cancel)?;
    index.save(path)?;
    Ok(index)
}

fn checksum_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".checksum");
    PathBuf::from(name)
}

/// Verify the blake3 sidecar; missing sidecar warns and continues.
fn verify_checksum(path: &Path) -> Result<(), HnswError> {
    let sidecar = checksum_path(path);
    let expected = match std::fs::read_to_string(&sidecar) {
        Ok(s) => s.trim().to_string(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(path = %path.display(), "No checksum sidecar for index blob");
            return Ok(());
        }
        Err(e) => return Err(HnswError::Io(e)),
    };

    let file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    std::io::copy(&mut std::io::BufReader::new(file), &mut hasher)?;
    let actual = hasher.finalize().to_hex().to_string();
    if actual != expected {
        return Err(HnswError::ChecksumMismatch {
            file: path.display().to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Bounds-checked little-endian reads over the blob.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> Reader<'a> {
    fn corrupt(&self, reason: &str) -> HnswError {
        HnswError::IndexCorrupt {
            path: self.path.display().to_string(),
            reason: reason.to_string(),
        }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], HnswError> {
        if self.pos + len > self.buf.len() {
            return Err(self.corrupt("truncated"));
        }
        let out = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, HnswError> {
        let bytes = self.take(4)?;
        Ok(u32::from_le_bytes(bytes.try_into().expect("4-byte slice")))
    }

    fn u64(&mut self) -> Result<u64, HnswError> {
        let bytes = self.take(8)?;
        Ok(u64::from_le_bytes(bytes.try_into().expect("8-byte slice")))
    }
}
