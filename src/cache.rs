//! Persistent `(strain, gene index) -> vector` cache.
//!
//! Backends report failures as `CacheError`; the loader treats every error as
//! a miss, so nothing here may block or fail a load.

use crate::error::CacheError;
use log::debug;
use rustc_hash::FxHashMap;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const MAGIC: &[u8; 4] = b"UMLV";
const CHECKSUM_LEN: usize = 32;
const ENTRY_EXT: &str = "vec";

/// Blocking key-value store for expression vectors.
pub trait ExpressionCache: Send + Sync + 'static {
    fn get(&self, strain: &str, gene: usize) -> Result<Option<Vec<f32>>, CacheError>;
    fn put(&self, strain: &str, gene: usize, values: &[f32]) -> Result<(), CacheError>;
    fn clear(&self) -> Result<(), CacheError>;
    fn count(&self) -> Result<usize, CacheError>;
}

fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Directory name for a strain: strain names are arbitrary text, so they are
/// hashed rather than used as path components.
fn strain_dir(strain: &str) -> String {
    sha256(strain.as_bytes())[..8]
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

fn encode_entry(values: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(8 + values.len() * 4 + CHECKSUM_LEN);
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&(values.len() as u32).to_le_bytes());
    for v in values {
        out.extend_from_slice(&v.to_le_bytes());
    }
    let checksum = sha256(&out);
    out.extend_from_slice(&checksum);
    out
}

fn decode_entry(bytes: &[u8]) -> Result<Vec<f32>, CacheError> {
    if bytes.len() < 8 + CHECKSUM_LEN || &bytes[..4] != MAGIC {
        return Err(CacheError::Corrupt("bad header".to_string()));
    }
    let (body, checksum) = bytes.split_at(bytes.len() - CHECKSUM_LEN);
    if sha256(body).as_slice() != checksum {
        return Err(CacheError::Corrupt("checksum mismatch".to_string()));
    }
    let count = u32::from_le_bytes([body[4], body[5], body[6], body[7]]) as usize;
    let payload = &body[8..];
    if payload.len() != count * 4 {
        return Err(CacheError::Corrupt(format!(
            "{} bytes for {} values",
            payload.len(),
            count
        )));
    }
    Ok(payload
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// One checksummed file per entry under
/// `{root}/{hash(strain)}/{gene}.vec`.
pub struct DiskCache {
    root: PathBuf,
    tmp_counter: AtomicU64,
}

impl DiskCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        DiskCache {
            root: root.into(),
            tmp_counter: AtomicU64::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, strain: &str, gene: usize) -> PathBuf {
        self.root
            .join(strain_dir(strain))
            .join(format!("{}.{}", gene, ENTRY_EXT))
    }
}

impl ExpressionCache for DiskCache {
    fn get(&self, strain: &str, gene: usize) -> Result<Option<Vec<f32>>, CacheError> {
        let path = self.entry_path(strain, gene);
        match fs::read(&path) {
            Ok(bytes) => decode_entry(&bytes).map(Some),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put(&self, strain: &str, gene: usize, values: &[f32]) -> Result<(), CacheError> {
        let path = self.entry_path(strain, gene);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Write under a unique name and rename so readers never see a torn entry.
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let tmp = path.with_extension(format!("tmp{}-{}", std::process::id(), n));
        fs::write(&tmp, encode_entry(values))?;
        if let Err(e) = fs::rename(&tmp, &path) {
            let _ = fs::remove_file(&tmp);
            return Err(e.into());
        }
        debug!("cached {} gene {} at {}", strain, gene, path.display());
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn count(&self) -> Result<usize, CacheError> {
        let strains = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e.into()),
        };
        let mut total = 0;
        for strain in strains {
            let strain = strain?;
            if !strain.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(strain.path())? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) == Some(ENTRY_EXT) {
                    total += 1;
                }
            }
        }
        Ok(total)
    }
}

/// Process-local cache, for tests and for runs without a cache directory.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<FxHashMap<(String, usize), Vec<f32>>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, FxHashMap<(String, usize), Vec<f32>>>, CacheError> {
        self.entries
            .lock()
            .map_err(|_| CacheError::Task("memory cache lock poisoned".to_string()))
    }
}

impl ExpressionCache for MemoryCache {
    fn get(&self, strain: &str, gene: usize) -> Result<Option<Vec<f32>>, CacheError> {
        Ok(self.lock()?.get(&(strain.to_string(), gene)).cloned())
    }

    fn put(&self, strain: &str, gene: usize, values: &[f32]) -> Result<(), CacheError> {
        self.lock()?.insert((strain.to_string(), gene), values.to_vec());
        Ok(())
    }

    fn clear(&self) -> Result<(), CacheError> {
        self.lock()?.clear();
        Ok(())
    }

    fn count(&self) -> Result<usize, CacheError> {
        Ok(self.lock()?.len())
    }
}
