//! MD5 checksums and the on-disk checksum cache.

use crate::error::{Result, UploadError};
use crate::progress;
use base64::Engine;
use chrono::{DateTime, SecondsFormat, Utc};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Files larger than this get a progress bar while hashing.
const PROGRESS_MIN_SIZE: u64 = 64 * 1024 * 1024;

/// Computes the raw MD5 digest of a local file.
///
/// This function reads the file in chunks to avoid loading large files
/// entirely into memory. It runs in a blocking task to avoid blocking
/// the async runtime.
async fn compute_digest(path: &Path, pb: indicatif::ProgressBar) -> Result<[u8; 16]> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || {
        use std::io::Read;

        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
            pb.inc(n as u64);
        }
        pb.finish_and_clear();

        let mut digest = [0u8; 16];
        digest.copy_from_slice(&hasher.finalize());
        Ok::<[u8; 16], UploadError>(digest)
    })
    .await
    .map_err(|e| UploadError::IoError(std::io::Error::other(format!("Task join error: {}", e))))?
}

/// Computes the MD5 hash of a local file as lowercase hex.
pub async fn compute_file_md5(path: &Path) -> Result<String> {
    let size = tokio::fs::metadata(path).await?.len();
    let pb = if size >= PROGRESS_MIN_SIZE {
        progress::bytes_bar(size, format!("Calculating md5 of {}", display_name(path)))
    } else {
        indicatif::ProgressBar::hidden()
    };
    let digest = compute_digest(path, pb).await?;
    Ok(hex_string(&digest))
}

/// MD5 of an in-memory buffer in the base64 form used by `Content-MD5`.
pub fn md5_base64(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(Md5::digest(data))
}

/// MD5 of an in-memory buffer as lowercase hex.
pub fn md5_hex(data: &[u8]) -> String {
    hex_string(&Md5::digest(data))
}

fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

fn display_name(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| path.display().to_string())
}

/// Cache row as stored on disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct CacheRow {
    path: String,
    size: u64,
    md5: String,
    modified_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CacheEntry {
    size: u64,
    md5: String,
    modified_at: String,
}

/// Persists checksums keyed by `(path, size, modified_at)`.
///
/// An entry is only reused when all three key fields match the file on disk;
/// otherwise the checksum is recomputed and the entry replaced.
#[derive(Debug)]
pub struct ChecksumCache {
    file: PathBuf,
    entries: HashMap<String, CacheEntry>,
    hits: usize,
    misses: usize,
}

impl ChecksumCache {
    /// Loads the cache file; a missing or unreadable file yields an empty cache.
    pub fn load(file: impl Into<PathBuf>) -> Self {
        let file = file.into();
        let mut cache = Self {
            file,
            entries: HashMap::new(),
            hits: 0,
            misses: 0,
        };
        if !cache.file.exists() {
            return cache;
        }
        match cache.read_rows() {
            Ok(rows) => {
                for row in rows {
                    cache.entries.insert(
                        row.path,
                        CacheEntry {
                            size: row.size,
                            md5: row.md5,
                            modified_at: row.modified_at,
                        },
                    );
                }
                debug!(
                    "Loaded {} checksum(s) from {}",
                    cache.entries.len(),
                    cache.file.display()
                );
            }
            Err(e) => {
                warn!(
                    "⚠️  Ignoring unreadable checksum cache {}: {}",
                    cache.file.display(),
                    e
                );
            }
        }
        cache
    }

    fn read_rows(&self) -> Result<Vec<CacheRow>> {
        let mut reader = csv::Reader::from_path(&self.file)?;
        let rows = reader
            .deserialize::<CacheRow>()
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Returns the MD5 of `path`, computing it only when no matching entry exists.
    pub async fn checksum(&mut self, path: &Path) -> Result<String> {
        let metadata = tokio::fs::metadata(path).await?;
        let key = cache_key(path);
        let size = metadata.len();
        let modified_at = modified_stamp(&metadata)?;

        if let Some(entry) = self.entries.get(&key) {
            if entry.size == size && entry.modified_at == modified_at {
                self.hits += 1;
                debug!("Using cached md5 for {}", key);
                return Ok(entry.md5.clone());
            }
        }

        self.misses += 1;
        let md5 = compute_file_md5(path).await?;
        self.entries.insert(
            key,
            CacheEntry {
                size,
                md5: md5.clone(),
                modified_at,
            },
        );
        Ok(md5)
    }

    /// Writes every entry back to the cache file.
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.file.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let mut writer = csv::Writer::from_path(&self.file)?;
        let mut keys: Vec<&String> = self.entries.keys().collect();
        keys.sort();
        for key in keys {
            let entry = &self.entries[key];
            writer.serialize(CacheRow {
                path: key.clone(),
                size: entry.size,
                md5: entry.md5.clone(),
                modified_at: entry.modified_at.clone(),
            })?;
        }
        writer.flush()?;
        info!(
            "Saved {} checksum(s) to {}",
            self.entries.len(),
            self.file.display()
        );
        Ok(())
    }

    /// Number of checksums served from the cache.
    pub fn hits(&self) -> usize {
        self.hits
    }

    /// Number of checksums computed from file contents.
    pub fn misses(&self) -> usize {
        self.misses
    }
}

fn cache_key(path: &Path) -> String {
    std::fs::canonicalize(path)
        .unwrap_or_else(|_| path.to_path_buf())
        .display()
        .to_string()
}

fn modified_stamp(metadata: &std::fs::Metadata) -> Result<String> {
    let modified: DateTime<Utc> = metadata.modified()?.into();
    Ok(modified.to_rfc3339_opts(SecondsFormat::Nanos, true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};

    #[test]
    fn md5_of_known_input() {
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(md5_hex(b"hello world"), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn file_md5_matches_buffer_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, b"hello world").unwrap();

        assert_eq!(compute_file_md5(&path).await.unwrap(), md5_hex(b"hello world"));
        assert_eq!(md5_base64(b"hello world"), "XrY7u+Ae7tCTyyK7j1rNww==");
    }

    #[tokio::test]
    async fn cache_round_trip_reuses_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("a.txt");
        let cache_file = dir.path().join("cache").join("md5_cache.csv");
        std::fs::write(&data, b"hello world").unwrap();

        let mut cache = ChecksumCache::load(&cache_file);
        let first = cache.checksum(&data).await.unwrap();
        assert_eq!(cache.misses(), 1);
        cache.save().unwrap();

        let mut reloaded = ChecksumCache::load(&cache_file);
        let second = reloaded.checksum(&data).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(reloaded.hits(), 1);
        assert_eq!(reloaded.misses(), 0);
    }

    #[tokio::test]
    async fn touching_file_invalidates_entry() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("a.txt");
        std::fs::write(&data, b"hello world").unwrap();

        let mut cache = ChecksumCache::load(dir.path().join("cache.csv"));
        cache.checksum(&data).await.unwrap();

        let file = std::fs::File::options().write(true).open(&data).unwrap();
        file.set_modified(SystemTime::now() + Duration::from_secs(120))
            .unwrap();
        drop(file);

        cache.checksum(&data).await.unwrap();
        assert_eq!(cache.hits(), 0);
        assert_eq!(cache.misses(), 2);
    }

    #[tokio::test]
    async fn stale_entry_is_never_trusted() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("a.txt");
        std::fs::write(&data, b"hello world").unwrap();

        let mut cache = ChecksumCache::load(dir.path().join("cache.csv"));
        cache.checksum(&data).await.unwrap();

        std::fs::write(&data, b"hello world, again").unwrap();
        let md5 = cache.checksum(&data).await.unwrap();
        assert_eq!(md5, md5_hex(b"hello world, again"));
    }

    #[test]
    fn corrupt_cache_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let cache_file = dir.path().join("cache.csv");
        std::fs::write(&cache_file, "path,size,md5,modified_at\nx,not-a-number,y,z\n").unwrap();
        let cache = ChecksumCache::load(&cache_file);
        assert!(cache.entries.is_empty());
    }
}
