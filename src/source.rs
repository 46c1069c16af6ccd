//! Locations that data files and manifests are read from.

use crate::error::{Result, UploadError};
use crate::storage::{ObjectStore, StoreError};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

const BUCKET_SCHEME: &str = "s3://";

/// An `s3://bucket/key` address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BucketLocation {
    pub bucket: String,
    /// Object key or key prefix, without a leading slash.
    pub key: String,
}

impl BucketLocation {
    pub fn is_bucket_url(s: &str) -> bool {
        s.starts_with(BUCKET_SCHEME)
    }

    pub fn parse(url: &str) -> std::result::Result<Self, String> {
        let rest = url
            .strip_prefix(BUCKET_SCHEME)
            .ok_or_else(|| format!("\"{}\" is not an s3:// URL", url))?;
        let (bucket, key) = rest.split_once('/').unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(format!("\"{}\" has no bucket name", url));
        }
        Ok(Self {
            bucket: bucket.to_string(),
            key: key.trim_start_matches('/').to_string(),
        })
    }

    /// Last path segment of the key.
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }

    /// Prefix of the key's "directory", ending in `/` unless empty.
    pub fn parent_prefix(&self) -> String {
        match self.key.rsplit_once('/') {
            Some((parent, _)) => format!("{}/", parent),
            None => String::new(),
        }
    }

    /// Key of `name` under this location treated as a prefix.
    pub fn join(&self, name: &str) -> String {
        let prefix = self.key.trim_end_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }
}

impl fmt::Display for BucketLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}/{}", BUCKET_SCHEME, self.bucket, self.key)
    }
}

/// Where the data files live, as configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataLocation {
    Local(PathBuf),
    Bucket(BucketLocation),
}

impl DataLocation {
    pub fn parse(s: &str) -> std::result::Result<Self, String> {
        let s = s.trim();
        if BucketLocation::is_bucket_url(s) {
            Ok(DataLocation::Bucket(BucketLocation::parse(s)?))
        } else {
            Ok(DataLocation::Local(PathBuf::from(s)))
        }
    }
}

/// Data files resolved against their location.
///
/// Chosen once from the configuration; validation only uses
/// [`size`](Self::size) and [`fetch`](Self::fetch).
pub enum FileSource {
    Local {
        root: PathBuf,
    },
    RemoteBucket {
        store: Arc<dyn ObjectStore>,
        location: BucketLocation,
        download_dir: PathBuf,
    },
}

impl fmt::Debug for FileSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileSource::Local { root } => f.debug_struct("Local").field("root", root).finish(),
            FileSource::RemoteBucket { location, .. } => f
                .debug_struct("RemoteBucket")
                .field("location", &location.to_string())
                .finish(),
        }
    }
}

impl FileSource {
    pub fn local(root: impl Into<PathBuf>) -> Self {
        FileSource::Local { root: root.into() }
    }

    /// Human-readable location of `name`.
    pub fn describe(&self, name: &str) -> String {
        match self {
            FileSource::Local { root } => root.join(name).display().to_string(),
            FileSource::RemoteBucket { location, .. } => {
                format!("{}{}/{}", BUCKET_SCHEME, location.bucket, location.join(name))
            }
        }
    }

    /// Size of `name`, `None` when it does not exist.
    pub async fn size(&self, name: &str) -> Result<Option<u64>> {
        match self {
            FileSource::Local { root } => match tokio::fs::metadata(root.join(name)).await {
                Ok(m) if m.is_file() => Ok(Some(m.len())),
                Ok(_) => Ok(None),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
                Err(e) => Err(e.into()),
            },
            FileSource::RemoteBucket { store, location, .. } => {
                Ok(store.head(&location.join(name)).await?)
            }
        }
    }

    /// A local path holding the bytes of `name`, downloading it first if needed.
    pub async fn fetch(&self, name: &str) -> Result<PathBuf> {
        match self {
            FileSource::Local { root } => Ok(root.join(name)),
            FileSource::RemoteBucket {
                store,
                location,
                download_dir,
            } => {
                let key = location.join(name);
                let dest = download_dir.join(flatten(name));
                info!("⬇️  Downloading {} for validation", self.describe(name));
                match store.download(&key, &dest).await {
                    Ok(_) => Ok(dest),
                    Err(StoreError::NotFound(_)) => Err(UploadError::IoError(std::io::Error::new(
                        std::io::ErrorKind::NotFound,
                        format!("{} does not exist", self.describe(name)),
                    ))),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }
}

fn flatten(name: &str) -> String {
    name.replace(['/', '\\'], "_")
}
