//! Data structures shared by the validation and upload stages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// One manifest entry and its upload disposition.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileRecord {
    /// File name as written in the manifest (trimmed).
    pub name: String,
    /// Local path of the bytes to upload.
    pub path: PathBuf,
    /// Size in bytes.
    pub size: u64,
    /// Lowercase hex MD5 digest.
    pub checksum: Option<String>,
    /// Externally supplied or backend generated identifier.
    pub identifier: Option<String>,
    /// Flattened name used in storage when `name` contains path separators.
    pub subfolder_alias: Option<String>,
    /// `None` until the record has been validated and transferred.
    pub succeeded: Option<bool>,
    /// Human-readable failure reasons, oldest first.
    pub errors: Vec<String>,
    /// An identical object already existed at the destination.
    pub skipped: bool,
}

impl FileRecord {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>, size: u64) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            size,
            ..Default::default()
        }
    }

    /// Name the object is stored and reported under.
    pub fn upload_name(&self) -> &str {
        self.subfolder_alias.as_deref().unwrap_or(&self.name)
    }

    /// Still waiting for a transfer outcome.
    pub fn is_pending(&self) -> bool {
        self.succeeded.is_none()
    }

    pub fn mark_invalid(&mut self, reason: impl Into<String>) {
        self.succeeded = Some(false);
        self.errors.push(reason.into());
    }

    pub fn mark_succeeded(&mut self, skipped: bool) {
        debug_assert!(self.is_pending(), "{} already has an outcome", self.name);
        self.succeeded = Some(true);
        self.skipped = skipped;
        self.errors.clear();
    }

    /// Marks the record failed unless it already succeeded.
    pub fn mark_failed(&mut self, reason: impl Into<String>) {
        if self.succeeded == Some(true) {
            return;
        }
        self.succeeded = Some(false);
        self.errors.push(reason.into());
    }

    /// Per-file result sent with the terminal batch update.
    pub fn to_result(&self) -> FileResult {
        FileResult {
            file_name: self.upload_name().to_string(),
            succeeded: self.succeeded.unwrap_or(false),
            errors: self.errors.clone(),
            skipped: self.skipped,
        }
    }
}

/// Per-file disposition reported to the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub file_name: String,
    pub succeeded: bool,
    pub errors: Vec<String>,
    pub skipped: bool,
}

/// Kind of files carried by a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchType {
    #[serde(rename = "data file")]
    DataFile,
    #[serde(rename = "metadata")]
    Metadata,
}

impl BatchType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchType::DataFile => "data file",
            BatchType::Metadata => "metadata",
        }
    }
}

impl fmt::Display for BatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BatchType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "data file" | "file" => Ok(BatchType::DataFile),
            "metadata" => Ok(BatchType::Metadata),
            other => Err(format!(
                "\"{}\" is not valid, use one of [\"data file\", \"metadata\"]",
                other
            )),
        }
    }
}

/// Batch status as tracked by the backend.
///
/// `Loaded` and `Rejected` are terminal and only ever set by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BatchStatus {
    New,
    Uploaded,
    #[serde(rename = "Upload Failed")]
    UploadFailed,
    Loaded,
    Rejected,
    #[serde(other)]
    Unknown,
}

/// A file as registered in a batch; the backend may assign it an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFile {
    #[serde(rename = "fileID", default)]
    pub id: Option<String>,
    #[serde(rename = "fileName")]
    pub name: String,
}

/// Remote-tracked unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Batch {
    #[serde(rename = "_id")]
    pub id: String,
    pub bucket_name: String,
    pub file_prefix: String,
    #[serde(rename = "type")]
    pub batch_type: BatchType,
    #[serde(default)]
    pub file_count: usize,
    #[serde(default)]
    pub files: Vec<BatchFile>,
    pub status: BatchStatus,
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Response of a batch update.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchUpdate {
    #[serde(rename = "_id")]
    pub id: String,
    pub status: BatchStatus,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Temporary storage credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(rename = "accessKeyId")]
    pub access_key: String,
    #[serde(rename = "secretAccessKey")]
    pub secret_key: String,
    #[serde(rename = "sessionToken")]
    pub session_token: String,
    #[serde(rename = "expiration", default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Credentials {
    /// True when the credentials stay valid for longer than `buffer`.
    ///
    /// Credentials without an expiry are trusted until storage rejects them.
    pub fn is_fresh(&self, buffer: Duration) -> bool {
        match self.expires_at {
            None => true,
            Some(expires_at) => {
                let buffer = chrono::Duration::from_std(buffer).unwrap_or(chrono::Duration::zero());
                expires_at - buffer > Utc::now()
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .field("session_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Submission-specific settings served by the backend.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FileNodeConfig {
    #[serde(default)]
    pub name_field: Option<String>,
    #[serde(default)]
    pub size_field: Option<String>,
    #[serde(default)]
    pub md5_field: Option<String>,
    #[serde(default)]
    pub id_field: Option<String>,
    #[serde(rename = "omit_DCF_prefix", default)]
    pub omit_namespace_prefix: Option<bool>,
    /// Seconds between heartbeats.
    #[serde(default)]
    pub heartbeat_interval: Option<u64>,
}
