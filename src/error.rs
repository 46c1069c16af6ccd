//! Error types for validation and upload operations.

use std::io;
use thiserror::Error;

use crate::storage::StoreError;

/// Errors that can occur while validating or uploading a submission.
#[derive(Error, Debug)]
pub enum UploadError {
    /// I/O error during file operations.
    #[error(transparent)]
    IoError(#[from] io::Error),

    /// HTTP request error while talking to the backend.
    #[error(transparent)]
    ReqwestError(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error(transparent)]
    SerdeJsonError(#[from] serde_json::Error),

    /// Delimited text could not be read or written.
    #[error(transparent)]
    CsvError(#[from] csv::Error),

    /// Object storage request failed.
    #[error(transparent)]
    Storage(#[from] StoreError),

    /// The manifest cannot be opened, parsed, or is empty.
    #[error("Manifest unreadable: {0}")]
    ManifestUnreadable(String),

    /// The manifest is not valid UTF-8 text.
    #[error("Manifest {path} is not valid UTF-8 text: {reason}")]
    ManifestDecode { path: String, reason: String },

    /// One or more records failed validation.
    #[error("Found {invalid} invalid file(s) out of {total}")]
    ValidationFailed { invalid: usize, total: usize },

    /// Temporary storage credentials have expired.
    #[error("Storage credentials expired: {0}")]
    CredentialExpired(String),

    /// A single file transfer failed.
    #[error("Transfer of {name} failed: {reason}")]
    TransferFailed { name: String, reason: String },

    /// Creating or updating the remote batch failed.
    #[error("Batch lifecycle failed: {0}")]
    BatchLifecycleFailed(String),

    /// The contents of an archive disagree with the archive manifest.
    #[error("Archive {archive} content mismatch: {reason}")]
    ArchiveContentMismatch { archive: String, reason: String },

    /// Configuration is missing or invalid.
    #[error("Configuration error in \"{key}\": {reason}")]
    ConfigInvalid { key: String, reason: String },

    /// A request body exceeds what the backend accepts.
    #[error("Request body for {operation} is {size} bytes, over the {limit} byte limit")]
    PayloadTooLarge {
        operation: String,
        size: usize,
        limit: usize,
    },

    /// The backend answered with a GraphQL error.
    #[error("Backend error in {operation}: {message}")]
    Api { operation: String, message: String },

    /// The user interrupted the run.
    #[error("File uploading is interrupted.")]
    Interrupted,
}

impl UploadError {
    /// Create a configuration error for `key`.
    pub fn config(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Create a transfer failure for the named file.
    pub fn transfer(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransferFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Whether retrying the same operation later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::IoError(_) | Self::ReqwestError(_) | Self::Interrupted => true,
            Self::CredentialExpired(_) | Self::TransferFailed { .. } => true,
            Self::BatchLifecycleFailed(_) => true,
            Self::Storage(e) => !matches!(e, StoreError::NotFound(_)),
            _ => false,
        }
    }

    /// A concise, actionable follow-up for the user.
    pub fn hint(&self) -> &'static str {
        match self {
            Self::ManifestUnreadable(_) | Self::ManifestDecode { .. } => {
                "Check that the manifest is a tab-separated UTF-8 text file."
            }
            Self::ValidationFailed { .. } | Self::ArchiveContentMismatch { .. } => {
                "Fix the files listed in the upload report and run the upload again."
            }
            Self::ConfigInvalid { .. } => {
                "Check your command line arguments and configuration file."
            }
            Self::PayloadTooLarge { .. } => {
                "Split the submission into smaller batches and try again."
            }
            _ if self.is_transient() => "Please try again later.",
            _ => "Please contact the data submission help desk.",
        }
    }
}

/// Result type alias for upload operations.
pub type Result<T> = std::result::Result<T, UploadError>;
