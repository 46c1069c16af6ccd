//! Batchup - validate a submission manifest and upload its files as a tracked batch
//!
//! This library reads a tab-separated manifest of data files, checks every
//! file against it, and uploads the valid files to object storage under a
//! batch registered with the submission backend.
//!
//! # Features
//!
//! - **Manifest Validation**: Names, sizes, MD5 checksums and identifiers
//! - **Checksum Cache**: Unchanged files are not hashed twice
//! - **Archive Inspection**: Zip and tar contents checked against an archive manifest
//! - **Size-Aware Transfers**: Single put, managed chunks, or retried multipart parts
//! - **Credential Refresh**: Expired storage credentials are renewed transparently
//! - **Batch Tracking**: Heartbeats while uploading, one terminal status update
//! - **Manifest Augmentation**: Identifiers written back into the manifest and its children
//!
//! # Example
//!
//! ```no_run
//! use batchup::{run, RawConfig, UploadConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let raw = RawConfig::from_yaml_file("upload.yml".as_ref())?;
//! let summary = run(UploadConfig::from_raw(raw)?).await?;
//! std::process::exit(summary.exit_code());
//! # }
//! ```

pub mod archive;
pub mod augment;
pub mod backend;
pub mod checksum;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod heartbeat;
pub mod identifier;
pub mod manifest;
pub mod orchestrator;
pub(crate) mod progress;
pub mod queue;
pub mod report;
pub mod source;
pub mod storage;
pub mod transfer;
pub mod types;
pub mod validator;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::{BackendApi, GraphQlClient};
pub use config::{InvalidFilePolicy, RawConfig, UploadConfig};
pub use error::{Result, UploadError};
pub use orchestrator::{run, run_with, RunSummary};
pub use storage::{ObjectStore, S3Connector, StoreConnector};
pub use types::{Batch, BatchType, FileRecord};
