//! Run configuration: command line, optional YAML file and backend settings.
//!
//! Everything ends up in one immutable [`UploadConfig`] that is built once at
//! startup and handed to every component.

use crate::error::{Result, UploadError};
use crate::identifier::IdScheme;
use crate::source::{BucketLocation, DataLocation};
use crate::types::{BatchType, FileNodeConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Default number of attempts per file.
pub const DEFAULT_RETRIES: u32 = 3;

/// Default seconds between heartbeats.
pub const DEFAULT_HEARTBEAT_SECS: u64 = 300;

pub const DEFAULT_NAME_FIELD: &str = "file_name";
pub const DEFAULT_SIZE_FIELD: &str = "file_size";
pub const DEFAULT_MD5_FIELD: &str = "md5sum";
pub const DEFAULT_ID_FIELD: &str = "file_id";

/// Settings as read from the command line or the config file.
///
/// All fields are optional so the two sources can be layered.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub api_url: Option<String>,
    pub token: Option<String>,
    pub submission: Option<String>,
    #[serde(rename = "type")]
    pub upload_type: Option<String>,
    pub data: Option<String>,
    pub manifest: Option<String>,
    pub archive_manifest: Option<String>,
    pub overwrite: Option<bool>,
    #[serde(alias = "dryrun")]
    pub dry_run: Option<bool>,
    pub retries: Option<u32>,
    pub bypass_archive_validation: Option<bool>,
    pub invalid_policy: Option<String>,
    pub cache_file: Option<String>,
    pub report_dir: Option<String>,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Deserialize)]
struct ConfigFile {
    #[serde(rename = "Config")]
    config: RawConfig,
}

impl RawConfig {
    /// Loads the `Config:` section of a YAML configuration file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            UploadError::config(
                "config",
                format!(
                    "configuration file \"{}\" is not readable: {}",
                    path.display(),
                    e
                ),
            )
        })?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let file: ConfigFile = serde_yaml::from_str(content)
            .map_err(|e| UploadError::config("config", e.to_string()))?;
        Ok(file.config)
    }

    /// Layers `other` on top of `self`; values set in `other` win.
    pub fn merge(self, other: RawConfig) -> RawConfig {
        RawConfig {
            api_url: other.api_url.or(self.api_url),
            token: other.token.or(self.token),
            submission: other.submission.or(self.submission),
            upload_type: other.upload_type.or(self.upload_type),
            data: other.data.or(self.data),
            manifest: other.manifest.or(self.manifest),
            archive_manifest: other.archive_manifest.or(self.archive_manifest),
            overwrite: other.overwrite.or(self.overwrite),
            dry_run: other.dry_run.or(self.dry_run),
            retries: other.retries.or(self.retries),
            bypass_archive_validation: other
                .bypass_archive_validation
                .or(self.bypass_archive_validation),
            invalid_policy: other.invalid_policy.or(self.invalid_policy),
            cache_file: other.cache_file.or(self.cache_file),
            report_dir: other.report_dir.or(self.report_dir),
            region: other.region.or(self.region),
            endpoint_url: other.endpoint_url.or(self.endpoint_url),
        }
    }
}

/// What to do when some manifest records are invalid.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvalidFilePolicy {
    /// Refuse to create a batch while any record is invalid.
    #[default]
    Abort,
    /// Upload the valid subset and report the invalid records as failed.
    SkipInvalid,
}

impl std::str::FromStr for InvalidFilePolicy {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "abort" => Ok(Self::Abort),
            "skip" | "skip-invalid" => Ok(Self::SkipInvalid),
            other => Err(format!("\"{}\" is not one of [abort, skip]", other)),
        }
    }
}

/// Column names of the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestColumns {
    pub name: String,
    pub size: String,
    pub md5: String,
    pub id: String,
}

impl Default for ManifestColumns {
    fn default() -> Self {
        Self {
            name: DEFAULT_NAME_FIELD.to_string(),
            size: DEFAULT_SIZE_FIELD.to_string(),
            md5: DEFAULT_MD5_FIELD.to_string(),
            id: DEFAULT_ID_FIELD.to_string(),
        }
    }
}

/// Tunables of the transfer engine.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Files below this size may be sent with a single put (metadata only).
    pub multipart_threshold: u64,
    /// Largest file sent through the managed chunked upload.
    pub auto_multipart_ceiling: u64,
    /// Smallest part of a manual multipart upload.
    pub min_part_size: u64,
    /// Extra attempts for a failed part of a manual multipart upload.
    pub part_retries: usize,
    /// Pause between part attempts.
    pub part_retry_backoff: Duration,
    /// Credentials expiring within this window are refreshed before use.
    pub credential_buffer: Duration,
    /// Storage region.
    pub region: String,
    /// Custom endpoint for S3-compatible storage.
    pub endpoint_url: Option<String>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            multipart_threshold: crate::transfer::MULTIPART_THRESHOLD,
            auto_multipart_ceiling: crate::transfer::AUTO_MULTIPART_CEILING,
            min_part_size: crate::transfer::MIN_MANUAL_PART_SIZE,
            part_retries: 2,
            part_retry_backoff: Duration::from_secs(300),
            credential_buffer: Duration::from_secs(300),
            region: "us-east-1".to_string(),
            endpoint_url: None,
        }
    }
}

/// Immutable configuration of one upload run.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Backend GraphQL endpoint.
    pub api_url: String,
    /// API token sent as a bearer token.
    pub token: String,
    pub submission_id: String,
    pub batch_type: BatchType,
    /// Where the data files live.
    pub data: DataLocation,
    /// Manifest path or `s3://` URL; required for data files.
    pub manifest: Option<String>,
    /// Secondary manifest describing archive contents.
    pub archive_manifest: Option<PathBuf>,
    pub overwrite: bool,
    pub dry_run: bool,
    /// Attempts per file, at least one.
    pub retries: u32,
    pub bypass_archive_validation: bool,
    pub invalid_policy: InvalidFilePolicy,
    pub columns: ManifestColumns,
    pub id_scheme: IdScheme,
    pub heartbeat_interval: Duration,
    /// Checksum cache location.
    pub cache_file: PathBuf,
    /// Directory for upload reports.
    pub report_dir: PathBuf,
    /// Scratch space for downloads and archive extraction.
    pub work_dir: PathBuf,
    pub transfer: TransferSettings,
}

impl UploadConfig {
    /// Validates raw settings; every missing or malformed value is reported by key.
    pub fn from_raw(raw: RawConfig) -> Result<Self> {
        let api_url = required(raw.api_url, "api_url")?;
        let token = required(raw.token, "token")?;
        let submission_id = required(raw.submission, "submission")?;

        let batch_type = required(raw.upload_type, "type")?
            .parse::<BatchType>()
            .map_err(|e| UploadError::config("type", e))?;

        let retries = raw.retries.unwrap_or(DEFAULT_RETRIES);
        if retries == 0 {
            return Err(UploadError::config("retries", "must be at least 1"));
        }

        let manifest = match raw.manifest.map(|m| m.trim().to_string()) {
            Some(m) if !m.is_empty() => {
                if !BucketLocation::is_bucket_url(&m) && !Path::new(&m).is_file() {
                    return Err(UploadError::config(
                        "manifest",
                        format!(
                            "manifest file \"{}\" is not readable, make sure the path is correct",
                            m
                        ),
                    ));
                }
                Some(m)
            }
            _ if batch_type == BatchType::DataFile => {
                return Err(UploadError::config(
                    "manifest",
                    "a manifest is required for data file uploads",
                ));
            }
            _ => None,
        };

        let data = required(raw.data, "data")?;
        let data = DataLocation::parse(&data).map_err(|e| UploadError::config("data", e))?;
        if let DataLocation::Local(dir) = &data {
            if !dir.is_dir() {
                return Err(UploadError::config(
                    "data",
                    format!("\"{}\" is not a directory", dir.display()),
                ));
            }
        }

        let archive_manifest = raw
            .archive_manifest
            .filter(|p| !p.trim().is_empty())
            .map(|p| PathBuf::from(p.trim()));
        if let Some(path) = &archive_manifest {
            if !path.is_file() {
                return Err(UploadError::config(
                    "archive_manifest",
                    format!("\"{}\" is not readable", path.display()),
                ));
            }
        }

        let invalid_policy = match raw.invalid_policy {
            Some(p) => p
                .parse()
                .map_err(|e| UploadError::config("invalid_policy", e))?,
            None => InvalidFilePolicy::default(),
        };

        let work_dir = std::env::temp_dir().join(format!("batchup-{}", submission_id));
        let cache_file = raw
            .cache_file
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./tmp/md5_cache.csv"));
        let report_dir = raw
            .report_dir
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./tmp"));

        let mut transfer = TransferSettings::default();
        if let Some(region) = raw.region {
            transfer.region = region;
        }
        transfer.endpoint_url = raw.endpoint_url;

        Ok(Self {
            api_url: api_url.trim().to_string(),
            token: token.trim().to_string(),
            submission_id: submission_id.trim().to_string(),
            batch_type,
            data,
            manifest,
            archive_manifest,
            overwrite: raw.overwrite.unwrap_or(false),
            dry_run: raw.dry_run.unwrap_or(false),
            retries,
            bypass_archive_validation: raw.bypass_archive_validation.unwrap_or(false),
            invalid_policy,
            columns: ManifestColumns::default(),
            id_scheme: IdScheme::default(),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECS),
            cache_file,
            report_dir,
            work_dir,
            transfer,
        })
    }

    /// Applies the submission's file node settings served by the backend.
    pub fn with_file_node_config(mut self, node: &FileNodeConfig) -> Result<Self> {
        let pick = |v: &Option<String>, default: &str| {
            v.as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .unwrap_or(default)
                .to_string()
        };
        self.columns.name = pick(&node.name_field, DEFAULT_NAME_FIELD);
        self.columns.size = pick(&node.size_field, DEFAULT_SIZE_FIELD);
        self.columns.md5 = pick(&node.md5_field, DEFAULT_MD5_FIELD);
        self.columns.id = match node.id_field.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => return Err(UploadError::config("id_field", "file id field is required")),
        };
        self.id_scheme.omit_namespace = node.omit_namespace_prefix.unwrap_or(false);
        match node.heartbeat_interval {
            Some(0) => warn!("Ignoring heartbeat interval of 0 seconds"),
            Some(secs) => self.heartbeat_interval = Duration::from_secs(secs),
            None => {}
        }
        Ok(self)
    }
}

fn required(value: Option<String>, key: &str) -> Result<String> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(UploadError::config(
            key,
            format!(
                "please provide \"{}\" in the configuration file or on the command line",
                key
            ),
        )),
    }
}
