//! Byte transfer to object storage.
//!
//! The strategy depends on file size:
//!
//! - files below the multipart threshold go up in one put with a
//!   `Content-MD5` header computed from the bytes being sent,
//! - anything up to [`AUTO_MULTIPART_CEILING`] uses a managed chunked upload
//!   of at most [`MAX_MANAGED_PARTS`] parts,
//! - larger files use a manual multipart upload where every part is retried
//!   with a cancellable back-off before the session is aborted.
//!
//! Temporary credentials are refreshed before they expire and whenever
//! storage rejects them, after which the storage session is rebuilt.

use crate::backend::BackendApi;
use crate::checksum;
use crate::config::TransferSettings;
use crate::error::{Result, UploadError};
use crate::progress;
use crate::storage::{CompletedPart, ObjectStore, StoreConnector, StoreError};
use crate::types::{Batch, Credentials, FileRecord};
use async_trait::async_trait;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_retry2::strategy::FixedInterval;
use tokio_retry2::{Retry, RetryError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const MIB: u64 = 1024 * 1024;

/// Below this size files are sent with a single put.
pub const MULTIPART_THRESHOLD: u64 = 100 * MIB;

/// Largest file sent through the managed chunked upload.
pub const AUTO_MULTIPART_CEILING: u64 = 4_500_000_000;

/// Part cap of the managed chunked upload.
pub const MAX_MANAGED_PARTS: u64 = 900;

/// Smallest part of a manual multipart upload.
pub const MIN_MANUAL_PART_SIZE: u64 = 10 * MIB;

/// Part cap of a manual multipart upload.
pub const MAX_MANUAL_PARTS: u64 = 9999;

const CREDENTIAL_RETRY_INTERVAL_MS: u64 = 2_000;
const CREDENTIAL_RETRIES: usize = 2;

/// Chunk size of the managed upload: at least `min`, and large enough to keep
/// the part count within [`MAX_MANAGED_PARTS`].
pub fn managed_chunk_size(size: u64, min: u64) -> u64 {
    min.max(size.div_ceil(MAX_MANAGED_PARTS))
}

/// Part size of a manual multipart upload: `max(min, ceil(size / 9999))`.
pub fn manual_part_size(size: u64, min: u64) -> u64 {
    min.max(size.div_ceil(MAX_MANUAL_PARTS))
}

/// How a file is sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SinglePut,
    Managed { chunk_size: u64 },
    Manual { part_size: u64 },
}

impl Strategy {
    pub fn choose(size: u64, settings: &TransferSettings) -> Self {
        if size < settings.multipart_threshold {
            Strategy::SinglePut
        } else if size <= settings.auto_multipart_ceiling {
            Strategy::Managed {
                chunk_size: managed_chunk_size(size, settings.multipart_threshold),
            }
        } else {
            Strategy::Manual {
                part_size: manual_part_size(size, settings.min_part_size),
            }
        }
    }
}

/// Result of one successful transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOutcome {
    pub size_on_destination: u64,
    /// An identical object already existed and nothing was written.
    pub skipped: bool,
}

/// Something that can move one record to its destination.
#[async_trait]
pub trait FileTransfer: Send {
    async fn transfer(&mut self, record: &FileRecord) -> Result<TransferOutcome>;
}

/// Transfers files into a batch's bucket and prefix.
pub struct TransferEngine {
    backend: Arc<dyn BackendApi>,
    connector: Arc<dyn StoreConnector>,
    settings: TransferSettings,
    cancel: CancellationToken,
    credentials: Credentials,
    store: Arc<dyn ObjectStore>,
    bucket: String,
    prefix: String,
    overwrite: bool,
}

impl TransferEngine {
    /// Builds an engine for `batch`, reusing `credentials` while they are fresh.
    pub async fn connect(
        backend: Arc<dyn BackendApi>,
        connector: Arc<dyn StoreConnector>,
        settings: TransferSettings,
        batch: &Batch,
        overwrite: bool,
        credentials: Option<Credentials>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let credentials = match credentials {
            Some(c) if c.is_fresh(settings.credential_buffer) => c,
            _ => fetch_credentials(&backend, &cancel).await?,
        };
        let store = connector.connect(&batch.bucket_name, &credentials)?;
        Ok(Self {
            backend,
            connector,
            settings,
            cancel,
            credentials,
            store,
            bucket: batch.bucket_name.clone(),
            prefix: batch.file_prefix.clone(),
            overwrite,
        })
    }

    /// Points the engine at another batch, keeping the current credentials.
    pub fn retarget(&mut self, batch: &Batch, overwrite: bool) -> Result<()> {
        if batch.bucket_name != self.bucket {
            self.store = self.connector.connect(&batch.bucket_name, &self.credentials)?;
            self.bucket = batch.bucket_name.clone();
        }
        self.prefix = batch.file_prefix.clone();
        self.overwrite = overwrite;
        Ok(())
    }

    /// Current storage credentials, for reuse by later stages.
    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Destination key of `name` inside the batch prefix.
    pub fn key_for(&self, name: &str) -> String {
        let prefix = self.prefix.trim_end_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    async fn ensure_fresh(&mut self) -> Result<()> {
        if !self.credentials.is_fresh(self.settings.credential_buffer) {
            info!("🔑 Storage credentials expire soon, refreshing");
            self.refresh().await?;
        }
        Ok(())
    }

    async fn refresh(&mut self) -> Result<()> {
        self.credentials = fetch_credentials(&self.backend, &self.cancel).await?;
        self.store = self.connector.connect(&self.bucket, &self.credentials)?;
        debug!("Storage session rebuilt for bucket {}", self.bucket);
        Ok(())
    }

    /// Runs a storage call, refreshing credentials once if storage rejects them.
    async fn call<T, F, Fut>(&mut self, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn ObjectStore>) -> Fut,
        Fut: Future<Output = std::result::Result<T, StoreError>>,
    {
        match op(Arc::clone(&self.store)).await {
            Err(StoreError::ExpiredCredentials(reason)) => {
                warn!("⚠️  Storage credentials expired, refreshing");
                debug!("Credential rejection: {}", reason);
                self.refresh().await?;
                match op(Arc::clone(&self.store)).await {
                    Err(StoreError::ExpiredCredentials(reason)) => {
                        Err(UploadError::CredentialExpired(reason))
                    }
                    other => Ok(other?),
                }
            }
            other => Ok(other?),
        }
    }

    async fn upload(&mut self, record: &FileRecord) -> Result<TransferOutcome> {
        let key = self.key_for(record.upload_name());
        self.ensure_fresh().await?;

        if !self.overwrite {
            let existing = {
                let key = key.clone();
                self.call(move |store| {
                    let key = key.clone();
                    async move { store.head(&key).await }
                })
                .await?
            };
            if existing == Some(record.size) {
                info!("⏭️  {} already exists with the same size, skipping", record.upload_name());
                return Ok(TransferOutcome {
                    size_on_destination: record.size,
                    skipped: true,
                });
            }
        }

        let strategy = Strategy::choose(record.size, &self.settings);
        debug!("Uploading {} to {} with {:?}", record.name, key, strategy);
        let pb = progress::bytes_bar(record.size, format!("Uploading {}", record.upload_name()));

        match strategy {
            Strategy::SinglePut => {
                let body = tokio::fs::read(&record.path).await?;
                let md5 = checksum::md5_base64(&body);
                let len = body.len() as u64;
                let key = key.clone();
                self.call(move |store| {
                    let key = key.clone();
                    let body = body.clone();
                    let md5 = md5.clone();
                    async move { store.put(&key, body, Some(&md5)).await }
                })
                .await?;
                pb.inc(len);
            }
            Strategy::Managed { chunk_size } => {
                self.multipart(&key, &record.path, record.size, chunk_size, 0, &pb)
                    .await?;
            }
            Strategy::Manual { part_size } => {
                let retries = self.settings.part_retries;
                self.multipart(&key, &record.path, record.size, part_size, retries, &pb)
                    .await?;
            }
        }
        pb.finish_and_clear();

        let written = {
            let key = key.clone();
            self.call(move |store| {
                let key = key.clone();
                async move { store.head(&key).await }
            })
            .await?
        };
        match written {
            Some(size) if size == record.size => Ok(TransferOutcome {
                size_on_destination: size,
                skipped: false,
            }),
            Some(size) => Err(UploadError::transfer(
                record.upload_name(),
                format!("destination has {} bytes, expected {}", size, record.size),
            )),
            None => Err(UploadError::transfer(
                record.upload_name(),
                "object is missing after upload",
            )),
        }
    }

    /// Sequential multipart upload; each part gets `part_retries` extra attempts.
    async fn multipart(
        &mut self,
        key: &str,
        path: &Path,
        size: u64,
        part_size: u64,
        part_retries: usize,
        pb: &indicatif::ProgressBar,
    ) -> Result<()> {
        let owned_key = key.to_string();
        let upload_id = self
            .call(move |store| {
                let key = owned_key.clone();
                async move { store.create_multipart(&key).await }
            })
            .await?;

        match self
            .upload_parts(key, &upload_id, path, size, part_size, part_retries, pb)
            .await
        {
            Ok(mut parts) => {
                parts.sort_by_key(|p| p.part_number);
                let key = key.to_string();
                let id = upload_id.clone();
                self.call(move |store| {
                    let key = key.clone();
                    let id = id.clone();
                    let parts = parts.clone();
                    async move { store.complete_multipart(&key, &id, &parts).await }
                })
                .await
            }
            Err(e) => {
                warn!("Aborting multipart upload of {}", key);
                if let Err(abort) = self.store.abort_multipart(key, &upload_id).await {
                    debug!("Abort of {} failed: {}", key, abort);
                }
                Err(e)
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_parts(
        &mut self,
        key: &str,
        upload_id: &str,
        path: &Path,
        size: u64,
        part_size: u64,
        part_retries: usize,
        pb: &indicatif::ProgressBar,
    ) -> Result<Vec<CompletedPart>> {
        let mut file = tokio::fs::File::open(path).await?;
        let part_count = size.div_ceil(part_size).max(1);
        let mut parts = Vec::with_capacity(part_count as usize);

        for index in 0..part_count {
            if self.cancel.is_cancelled() {
                return Err(UploadError::Interrupted);
            }
            let part_number = (index + 1) as i32;
            let offset = index * part_size;
            let len = part_size.min(size - offset.min(size));
            let mut body = vec![0u8; len as usize];
            file.seek(std::io::SeekFrom::Start(offset)).await?;
            file.read_exact(&mut body).await?;

            let mut delays =
                FixedInterval::new(self.settings.part_retry_backoff).take(part_retries);
            let etag = loop {
                let part_key = key.to_string();
                let part_upload_id = upload_id.to_string();
                let attempt_body = body.clone();
                let result = self
                    .call(move |store| {
                        let key = part_key.clone();
                        let id = part_upload_id.clone();
                        let body = attempt_body.clone();
                        async move { store.upload_part(&key, &id, part_number, body).await }
                    })
                    .await;
                match result {
                    Ok(etag) => break etag,
                    Err(e) => match delays.next() {
                        Some(delay) => {
                            warn!(
                                "⚠️  Part {}/{} of {} failed, retrying in {}",
                                part_number,
                                part_count,
                                key,
                                humantime::format_duration(delay)
                            );
                            debug!("Part failure: {}", e);
                            tokio::select! {
                                _ = self.cancel.cancelled() => return Err(UploadError::Interrupted),
                                _ = tokio::time::sleep(delay) => {}
                            }
                        }
                        None => return Err(e),
                    },
                }
            };

            debug!("Part {}/{} of {} uploaded", part_number, part_count, key);
            parts.push(CompletedPart { part_number, etag });
            pb.inc(len);
        }
        Ok(parts)
    }
}

#[async_trait]
impl FileTransfer for TransferEngine {
    async fn transfer(&mut self, record: &FileRecord) -> Result<TransferOutcome> {
        match self.upload(record).await {
            Ok(outcome) => Ok(outcome),
            Err(UploadError::Interrupted) => Err(UploadError::Interrupted),
            Err(e) => {
                error!("❌ Failed to upload {}", record.upload_name());
                debug!("Upload error for {}: {:?}", record.upload_name(), e);
                let reason = match &e {
                    UploadError::TransferFailed { reason, .. } => reason.clone(),
                    other => other.to_string(),
                };
                Err(UploadError::transfer(record.upload_name(), reason))
            }
        }
    }
}

/// Requests temporary credentials, retrying transient failures.
pub async fn fetch_credentials(
    backend: &Arc<dyn BackendApi>,
    cancel: &CancellationToken,
) -> Result<Credentials> {
    let strategy =
        FixedInterval::from_millis(CREDENTIAL_RETRY_INTERVAL_MS).take(CREDENTIAL_RETRIES);
    let backend = Arc::clone(backend);
    let attempt = Retry::spawn(strategy, move || {
        let backend = Arc::clone(&backend);
        async move {
            match backend.create_temp_credentials().await {
                Ok(credentials) => Ok(credentials),
                Err(e) if e.is_transient() => {
                    warn!("Failed to get storage credentials: {}", e);
                    RetryError::to_transient(e)
                }
                Err(e) => RetryError::to_permanent(e),
            }
        }
    });

    tokio::select! {
        _ = cancel.cancelled() => Err(UploadError::Interrupted),
        result = attempt => {
            let credentials = result?;
            debug!("Obtained storage credentials: {:?}", credentials);
            Ok(credentials)
        }
    }
}
