//! Main orchestration logic for validating and uploading a submission.

use crate::archive::{ArchiveInspector, ArchiveManifest};
use crate::augment::{self, ManifestAugmenter};
use crate::backend::{is_newer_version, BackendApi, GraphQlClient};
use crate::config::{InvalidFilePolicy, UploadConfig};
use crate::coordinator::{assigned_ids, BatchCoordinator};
use crate::error::{Result, UploadError};
use crate::manifest::{Manifest, ManifestReader};
use crate::queue::{DrainStats, RetryQueue};
use crate::report::write_report;
use crate::source::{BucketLocation, DataLocation, FileSource};
use crate::storage::{ObjectStore, S3Connector, StoreConnector};
use crate::transfer::{fetch_credentials, TransferEngine};
use crate::types::{Batch, BatchType, Credentials, FileRecord};
use crate::validator::{FileValidator, ValidationReport};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Outcome of one run.
#[derive(Debug, Default)]
pub struct RunSummary {
    /// Every record with its final disposition.
    pub records: Vec<FileRecord>,
    /// The data batch, when one was created.
    pub batch: Option<Batch>,
    /// Transfer counters of the data batch.
    pub stats: DrainStats,
    /// Path of the upload report.
    pub report: Option<PathBuf>,
    /// Artifacts of the metadata sub-batch, with their outcomes.
    pub artifacts: Vec<FileRecord>,
    pub dry_run: bool,
    pub interrupted: bool,
}

impl RunSummary {
    /// Every record was uploaded or already present, and follow-up uploads succeeded.
    pub fn succeeded(&self) -> bool {
        !self.interrupted
            && self.records.iter().all(|r| r.succeeded != Some(false))
            && self.artifacts.iter().all(|r| r.succeeded == Some(true))
    }

    /// Process exit code: 0 on full success, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        if self.succeeded() {
            0
        } else {
            1
        }
    }
}

/// Runs an upload against the configured backend and S3 storage.
///
/// Ctrl-C cancels the run; records that have not finished are reported as
/// interrupted and the batch is still closed.
pub async fn run(config: UploadConfig) -> Result<RunSummary> {
    let backend: Arc<dyn BackendApi> = Arc::new(GraphQlClient::new(
        config.api_url.clone(),
        config.token.clone(),
        config.submission_id.clone(),
    )?);
    let connector: Arc<dyn StoreConnector> = Arc::new(S3Connector::new(&config.transfer));

    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    let signal = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("⚠️  Interrupt received, stopping after the current step");
            watcher.cancel();
        }
    });

    let result = run_with(config, backend, connector, cancel).await;
    signal.abort();
    result
}

/// Runs an upload with the given backend and storage connector.
pub async fn run_with(
    config: UploadConfig,
    backend: Arc<dyn BackendApi>,
    connector: Arc<dyn StoreConnector>,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    check_version(backend.as_ref()).await;

    let node = backend.retrieve_file_node_config().await?;
    let config = config.with_file_node_config(&node)?;
    tokio::fs::create_dir_all(&config.work_dir).await?;

    let manifest_location = match config.manifest.as_deref() {
        Some(m) if BucketLocation::is_bucket_url(m) && config.batch_type == BatchType::DataFile => {
            Some(BucketLocation::parse(m).map_err(|e| UploadError::config("manifest", e))?)
        }
        _ => None,
    };
    let remote_data = matches!(config.data, DataLocation::Bucket(_));

    // Remote inputs need storage access before the batch exists.
    let credentials = if manifest_location.is_some() || remote_data {
        info!("🔑 Requesting storage credentials for remote inputs");
        Some(fetch_credentials(&backend, &cancel).await?)
    } else {
        None
    };

    let source = match &config.data {
        DataLocation::Local(dir) => FileSource::local(dir),
        DataLocation::Bucket(location) => {
            let credentials = credentials.as_ref().ok_or_else(|| {
                UploadError::config("data", "storage credentials are not available")
            })?;
            FileSource::RemoteBucket {
                store: connector.connect(&location.bucket, credentials)?,
                location: location.clone(),
                download_dir: config.work_dir.join("data"),
            }
        }
    };

    let archive_manifest = match &config.archive_manifest {
        Some(path) => Some(ArchiveManifest::load(path).await?),
        None => None,
    };
    let inspector = ArchiveInspector::new(
        archive_manifest,
        config.work_dir.join("archives"),
        config.bypass_archive_validation,
    );

    let mut validator = FileValidator::new(&config, &source, inspector);
    let mut manifest_store: Option<Arc<dyn ObjectStore>> = None;
    let (manifest, report) = match config.batch_type {
        BatchType::DataFile => {
            let reader = ManifestReader::new(&config.columns);
            let manifest = match (&manifest_location, &credentials, config.manifest.as_deref()) {
                (Some(location), Some(credentials), _) => {
                    let store = connector.connect(&location.bucket, credentials)?;
                    let dir = config.work_dir.join("manifest");
                    tokio::fs::create_dir_all(&dir).await?;
                    let manifest = reader.read_remote(store.as_ref(), location, &dir).await?;
                    manifest_store = Some(store);
                    manifest
                }
                (_, _, Some(path)) => reader.read_local(std::path::Path::new(path)).await?,
                _ => {
                    return Err(UploadError::config(
                        "manifest",
                        "a manifest is required for data file uploads",
                    ))
                }
            };
            let report = validator.validate_manifest(&manifest).await?;
            (Some(manifest), report)
        }
        BatchType::Metadata => match &config.data {
            DataLocation::Local(dir) => (None, validator.validate_directory(dir).await?),
            DataLocation::Bucket(_) => {
                return Err(UploadError::config(
                    "data",
                    "metadata uploads read files from a local directory",
                ))
            }
        },
    };

    let invalid = report.invalid_count();
    let ValidationReport { mut records } = report;
    let total = records.len();

    if config.dry_run {
        if invalid == 0 {
            info!("✅ File validations are completed in dry run mode.");
        } else {
            error!("❌ Found {} invalid file(s) out of {} in dry run mode", invalid, total);
        }
        let report = write_report(&config.report_dir, &records)?;
        return Ok(RunSummary {
            records,
            report: Some(report),
            dry_run: true,
            ..Default::default()
        });
    }

    if invalid > 0 && (config.invalid_policy == InvalidFilePolicy::Abort || invalid == total) {
        error!("❌ Found total {} file(s) are invalid!", invalid);
        write_report(&config.report_dir, &records)?;
        return Err(UploadError::ValidationFailed { invalid, total });
    }
    if invalid > 0 {
        warn!(
            "⚠️  Skipping {} invalid file(s), uploading the remaining {}",
            invalid,
            total - invalid
        );
    }

    let uploaded = upload(
        &config,
        backend,
        connector,
        &mut records,
        credentials,
        manifest.as_ref(),
        manifest_store,
        &cancel,
    )
    .await;
    let report = write_report(&config.report_dir, &records)?;
    let outcome = uploaded?;

    let summary = RunSummary {
        records,
        batch: Some(outcome.batch),
        stats: outcome.stats,
        report: Some(report),
        artifacts: outcome.artifacts,
        dry_run: false,
        interrupted: outcome.interrupted,
    };
    if summary.succeeded() {
        info!("✅ File uploading completed!");
    } else {
        error!("❌ Failed to upload some files, see the upload report for details");
    }
    Ok(summary)
}

struct UploadOutcome {
    batch: Batch,
    stats: DrainStats,
    artifacts: Vec<FileRecord>,
    interrupted: bool,
}

/// Uploads the pending records as one batch.
///
/// Only pending records are registered with the backend; records rejected by
/// validation keep their outcome and only show up in the report.
#[allow(clippy::too_many_arguments)]
async fn upload(
    config: &UploadConfig,
    backend: Arc<dyn BackendApi>,
    connector: Arc<dyn StoreConnector>,
    records: &mut [FileRecord],
    credentials: Option<Credentials>,
    manifest: Option<&Manifest>,
    manifest_store: Option<Arc<dyn ObjectStore>>,
    cancel: &CancellationToken,
) -> Result<UploadOutcome> {
    let registered: Vec<usize> = (0..records.len())
        .filter(|&i| records[i].is_pending())
        .collect();

    let coordinator = BatchCoordinator::new(Arc::clone(&backend));
    let batch = match coordinator
        .create(config.batch_type, &subset(records, &registered))
        .await
    {
        Ok(batch) => batch,
        Err(e) => {
            for record in records.iter_mut().filter(|r| r.is_pending()) {
                record.mark_failed(e.to_string());
            }
            return Err(e);
        }
    };
    let heartbeat = coordinator.start_heartbeat(&batch, config.heartbeat_interval);

    let mut stats = DrainStats::default();
    let engine = TransferEngine::connect(
        Arc::clone(&backend),
        connector,
        config.transfer.clone(),
        &batch,
        config.overwrite,
        credentials,
        cancel.clone(),
    )
    .await;

    let mut engine = match engine {
        Ok(mut engine) => {
            let mut queue = RetryQueue::new(records, config.retries);
            stats = queue.drain(records, &mut engine, cancel).await;
            Some(engine)
        }
        Err(e) => {
            error!("❌ Failed to upload files: can't get storage access: {}", e);
            let reason = if matches!(e, UploadError::Interrupted) {
                e.to_string()
            } else {
                format!("Failed to upload files: {}", e)
            };
            for record in records.iter_mut().filter(|r| r.is_pending()) {
                record.mark_failed(reason.clone());
            }
            None
        }
    };

    let beats = heartbeat.stop().await;
    debug!("Sent {} heartbeat(s) for batch {}", beats, batch.id);

    let interrupted = cancel.is_cancelled();
    if interrupted {
        info!("{}", UploadError::Interrupted);
    }
    for record in records.iter_mut().filter(|r| r.is_pending()) {
        record.mark_failed(UploadError::Interrupted.to_string());
    }

    let batch_records = subset(records, &registered);
    coordinator.finalize(&batch, &batch_records).await?;

    let mut artifacts = Vec::new();
    if let (Some(manifest), Some(engine)) = (manifest, engine.as_mut()) {
        if config.batch_type == BatchType::DataFile && !interrupted && stats.succeeded() {
            let ids = assigned_ids(&batch, &batch_records);
            let augmented = augment_manifest(
                config,
                &coordinator,
                engine,
                records,
                &ids,
                manifest,
                manifest_store,
                cancel,
            )
            .await;
            match augmented {
                Ok(uploaded) => artifacts = uploaded,
                Err(e) => {
                    error!("❌ Failed to process the manifest and final metadata files: {}", e);
                    let mut failed = FileRecord::new(
                        augment::final_manifest_path(&manifest.local_path, &config.work_dir)
                            .display()
                            .to_string(),
                        &manifest.local_path,
                        0,
                    );
                    failed.mark_failed(e.to_string());
                    artifacts.push(failed);
                }
            }
        }
    }

    Ok(UploadOutcome {
        batch,
        stats,
        artifacts,
        interrupted,
    })
}

fn subset(records: &[FileRecord], indices: &[usize]) -> Vec<FileRecord> {
    indices.iter().map(|&i| records[i].clone()).collect()
}

/// Writes the final manifest and child metadata files and uploads them.
#[allow(clippy::too_many_arguments)]
async fn augment_manifest(
    config: &UploadConfig,
    coordinator: &BatchCoordinator,
    engine: &mut TransferEngine,
    records: &[FileRecord],
    ids: &HashMap<String, String>,
    manifest: &Manifest,
    manifest_store: Option<Arc<dyn ObjectStore>>,
    cancel: &CancellationToken,
) -> Result<Vec<FileRecord>> {
    let manifest_dir = manifest
        .local_path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));

    if let (Some(store), Some(location)) = (
        manifest_store,
        config.manifest.as_deref().and_then(|m| BucketLocation::parse(m).ok()),
    ) {
        augment::download_siblings(store.as_ref(), &location, &manifest_dir).await?;
    }

    let augmenter = ManifestAugmenter::new(&config.columns, &config.id_scheme);
    let mut files = Vec::new();
    let table = if augment::needs_final_manifest(manifest, records) {
        let table = augmenter.final_manifest(manifest, records, ids)?;
        let path = augment::final_manifest_path(&manifest.local_path, &manifest_dir);
        table.write(&path)?;
        info!("📝 Final manifest written to {}", path.display());
        files.push(path);
        table
    } else {
        files.push(manifest.local_path.clone());
        manifest.table.clone()
    };

    let children = augmenter
        .propagate_to_children(&table, &manifest_dir, &manifest.local_path, &manifest_dir)
        .await?;
    files.extend(children);

    augment::upload_artifacts(config, coordinator, engine, &files, cancel).await
}

async fn check_version(backend: &dyn BackendApi) {
    let current = env!("CARGO_PKG_VERSION");
    match backend.retrieve_cli_version().await {
        Ok(Some(latest)) if is_newer_version(current, &latest) => warn!(
            "⚠️  A newer uploader version {} is available (running {})",
            latest, current
        ),
        Ok(_) => debug!("Uploader version {} is current", current),
        Err(e) => debug!("Could not check the uploader version: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::md5_hex;
    use crate::config::{RawConfig, TransferSettings};
    use crate::manifest::TsvTable;
    use crate::testing::{MemoryConnector, MemoryStore, MockBackend, StoreFault};
    use std::path::Path;
    use std::time::Duration;

    struct Fixture {
        dir: tempfile::TempDir,
        store: Arc<MemoryStore>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("data")).unwrap();
            Self {
                dir,
                store: Arc::new(MemoryStore::new("bucket")),
            }
        }

        fn data(&self, name: &str, bytes: &[u8]) {
            let path = self.dir.path().join("data").join(name);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, bytes).unwrap();
        }

        fn manifest(&self, rows: &[(&str, u64, String)]) -> PathBuf {
            let mut text = String::from("type\tfile_name\tfile_size\tmd5sum\n");
            for (name, size, md5) in rows {
                text.push_str(&format!("file\t{}\t{}\t{}\n", name, size, md5));
            }
            let path = self.dir.path().join("manifest").join("manifest.tsv");
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(&path, text).unwrap();
            path
        }

        fn config(&self, manifest: &Path) -> UploadConfig {
            let raw = RawConfig {
                api_url: Some("https://example.org/api/graphql".into()),
                token: Some("token".into()),
                submission: Some("sub-1".into()),
                upload_type: Some("data file".into()),
                data: Some(self.dir.path().join("data").display().to_string()),
                manifest: Some(manifest.display().to_string()),
                cache_file: Some(self.dir.path().join("cache.csv").display().to_string()),
                report_dir: Some(self.dir.path().join("reports").display().to_string()),
                ..Default::default()
            };
            let mut config = UploadConfig::from_raw(raw).unwrap();
            config.work_dir = self.dir.path().join("work");
            config.transfer = TransferSettings {
                multipart_threshold: 4096,
                auto_multipart_ceiling: 32,
                min_part_size: 4,
                part_retry_backoff: Duration::from_millis(5),
                ..Default::default()
            };
            config
        }

        fn only_report(&self) -> PathBuf {
            let mut reports: Vec<_> = std::fs::read_dir(self.dir.path().join("reports"))
                .unwrap()
                .map(|e| e.unwrap().path())
                .collect();
            assert_eq!(reports.len(), 1);
            reports.remove(0)
        }

        async fn run(&self, config: UploadConfig, backend: Arc<MockBackend>) -> Result<RunSummary> {
            run_with(
                config,
                backend,
                Arc::new(MemoryConnector::new(self.store.clone())),
                CancellationToken::new(),
            )
            .await
        }
    }

    fn backend() -> Arc<MockBackend> {
        let mut backend = MockBackend::new();
        backend.assign_ids = true;
        Arc::new(backend)
    }

    #[tokio::test]
    async fn uploads_valid_file_and_final_manifest() {
        let fx = Fixture::new();
        fx.data("a.txt", b"hello");
        let manifest = fx.manifest(&[("a.txt", 5, md5_hex(b"hello"))]);
        let backend = backend();

        let summary = fx.run(fx.config(&manifest), backend.clone()).await.unwrap();

        assert!(summary.succeeded());
        assert_eq!(summary.exit_code(), 0);
        assert_eq!(fx.store.object("sub-1/file/a.txt").unwrap(), b"hello");

        let terminal = backend.terminal_updates();
        let files = terminal[0].files.as_ref().unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].file_name, "a.txt");
        assert!(files[0].succeeded);
        assert!(!files[0].skipped);
        assert!(files[0].errors.is_empty());

        // Manifest had no identifiers, so a final manifest goes up as metadata.
        let created = backend.created_batches();
        assert_eq!(created.len(), 2);
        assert_eq!(created[1].0, BatchType::Metadata);
        assert_eq!(created[1].1, vec!["manifest-final.tsv".to_string()]);
        let uploaded = fx
            .store
            .object("sub-1/metadata/batch-2/manifest-final.tsv")
            .unwrap();
        let table = TsvTable::parse(&uploaded, "final").unwrap();
        assert_eq!(
            table.value(0, "file_id"),
            Some("dg.4DFC/00000000-0000-4000-8000-000000000001")
        );

        let report = TsvTable::read(summary.report.as_ref().unwrap()).await.unwrap();
        assert_eq!(report.value(0, "name"), Some("a.txt"));
        assert_eq!(report.value(0, "succeeded"), Some("true"));
    }

    #[tokio::test]
    async fn size_mismatch_aborts_before_any_transfer() {
        let fx = Fixture::new();
        fx.data("b.bin", b"12345");
        let manifest = fx.manifest(&[("b.bin", 4, md5_hex(b"12345"))]);
        let backend = backend();

        let err = fx.run(fx.config(&manifest), backend.clone()).await.unwrap_err();

        assert!(matches!(err, UploadError::ValidationFailed { invalid: 1, total: 1 }));
        assert!(backend.created_batches().is_empty());
        assert_eq!(fx.store.write_count(), 0);
        let reports: Vec<_> = std::fs::read_dir(fx.dir.path().join("reports"))
            .unwrap()
            .collect();
        assert_eq!(reports.len(), 1);
    }

    #[tokio::test]
    async fn skip_policy_uploads_valid_subset() {
        let fx = Fixture::new();
        fx.data("a.txt", b"hello");
        fx.data("b.bin", b"12345");
        let manifest = fx.manifest(&[
            ("a.txt", 5, md5_hex(b"hello")),
            ("b.bin", 4, md5_hex(b"12345")),
        ]);
        let mut config = fx.config(&manifest);
        config.invalid_policy = InvalidFilePolicy::SkipInvalid;
        let backend = backend();

        let summary = fx.run(config, backend.clone()).await.unwrap();

        assert_eq!(summary.exit_code(), 1);
        assert!(fx.store.object("sub-1/file/a.txt").is_some());
        assert!(fx.store.object("sub-1/file/b.bin").is_none());
        assert_eq!(backend.created_batches()[0].1, vec!["a.txt".to_string()]);
        let terminal = backend.terminal_updates();
        let files = terminal[0].files.as_ref().unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].succeeded);

        assert_eq!(summary.records[1].succeeded, Some(false));
        assert!(summary.records[1].errors[0].starts_with("Real file size 5 of file b.bin"));
        let report = TsvTable::read(summary.report.as_ref().unwrap()).await.unwrap();
        assert_eq!(report.value(1, "name"), Some("b.bin"));
        assert_eq!(report.value(1, "succeeded"), Some("false"));
    }

    #[tokio::test]
    async fn names_colliding_after_flattening_upload_only_the_first() {
        let fx = Fixture::new();
        fx.data("dir/a.txt", b"hello");
        fx.data("dir_a.txt", b"world");
        let manifest = fx.manifest(&[
            ("dir/a.txt", 5, md5_hex(b"hello")),
            ("dir_a.txt", 5, md5_hex(b"world")),
        ]);
        let mut config = fx.config(&manifest);
        config.invalid_policy = InvalidFilePolicy::SkipInvalid;
        let backend = backend();

        let summary = fx.run(config, backend.clone()).await.unwrap();

        assert_eq!(backend.created_batches()[0].1, vec!["dir_a.txt".to_string()]);
        assert_eq!(fx.store.object("sub-1/file/dir_a.txt").unwrap(), b"hello");
        assert_eq!(summary.records[0].succeeded, Some(true));
        assert_eq!(summary.records[1].succeeded, Some(false));
        assert!(summary.records[1].errors[0].contains("collides with dir/a.txt"));
        let files = backend.terminal_updates()[0].files.clone().unwrap();
        assert_eq!(files.len(), 1);

        let uploaded = fx
            .store
            .object("sub-1/metadata/batch-2/manifest-final.tsv")
            .unwrap();
        let table = TsvTable::parse(&uploaded, "final").unwrap();
        assert_eq!(
            table.value(0, "file_id"),
            Some("dg.4DFC/00000000-0000-4000-8000-000000000001")
        );
        assert_eq!(table.value(1, "file_id"), Some(""));
    }

    #[tokio::test]
    async fn failed_batch_creation_still_writes_report() {
        let fx = Fixture::new();
        fx.data("a.txt", b"hello");
        let manifest = fx.manifest(&[("a.txt", 5, md5_hex(b"hello"))]);
        let mut backend = MockBackend::new();
        backend.fail_create = true;

        let err = fx.run(fx.config(&manifest), Arc::new(backend)).await.unwrap_err();

        assert!(matches!(err, UploadError::BatchLifecycleFailed(_)));
        assert_eq!(fx.store.write_count(), 0);
        let report = TsvTable::read(&fx.only_report()).await.unwrap();
        assert_eq!(report.value(0, "succeeded"), Some("false"));
        assert!(report.value(0, "errors").unwrap().contains("can't create new batch"));
    }

    #[tokio::test]
    async fn failed_terminal_update_still_writes_report() {
        let fx = Fixture::new();
        fx.data("a.txt", b"hello");
        let manifest = fx.manifest(&[("a.txt", 5, md5_hex(b"hello"))]);
        let mut backend = MockBackend::new();
        backend.fail_finalize = true;

        let err = fx.run(fx.config(&manifest), Arc::new(backend)).await.unwrap_err();

        assert!(matches!(err, UploadError::BatchLifecycleFailed(_)));
        assert_eq!(fx.store.object("sub-1/file/a.txt").unwrap(), b"hello");
        let report = TsvTable::read(&fx.only_report()).await.unwrap();
        assert_eq!(report.value(0, "name"), Some("a.txt"));
        assert_eq!(report.value(0, "succeeded"), Some("true"));
    }

    #[tokio::test]
    async fn remote_manifest_is_read_and_siblings_get_identifiers() {
        let fx = Fixture::new();
        fx.data("a.txt", b"hello");
        let local = fx.manifest(&[("a.txt", 5, md5_hex(b"hello"))]);
        fx.store
            .insert("incoming/manifest.tsv", std::fs::read(&local).unwrap());
        fx.store.insert(
            "incoming/sample.tsv",
            b"type\tsample_id\tfile.file_id\nsample\ts1\ta.txt\n".to_vec(),
        );
        let mut config = fx.config(&local);
        config.manifest = Some("s3://bucket/incoming/manifest.tsv".into());
        let backend = backend();

        let summary = fx.run(config, backend.clone()).await.unwrap();

        assert!(summary.succeeded());
        assert_eq!(fx.store.object("sub-1/file/a.txt").unwrap(), b"hello");
        assert_eq!(backend.credential_requests(), 1);
        let mut artifacts = backend.created_batches()[1].1.clone();
        artifacts.sort();
        assert_eq!(
            artifacts,
            vec!["manifest-final.tsv".to_string(), "sample-final.tsv".to_string()]
        );
        let child = fx
            .store
            .object("sub-1/metadata/batch-2/sample-final.tsv")
            .unwrap();
        let child = TsvTable::parse(&child, "child").unwrap();
        assert_eq!(
            child.value(0, "file.file_id"),
            Some("dg.4DFC/00000000-0000-4000-8000-000000000001")
        );
    }

    #[tokio::test]
    async fn files_already_in_a_bucket_are_validated_and_copied() {
        let fx = Fixture::new();
        fx.store.insert("incoming/a.txt", b"hello".to_vec());
        let manifest = fx.manifest(&[("a.txt", 5, md5_hex(b"hello"))]);
        let mut config = fx.config(&manifest);
        config.data = DataLocation::Bucket(BucketLocation::parse("s3://bucket/incoming").unwrap());
        let backend = backend();

        let summary = fx.run(config, backend.clone()).await.unwrap();

        assert!(summary.succeeded());
        assert_eq!(fx.store.object("sub-1/file/a.txt").unwrap(), b"hello");
        assert_eq!(
            summary.records[0].path,
            fx.dir.path().join("work").join("data").join("a.txt")
        );
        assert_eq!(backend.credential_requests(), 1);
    }

    #[tokio::test]
    async fn dry_run_validates_without_batch() {
        let fx = Fixture::new();
        fx.data("a.txt", b"hello");
        let manifest = fx.manifest(&[("a.txt", 5, md5_hex(b"hello"))]);
        let mut config = fx.config(&manifest);
        config.dry_run = true;
        let backend = backend();

        let summary = fx.run(config, backend.clone()).await.unwrap();

        assert!(summary.dry_run);
        assert_eq!(summary.exit_code(), 0);
        assert!(backend.created_batches().is_empty());
        assert_eq!(backend.credential_requests(), 0);
        assert_eq!(fx.store.write_count(), 0);
    }

    #[tokio::test]
    async fn expired_credentials_mid_multipart_retry_only_that_part() {
        let fx = Fixture::new();
        let data: Vec<u8> = (0..5000u32).map(|i| i as u8).collect();
        fx.data("big.bin", &data);
        let manifest = fx.manifest(&[("big.bin", 5000, md5_hex(&data))]);
        fx.store.fail_part(3, StoreFault::Expired, 1);
        let backend = backend();
        let connector = Arc::new(MemoryConnector::new(fx.store.clone()));
        let mut config = fx.config(&manifest);
        config.transfer.min_part_size = 1024;

        let summary = run_with(
            config,
            backend.clone(),
            connector.clone(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(summary.records[0].succeeded == Some(true));
        assert_eq!(fx.store.part_attempts(3), 2);
        for part in (1..=5).filter(|p| *p != 3) {
            assert_eq!(fx.store.part_attempts(part), 1, "part {}", part);
        }
        assert_eq!(backend.credential_requests(), 2);
        // Initial session, the rebuilt one, and none for the metadata batch in the same bucket.
        assert_eq!(connector.connect_count(), 2);
        assert_eq!(fx.store.object("sub-1/file/big.bin").unwrap(), data);
    }

    #[tokio::test]
    async fn heartbeat_triggered_interrupt_aborts_multipart_and_closes_batch() {
        let fx = Fixture::new();
        let data = vec![9u8; 5000];
        fx.data("big.bin", &data);
        let manifest = fx.manifest(&[("big.bin", 5000, md5_hex(&data))]);
        fx.store.fail_part(1, StoreFault::Request, usize::MAX);

        let cancel = CancellationToken::new();
        let mut backend = MockBackend::new();
        backend.cancel_after_heartbeats = Some((1, cancel.clone()));
        let backend = Arc::new(backend);
        let mut config = fx.config(&manifest);
        config.heartbeat_interval = Duration::from_millis(20);
        config.transfer.min_part_size = 1024;
        config.transfer.part_retry_backoff = Duration::from_secs(60);

        let summary = run_with(
            config,
            backend.clone(),
            Arc::new(MemoryConnector::new(fx.store.clone())),
            cancel,
        )
        .await
        .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.exit_code(), 1);
        assert!(backend.heartbeat_count() >= 1);
        assert_eq!(fx.store.abort_count(), 1);
        assert!(fx.store.object("sub-1/file/big.bin").is_none());
        let terminal = backend.terminal_updates();
        assert_eq!(terminal.len(), 1);
        let files = terminal[0].files.as_ref().unwrap();
        assert_eq!(files[0].errors, vec!["File uploading is interrupted.".to_string()]);
        assert!(summary.artifacts.is_empty());
    }

    #[tokio::test]
    async fn interruption_marks_pending_and_still_closes_batch() {
        let fx = Fixture::new();
        fx.data("a.txt", b"hello");
        let manifest = fx.manifest(&[("a.txt", 5, md5_hex(b"hello"))]);
        let backend = backend();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let summary = run_with(
            fx.config(&manifest),
            backend.clone(),
            Arc::new(MemoryConnector::new(fx.store.clone())),
            cancel,
        )
        .await
        .unwrap();

        assert!(summary.interrupted);
        assert_eq!(summary.exit_code(), 1);
        let terminal = backend.terminal_updates();
        assert_eq!(terminal.len(), 1);
        let files = terminal[0].files.as_ref().unwrap();
        assert_eq!(files[0].errors, vec!["File uploading is interrupted.".to_string()]);
        assert_eq!(backend.created_batches().len(), 1);
    }

    #[tokio::test]
    async fn subfolder_names_are_flattened() {
        let fx = Fixture::new();
        fx.data("dir/a.txt", b"hello");
        let manifest = fx.manifest(&[("dir/a.txt", 5, md5_hex(b"hello"))]);
        let backend = backend();

        let summary = fx.run(fx.config(&manifest), backend.clone()).await.unwrap();

        assert!(summary.succeeded());
        assert!(fx.store.object("sub-1/file/dir_a.txt").is_some());
        assert_eq!(backend.created_batches()[0].1, vec!["dir_a.txt".to_string()]);
        let uploaded = fx
            .store
            .object("sub-1/metadata/batch-2/manifest-final.tsv")
            .unwrap();
        let table = TsvTable::parse(&uploaded, "final").unwrap();
        assert_eq!(table.value(0, "file_name"), Some("a.txt"));
        assert_eq!(table.value(0, "subfolder_file_name"), Some("dir_a.txt"));
    }
}
