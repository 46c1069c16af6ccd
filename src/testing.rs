//! In-memory storage and backend doubles shared by unit tests.

use crate::backend::BackendApi;
use crate::checksum;
use crate::error::{Result, UploadError};
use crate::storage::{CompletedPart, ObjectStore, StoreConnector, StoreError};
use crate::types::{
    Batch, BatchFile, BatchStatus, BatchType, BatchUpdate, Credentials, FileNodeConfig,
    FileResult,
};
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Injected storage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreFault {
    Expired,
    Request,
}

impl StoreFault {
    fn to_error(self, what: &str) -> StoreError {
        match self {
            StoreFault::Expired => StoreError::ExpiredCredentials(format!("ExpiredToken: {}", what)),
            StoreFault::Request => StoreError::Request(format!("injected failure: {}", what)),
        }
    }
}

#[derive(Default)]
struct StoreState {
    objects: HashMap<String, Vec<u8>>,
    uploads: HashMap<String, (String, HashMap<i32, Vec<u8>>)>,
    next_upload: usize,
    writes: usize,
    puts: usize,
    aborts: usize,
    last_md5: Option<String>,
    part_attempts: HashMap<i32, usize>,
    part_faults: HashMap<i32, (StoreFault, usize)>,
    head_fault: Option<(StoreFault, usize)>,
}

/// Object store backed by a hash map, with fault injection and counters.
pub struct MemoryStore {
    bucket: String,
    state: Mutex<StoreState>,
}

impl MemoryStore {
    pub fn new(bucket: &str) -> Self {
        Self {
            bucket: bucket.to_string(),
            state: Mutex::new(StoreState::default()),
        }
    }

    pub fn insert(&self, key: &str, data: Vec<u8>) {
        self.state.lock().unwrap().objects.insert(key.to_string(), data);
    }

    pub fn object(&self, key: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().unwrap().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Objects created by puts or completed multipart uploads.
    pub fn write_count(&self) -> usize {
        self.state.lock().unwrap().writes
    }

    pub fn put_count(&self) -> usize {
        self.state.lock().unwrap().puts
    }

    pub fn abort_count(&self) -> usize {
        self.state.lock().unwrap().aborts
    }

    pub fn last_md5(&self) -> Option<String> {
        self.state.lock().unwrap().last_md5.clone()
    }

    /// Attempts made for `part_number`, across all uploads.
    pub fn part_attempts(&self, part_number: i32) -> usize {
        self.state
            .lock()
            .unwrap()
            .part_attempts
            .get(&part_number)
            .copied()
            .unwrap_or(0)
    }

    /// Makes the next `times` uploads of `part_number` fail.
    pub fn fail_part(&self, part_number: i32, fault: StoreFault, times: usize) {
        self.state
            .lock()
            .unwrap()
            .part_faults
            .insert(part_number, (fault, times));
    }

    /// Makes the next `times` head requests fail.
    pub fn fail_head(&self, fault: StoreFault, times: usize) {
        self.state.lock().unwrap().head_fault = Some((fault, times));
    }
}

fn take_fault(slot: Option<&mut (StoreFault, usize)>) -> Option<StoreFault> {
    match slot {
        Some((fault, remaining)) if *remaining > 0 => {
            *remaining -= 1;
            Some(*fault)
        }
        _ => None,
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn bucket(&self) -> &str {
        &self.bucket
    }

    async fn head(&self, key: &str) -> std::result::Result<Option<u64>, StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(fault) = take_fault(state.head_fault.as_mut()) {
            return Err(fault.to_error(key));
        }
        Ok(state.objects.get(key).map(|o| o.len() as u64))
    }

    async fn put(
        &self,
        key: &str,
        body: Vec<u8>,
        md5_base64: Option<&str>,
    ) -> std::result::Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(md5) = md5_base64 {
            let digest = hex_to_bytes(&checksum::md5_hex(&body));
            let actual = base64::engine::general_purpose::STANDARD.encode(digest);
            if actual != md5 {
                return Err(StoreError::Request(format!("BadDigest for {}", key)));
            }
            state.last_md5 = Some(md5.to_string());
        }
        state.objects.insert(key.to_string(), body);
        state.writes += 1;
        state.puts += 1;
        Ok(())
    }

    async fn create_multipart(&self, key: &str) -> std::result::Result<String, StoreError> {
        let mut state = self.state.lock().unwrap();
        state.next_upload += 1;
        let id = format!("upload-{}", state.next_upload);
        state
            .uploads
            .insert(id.clone(), (key.to_string(), HashMap::new()));
        Ok(id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        body: Vec<u8>,
    ) -> std::result::Result<String, StoreError> {
        let mut state = self.state.lock().unwrap();
        *state.part_attempts.entry(part_number).or_default() += 1;
        if let Some(fault) = take_fault(state.part_faults.get_mut(&part_number)) {
            return Err(fault.to_error(&format!("{} part {}", key, part_number)));
        }
        let etag = format!("\"{}\"", checksum::md5_hex(&body));
        let (_, parts) = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| StoreError::Request(format!("NoSuchUpload {}", upload_id)))?;
        parts.insert(part_number, body);
        Ok(etag)
    }

    async fn complete_multipart(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[CompletedPart],
    ) -> std::result::Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        let (upload_key, stored) = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| StoreError::Request(format!("NoSuchUpload {}", upload_id)))?;
        assert_eq!(upload_key, key);
        assert!(
            parts.windows(2).all(|w| w[0].part_number < w[1].part_number),
            "parts must be sorted"
        );
        let mut data = Vec::new();
        for part in parts {
            let bytes = stored
                .get(&part.part_number)
                .ok_or_else(|| StoreError::Request(format!("InvalidPart {}", part.part_number)))?;
            data.extend_from_slice(bytes);
        }
        state.objects.insert(key.to_string(), data);
        state.writes += 1;
        Ok(())
    }

    async fn abort_multipart(&self, _key: &str, upload_id: &str) -> std::result::Result<(), StoreError> {
        let mut state = self.state.lock().unwrap();
        state.uploads.remove(upload_id);
        state.aborts += 1;
        Ok(())
    }

    async fn download(&self, key: &str, dest: &Path) -> std::result::Result<u64, StoreError> {
        let data = self
            .object(key)
            .ok_or_else(|| StoreError::NotFound(key.to_string()))?;
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(dest, &data)?;
        Ok(data.len() as u64)
    }

    async fn list(&self, prefix: &str) -> std::result::Result<Vec<String>, StoreError> {
        Ok(self
            .keys()
            .into_iter()
            .filter(|k| k.starts_with(prefix))
            .collect())
    }
}

fn hex_to_bytes(hex: &str) -> Vec<u8> {
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).unwrap())
        .collect()
}

/// Hands out the same [`MemoryStore`] for every bucket.
pub struct MemoryConnector {
    store: Arc<MemoryStore>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn new(store: Arc<MemoryStore>) -> Self {
        Self {
            store,
            connects: AtomicUsize::new(0),
        }
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl StoreConnector for MemoryConnector {
    fn connect(
        &self,
        _bucket: &str,
        _credentials: &Credentials,
    ) -> std::result::Result<Arc<dyn ObjectStore>, StoreError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(self.store.clone())
    }
}

/// Data-file batch in bucket `bucket` under prefix `sub-1/file`.
pub fn batch(id: &str, names: &[&str]) -> Batch {
    Batch {
        id: id.to_string(),
        bucket_name: "bucket".to_string(),
        file_prefix: "sub-1/file".to_string(),
        batch_type: BatchType::DataFile,
        file_count: names.len(),
        files: names
            .iter()
            .map(|n| BatchFile {
                id: None,
                name: n.to_string(),
            })
            .collect(),
        status: BatchStatus::New,
        created_at: Some(Utc::now()),
        updated_at: None,
    }
}

/// A recorded `updateBatch` call.
#[derive(Debug, Clone)]
pub struct RecordedUpdate {
    pub batch_id: String,
    pub files: Option<Vec<FileResult>>,
    pub uploading: bool,
}

#[derive(Default)]
struct BackendState {
    created: Vec<(BatchType, Vec<String>)>,
    updates: Vec<RecordedUpdate>,
}

/// Backend double that records every call.
pub struct MockBackend {
    state: Mutex<BackendState>,
    credential_requests: AtomicUsize,
    /// Assign identifiers to created batch files.
    pub assign_ids: bool,
    pub node_config: FileNodeConfig,
    pub version: Option<String>,
    /// Cancelled after this many heartbeats, if set.
    pub cancel_after_heartbeats: Option<(usize, CancellationToken)>,
    /// Reject `createBatch`.
    pub fail_create: bool,
    /// Reject updates that carry per-file results.
    pub fail_finalize: bool,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(BackendState::default()),
            credential_requests: AtomicUsize::new(0),
            assign_ids: false,
            node_config: FileNodeConfig {
                id_field: Some("file_id".into()),
                ..Default::default()
            },
            version: None,
            cancel_after_heartbeats: None,
            fail_create: false,
            fail_finalize: false,
        }
    }

    pub fn credential_requests(&self) -> usize {
        self.credential_requests.load(Ordering::SeqCst)
    }

    pub fn created_batches(&self) -> Vec<(BatchType, Vec<String>)> {
        self.state.lock().unwrap().created.clone()
    }

    pub fn updates(&self) -> Vec<RecordedUpdate> {
        self.state.lock().unwrap().updates.clone()
    }

    /// Updates that carried per-file results.
    pub fn terminal_updates(&self) -> Vec<RecordedUpdate> {
        self.updates().into_iter().filter(|u| u.files.is_some()).collect()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.updates()
            .iter()
            .filter(|u| u.files.is_none() && u.uploading)
            .count()
    }
}

#[async_trait]
impl BackendApi for MockBackend {
    async fn create_temp_credentials(&self) -> Result<Credentials> {
        self.credential_requests.fetch_add(1, Ordering::SeqCst);
        Ok(Credentials {
            access_key: "AKIA".into(),
            secret_key: "secret".into(),
            session_token: "session".into(),
            expires_at: Some(Utc::now() + chrono::Duration::hours(1)),
        })
    }

    async fn create_batch(&self, batch_type: BatchType, files: &[String]) -> Result<Batch> {
        if self.fail_create {
            return Err(UploadError::Api {
                operation: "createBatch".into(),
                message: "submission is locked".into(),
            });
        }
        let mut state = self.state.lock().unwrap();
        state.created.push((batch_type, files.to_vec()));
        let id = format!("batch-{}", state.created.len());
        let names: Vec<&str> = files.iter().map(String::as_str).collect();
        let mut created = batch(&id, &names);
        created.batch_type = batch_type;
        if batch_type == BatchType::Metadata {
            created.file_prefix = format!("sub-1/metadata/{}", id);
        }
        if self.assign_ids {
            for (i, f) in created.files.iter_mut().enumerate() {
                f.id = Some(format!("dg.4DFC/00000000-0000-4000-8000-{:012}", i + 1));
            }
        }
        Ok(created)
    }

    async fn update_batch(
        &self,
        batch_id: &str,
        files: Option<&[FileResult]>,
        uploading: bool,
    ) -> Result<BatchUpdate> {
        let heartbeats = {
            let mut state = self.state.lock().unwrap();
            state.updates.push(RecordedUpdate {
                batch_id: batch_id.to_string(),
                files: files.map(<[FileResult]>::to_vec),
                uploading,
            });
            state
                .updates
                .iter()
                .filter(|u| u.files.is_none() && u.uploading)
                .count()
        };
        if self.fail_finalize && files.is_some() {
            return Err(UploadError::Api {
                operation: "updateBatch".into(),
                message: "batch not found".into(),
            });
        }
        if let Some((after, token)) = &self.cancel_after_heartbeats {
            if files.is_none() && heartbeats >= *after {
                token.cancel();
            }
        }
        let status = match files {
            None => BatchStatus::New,
            Some(results) if results.iter().all(|r| r.succeeded) => BatchStatus::Uploaded,
            Some(_) => BatchStatus::UploadFailed,
        };
        Ok(BatchUpdate {
            id: batch_id.to_string(),
            status,
            updated_at: Some(Utc::now()),
        })
    }

    async fn retrieve_file_node_config(&self) -> Result<FileNodeConfig> {
        Ok(self.node_config.clone())
    }

    async fn retrieve_cli_version(&self) -> Result<Option<String>> {
        match &self.version {
            Some(v) => Ok(Some(v.clone())),
            None => Err(UploadError::Api {
                operation: "retrieveCLIUploaderVersion".into(),
                message: "not available".into(),
            }),
        }
    }
}
