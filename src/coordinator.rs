//! Remote batch lifecycle: create, keep alive, finalize.

use crate::backend::BackendApi;
use crate::error::{Result, UploadError};
use crate::heartbeat::HeartbeatHandle;
use crate::types::{Batch, BatchType, BatchUpdate, FileRecord, FileResult};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

pub struct BatchCoordinator {
    backend: Arc<dyn BackendApi>,
}

impl BatchCoordinator {
    pub fn new(backend: Arc<dyn BackendApi>) -> Self {
        Self { backend }
    }

    /// Registers a batch for `records` under their upload names.
    pub async fn create(&self, batch_type: BatchType, records: &[FileRecord]) -> Result<Batch> {
        let names: Vec<String> = records.iter().map(|r| r.upload_name().to_string()).collect();
        let batch = self
            .backend
            .create_batch(batch_type, &names)
            .await
            .map_err(|e| lifecycle("can't create new batch", e))?;

        if batch.id.is_empty() || batch.bucket_name.is_empty() || batch.file_prefix.is_empty() {
            error!("❌ Created batch is missing its id, bucket or prefix: {:?}", batch);
            return Err(UploadError::BatchLifecycleFailed(
                "can't create new batch: incomplete batch returned".into(),
            ));
        }

        match batch.created_at {
            Some(at) => info!("📦 New batch is created: {} at {}", batch.id, at),
            None => info!("📦 New batch is created: {}", batch.id),
        }
        Ok(batch)
    }

    /// Starts the keep-alive task for `batch`.
    pub fn start_heartbeat(&self, batch: &Batch, interval: Duration) -> HeartbeatHandle {
        HeartbeatHandle::start(Arc::clone(&self.backend), batch.id.clone(), interval)
    }

    /// Sends the terminal update carrying every record's disposition.
    pub async fn finalize(&self, batch: &Batch, records: &[FileRecord]) -> Result<BatchUpdate> {
        let results: Vec<FileResult> = records.iter().map(FileRecord::to_result).collect();
        let update = self
            .backend
            .update_batch(&batch.id, Some(&results), false)
            .await
            .map_err(|e| lifecycle(&format!("failed to update batch {}", batch.id), e))?;

        match update.updated_at {
            Some(at) => info!(
                "The batch is updated: {} with new status: {:?} at {}",
                update.id, update.status, at
            ),
            None => info!(
                "The batch is updated: {} with new status: {:?}",
                update.id, update.status
            ),
        }
        Ok(update)
    }
}

fn lifecycle(context: &str, e: UploadError) -> UploadError {
    match e {
        UploadError::PayloadTooLarge { .. } | UploadError::Interrupted => e,
        other => {
            error!("❌ {}", context);
            UploadError::BatchLifecycleFailed(format!("{}: {}", context, other))
        }
    }
}

/// Identifiers assigned by the backend, keyed by upload name.
///
/// Files the backend returned without a name match fall back to position.
pub fn assigned_ids(batch: &Batch, records: &[FileRecord]) -> HashMap<String, String> {
    let mut ids = HashMap::new();
    for (i, record) in records.iter().enumerate() {
        let by_name = batch
            .files
            .iter()
            .find(|f| f.name == record.upload_name())
            .and_then(|f| f.id.clone());
        let by_position = || batch.files.get(i).and_then(|f| f.id.clone());
        if let Some(id) = by_name.or_else(by_position) {
            ids.insert(record.upload_name().to_string(), id);
        }
    }
    ids
}
