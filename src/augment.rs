//! Post-upload manifest augmentation.
//!
//! When the manifest carried no identifiers, or some names had to be
//! flattened, a final manifest is written with the backend's identifiers and
//! the storage names. Identifiers are also written into sibling metadata
//! files that reference the uploaded files, and all of these are uploaded
//! as a separate metadata batch.

use crate::config::{ManifestColumns, UploadConfig};
use crate::coordinator::BatchCoordinator;
use crate::error::{Result, UploadError};
use crate::identifier::IdScheme;
use crate::manifest::{Manifest, TsvTable};
use crate::queue::RetryQueue;
use crate::source::BucketLocation;
use crate::storage::ObjectStore;
use crate::transfer::TransferEngine;
use crate::types::{BatchType, FileRecord};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Column holding the flattened storage name in the final manifest.
pub const SUBFOLDER_ALIAS_COLUMN: &str = "subfolder_file_name";

/// Column naming the node type of manifest rows.
pub const NODE_TYPE_COLUMN: &str = "type";

const FINAL_MARKER: &str = "-final.";

/// Path of the regenerated manifest: `<stem>-final.tsv` next to `path`.
pub fn final_manifest_path(path: &Path, out_dir: &Path) -> PathBuf {
    out_dir.join(format!("{}-final.tsv", file_stem(path)))
}

/// Path of a regenerated child file: `<stem>-final.<ext>`.
pub fn final_child_path(path: &Path, out_dir: &Path) -> PathBuf {
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("tsv");
    out_dir.join(format!("{}-final.{}", file_stem(path), ext))
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "manifest".to_string())
}

fn is_metadata_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()),
        Some("tsv") | Some("txt")
    )
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}

/// Whether a final manifest has to be produced.
pub fn needs_final_manifest(manifest: &Manifest, records: &[FileRecord]) -> bool {
    !manifest.has_identifier_column || records.iter().any(|r| r.subfolder_alias.is_some())
}

/// Rewrites manifests with identifiers and storage names.
pub struct ManifestAugmenter<'a> {
    columns: &'a ManifestColumns,
    id_scheme: &'a IdScheme,
}

impl<'a> ManifestAugmenter<'a> {
    pub fn new(columns: &'a ManifestColumns, id_scheme: &'a IdScheme) -> Self {
        Self { columns, id_scheme }
    }

    /// Builds the final manifest table.
    ///
    /// `assigned` maps upload names to backend identifiers and is only
    /// consulted for records without an identifier of their own. Rows of
    /// files that were not uploaded keep an empty identifier.
    pub fn final_manifest(
        &self,
        manifest: &Manifest,
        records: &[FileRecord],
        assigned: &HashMap<String, String>,
    ) -> Result<TsvTable> {
        let by_name: HashMap<&str, &FileRecord> =
            records.iter().map(|r| (r.name.as_str(), r)).collect();
        let mut table = manifest.table.clone();
        let mut identified = 0;

        for row in 0..table.rows.len() {
            let name = table
                .value(row, &self.columns.name)
                .unwrap_or_default()
                .to_string();
            let Some(record) = by_name.get(name.as_str()) else {
                warn!("⚠️  {} has no upload record, leaving its row unchanged", name);
                continue;
            };

            table.set(row, &self.columns.name, base_name(&name));
            table.set(
                row,
                SUBFOLDER_ALIAS_COLUMN,
                record.subfolder_alias.clone().unwrap_or_default(),
            );

            let id = match record.succeeded {
                Some(true) => record
                    .identifier
                    .clone()
                    .or_else(|| assigned.get(record.upload_name()).cloned()),
                _ => None,
            };
            match id {
                Some(id) => {
                    table.set(row, &self.columns.id, self.id_scheme.present(&id));
                    identified += 1;
                }
                None => {
                    warn!("⚠️  {} was not uploaded, its identifier stays empty", name);
                    table.set(row, &self.columns.id, "");
                }
            }
        }

        if identified == 0 {
            return Err(UploadError::BatchLifecycleFailed(
                "no identifier was assigned to any uploaded file".into(),
            ));
        }
        Ok(table)
    }

    /// Writes identifiers into sibling metadata files in `dir` that reference
    /// the manifest's files through a `<type>.<id column>` column.
    ///
    /// Returns the regenerated files; siblings without references are left alone.
    pub async fn propagate_to_children(
        &self,
        final_table: &TsvTable,
        dir: &Path,
        manifest_path: &Path,
        out_dir: &Path,
    ) -> Result<Vec<PathBuf>> {
        let Some(node_type) = final_table
            .value(0, NODE_TYPE_COLUMN)
            .filter(|t| !t.is_empty())
        else {
            debug!("Manifest has no node type, no children to update");
            return Ok(Vec::new());
        };
        let reference_column = format!("{}.{}", node_type, self.columns.id);

        let ids: HashMap<String, String> = (0..final_table.rows.len())
            .filter_map(|row| {
                let name = final_table.value(row, &self.columns.name)?;
                let id = final_table
                    .value(row, &self.columns.id)
                    .filter(|id| !id.is_empty())?;
                Some((name.to_string(), id.to_string()))
            })
            .collect();

        let manifest_name = manifest_path.file_name();
        let mut siblings = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if entry.file_type().await?.is_file()
                && is_metadata_file(&path)
                && Some(entry.file_name().as_os_str()) != manifest_name
                && !name.contains(FINAL_MARKER)
            {
                siblings.push(path);
            }
        }
        siblings.sort();

        let mut written = Vec::new();
        for path in siblings {
            let mut table = match TsvTable::read(&path).await {
                Ok(t) => t,
                Err(e) => {
                    warn!("⚠️  Skipping unreadable metadata file {}: {}", path.display(), e);
                    continue;
                }
            };
            if table.column(&reference_column).is_none() {
                continue;
            }

            let mut inserted = false;
            for row in 0..table.rows.len() {
                let referenced = table.value(row, &reference_column).unwrap_or_default();
                if let Some(id) = ids.get(base_name(referenced)) {
                    let id = id.clone();
                    table.set(row, &reference_column, id);
                    inserted = true;
                }
            }
            if inserted {
                let out = final_child_path(&path, out_dir);
                table.write(&out)?;
                info!("📝 Identifiers written to {}", out.display());
                written.push(out);
            }
        }
        Ok(written)
    }
}

/// Downloads the `.tsv`/`.txt` objects next to a remote manifest into `dest`.
pub async fn download_siblings(
    store: &dyn ObjectStore,
    manifest: &BucketLocation,
    dest: &Path,
) -> Result<Vec<PathBuf>> {
    let prefix = manifest.parent_prefix();
    let mut downloaded = Vec::new();
    for key in store.list(&prefix).await? {
        let rest = &key[prefix.len().min(key.len())..];
        if rest.is_empty() || rest.contains('/') || key == manifest.key {
            continue;
        }
        let path = dest.join(rest);
        if !is_metadata_file(&path) {
            continue;
        }
        store.download(&key, &path).await?;
        downloaded.push(path);
    }
    debug!("Downloaded {} sibling metadata file(s)", downloaded.len());
    Ok(downloaded)
}

/// Uploads regenerated files as their own metadata batch, overwriting.
///
/// Returns the records with their outcomes.
pub async fn upload_artifacts(
    config: &UploadConfig,
    coordinator: &BatchCoordinator,
    engine: &mut TransferEngine,
    files: &[PathBuf],
    cancel: &CancellationToken,
) -> Result<Vec<FileRecord>> {
    let mut records = Vec::with_capacity(files.len());
    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let size = tokio::fs::metadata(path).await?.len();
        records.push(FileRecord::new(name, path, size));
    }

    let batch = coordinator.create(BatchType::Metadata, &records).await?;
    engine.retarget(&batch, true)?;

    let mut queue = RetryQueue::new(&records, config.retries);
    queue.drain(&mut records, engine, cancel).await;
    for index in queue.remaining().collect::<Vec<_>>() {
        records[index].mark_failed(UploadError::Interrupted.to_string());
    }

    coordinator.finalize(&batch, &records).await?;
    if records.iter().all(|r| r.succeeded == Some(true)) {
        info!("✅ Final manifest and metadata files uploaded");
    } else {
        warn!("❌ Some final manifest or metadata files failed to upload");
    }
    Ok(records)
}
