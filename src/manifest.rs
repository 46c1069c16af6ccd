//! Tab-separated manifest parsing.
//!
//! The reader keeps every original column and row so the manifest can be
//! regenerated after upload, and extracts one [`ManifestEntry`] per distinct
//! file name for validation.

use crate::config::ManifestColumns;
use crate::error::{Result, UploadError};
use crate::source::BucketLocation;
use crate::storage::ObjectStore;
use crate::validator::subfolder_alias;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// A tab-separated table with trimmed headers and values.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TsvTable {
    pub headers: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl TsvTable {
    /// Parses UTF-8 TSV text; `origin` is only used in error messages.
    pub fn parse(bytes: &[u8], origin: &str) -> Result<Self> {
        let text = std::str::from_utf8(bytes).map_err(|e| UploadError::ManifestDecode {
            path: origin.to_string(),
            reason: e.to_string(),
        })?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);

        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b'\t')
            .quoting(false)
            .trim(csv::Trim::All)
            .from_reader(text.as_bytes());

        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| unreadable(origin, e))?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|e| unreadable(origin, e))?;
            if record.iter().all(str::is_empty) {
                continue;
            }
            rows.push(record.iter().map(str::to_string).collect());
        }
        Ok(Self { headers, rows })
    }

    pub async fn read(path: &Path) -> Result<Self> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            UploadError::ManifestUnreadable(format!("cannot open {}: {}", path.display(), e))
        })?;
        Self::parse(&bytes, &path.display().to_string())
    }

    pub fn column(&self, name: &str) -> Option<usize> {
        self.headers.iter().position(|h| h == name)
    }

    pub fn value<'a>(&'a self, row: usize, column: &str) -> Option<&'a str> {
        let idx = self.column(column)?;
        self.rows
            .get(row)
            .and_then(|r| r.get(idx))
            .map(String::as_str)
    }

    /// Sets a cell, appending the column when the table does not have it yet.
    pub fn set(&mut self, row: usize, column: &str, value: impl Into<String>) {
        let idx = match self.column(column) {
            Some(idx) => idx,
            None => {
                self.headers.push(column.to_string());
                for r in &mut self.rows {
                    r.push(String::new());
                }
                self.headers.len() - 1
            }
        };
        if let Some(r) = self.rows.get_mut(row) {
            if r.len() <= idx {
                r.resize(idx + 1, String::new());
            }
            r[idx] = value.into();
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b'\t')
            .quote_style(csv::QuoteStyle::Never)
            .from_path(path)?;
        writer.write_record(&self.headers)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}

fn unreadable(origin: &str, e: csv::Error) -> UploadError {
    UploadError::ManifestUnreadable(format!("{} is not valid tab-separated text: {}", origin, e))
}

/// One distinct file listed in the manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    /// 1-based row number (excluding the header) of the first occurrence.
    pub line: usize,
    pub name: String,
    /// Raw size text, commas included.
    pub size: Option<String>,
    pub md5: Option<String>,
    pub identifier: Option<String>,
    /// Set when the same name appears again with a different checksum.
    pub conflict: Option<String>,
}

/// A parsed manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Where the manifest was read from (path or URL).
    pub origin: String,
    /// Local copy of the manifest.
    pub local_path: PathBuf,
    pub table: TsvTable,
    pub entries: Vec<ManifestEntry>,
    /// The header declares the identifier column.
    pub has_identifier_column: bool,
}

/// Reads manifests using configurable column names.
pub struct ManifestReader<'a> {
    columns: &'a ManifestColumns,
}

impl<'a> ManifestReader<'a> {
    pub fn new(columns: &'a ManifestColumns) -> Self {
        Self { columns }
    }

    /// Reads a manifest from a local path.
    pub async fn read_local(&self, path: &Path) -> Result<Manifest> {
        info!("📄 Reading manifest {}", path.display());
        let table = TsvTable::read(path).await?;
        self.build(path.display().to_string(), path.to_path_buf(), table)
    }

    /// Downloads a manifest from a bucket into `download_dir`, then reads it.
    pub async fn read_remote(
        &self,
        store: &dyn ObjectStore,
        location: &BucketLocation,
        download_dir: &Path,
    ) -> Result<Manifest> {
        let dest = download_dir.join(location.file_name());
        info!("⬇️  Downloading manifest {}", location);
        store.download(&location.key, &dest).await.map_err(|e| {
            UploadError::ManifestUnreadable(format!("cannot download {}: {}", location, e))
        })?;
        let table = TsvTable::read(&dest).await?;
        self.build(location.to_string(), dest, table)
    }

    fn build(&self, origin: String, local_path: PathBuf, table: TsvTable) -> Result<Manifest> {
        if table.rows.is_empty() {
            return Err(UploadError::ManifestUnreadable(format!(
                "{} contains no file rows",
                origin
            )));
        }
        let name_idx = table.column(&self.columns.name).ok_or_else(|| {
            UploadError::ManifestUnreadable(format!(
                "{} has no \"{}\" column",
                origin, self.columns.name
            ))
        })?;
        let size_idx = table.column(&self.columns.size);
        let md5_idx = table.column(&self.columns.md5);
        let id_idx = table.column(&self.columns.id);

        let cell = |row: &Vec<String>, idx: Option<usize>| {
            idx.and_then(|i| row.get(i))
                .filter(|v| !v.is_empty())
                .cloned()
        };

        let mut entries: Vec<ManifestEntry> = Vec::new();
        let mut by_name: HashMap<String, usize> = HashMap::new();
        let mut by_storage_name: HashMap<String, usize> = HashMap::new();

        for (i, row) in table.rows.iter().enumerate() {
            let name = row.get(name_idx).cloned().unwrap_or_default();
            let md5 = cell(row, md5_idx);

            if let Some(&existing) = by_name.get(&name) {
                let first = &mut entries[existing];
                let same = match (&first.md5, &md5) {
                    (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
                    (None, None) => true,
                    _ => false,
                };
                if same {
                    debug!("Row {} repeats {} with the same checksum", i + 1, name);
                } else if first.conflict.is_none() {
                    warn!("Row {} repeats {} with a different checksum", i + 1, name);
                    first.conflict = Some(format!(
                        "File name {} is listed more than once with different checksums (rows {} and {})!",
                        name,
                        first.line,
                        i + 1
                    ));
                }
                continue;
            }

            let storage_name = subfolder_alias(&name).unwrap_or_else(|| name.clone());
            let conflict = match by_storage_name.get(&storage_name) {
                Some(&other) => {
                    let first = &entries[other];
                    warn!(
                        "Row {} ({}) is stored as {} like row {} ({})",
                        i + 1,
                        name,
                        storage_name,
                        first.line,
                        first.name
                    );
                    Some(format!(
                        "File name {} collides with {} (row {}): both are stored as {}!",
                        name, first.name, first.line, storage_name
                    ))
                }
                None => {
                    by_storage_name.insert(storage_name, entries.len());
                    None
                }
            };

            by_name.insert(name.clone(), entries.len());
            entries.push(ManifestEntry {
                line: i + 1,
                name,
                size: cell(row, size_idx),
                md5,
                identifier: cell(row, id_idx),
                conflict,
            });
        }

        info!(
            "Manifest {} lists {} file(s) in {} row(s)",
            origin,
            entries.len(),
            table.rows.len()
        );

        Ok(Manifest {
            origin,
            local_path,
            has_identifier_column: id_idx.is_some(),
            table,
            entries,
        })
    }
}
