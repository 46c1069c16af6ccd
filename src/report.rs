//! Upload report written at the end of every run.

use crate::error::Result;
use crate::types::FileRecord;
use chrono::Local;
use std::path::{Path, PathBuf};
use tracing::info;

const REPORT_COLUMNS: [&str; 8] = [
    "name",
    "size",
    "checksum",
    "identifier",
    "subfolder_alias",
    "succeeded",
    "errors",
    "skipped",
];

/// Writes `upload-report-<timestamp>.tsv` into `dir` and returns its path.
pub fn write_report(dir: &Path, records: &[FileRecord]) -> Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let stamp = Local::now().format("%Y-%m-%d-%H-%M-%S");
    let path = dir.join(format!("upload-report-{}.tsv", stamp));
    write_report_to(&path, records)?;
    info!("📝 Upload report written to {}", path.display());
    Ok(path)
}

fn write_report_to(path: &Path, records: &[FileRecord]) -> Result<()> {
    let mut writer = csv::WriterBuilder::new()
        .delimiter(b'\t')
        .quote_style(csv::QuoteStyle::Never)
        .from_path(path)?;
    writer.write_record(REPORT_COLUMNS)?;

    for r in records {
        let succeeded = match r.succeeded {
            Some(s) => s.to_string(),
            None => String::new(),
        };
        let errors = r
            .errors
            .iter()
            .map(|e| e.replace(['\t', '\n'], " "))
            .collect::<Vec<_>>()
            .join("; ");
        writer.write_record([
            r.name.clone(),
            r.size.to_string(),
            r.checksum.clone().unwrap_or_default(),
            r.identifier.clone().unwrap_or_default(),
            r.subfolder_alias.clone().unwrap_or_default(),
            succeeded,
            errors,
            r.skipped.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}
