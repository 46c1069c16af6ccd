//! Reconciles manifest records with the files they describe.

use crate::archive::{ArchiveInspector, ArchiveKind};
use crate::checksum::ChecksumCache;
use crate::config::UploadConfig;
use crate::error::{Result, UploadError};
use crate::identifier::IdScheme;
use crate::manifest::{Manifest, ManifestEntry};
use crate::progress;
use crate::source::FileSource;
use crate::types::FileRecord;
use std::path::Path;
use tracing::{debug, info, warn};

const FORBIDDEN_NAME_CHARS: &[char] = &[':', '*', '?', '"', '<', '>', '|'];

/// Extensions picked up in metadata mode.
const METADATA_EXTENSIONS: &[&str] = &["tsv", "txt"];

/// Validation result for a whole manifest.
#[derive(Debug)]
pub struct ValidationReport {
    pub records: Vec<FileRecord>,
}

impl ValidationReport {
    pub fn invalid_count(&self) -> usize {
        self.records.iter().filter(|r| !r.is_pending()).count()
    }

    pub fn valid_count(&self) -> usize {
        self.records.len() - self.invalid_count()
    }
}

/// Checks names, sizes, checksums, identifiers and archive contents.
pub struct FileValidator<'a> {
    source: &'a FileSource,
    id_scheme: &'a IdScheme,
    archives: ArchiveInspector,
    cache: ChecksumCache,
}

impl<'a> FileValidator<'a> {
    pub fn new(config: &'a UploadConfig, source: &'a FileSource, archives: ArchiveInspector) -> Self {
        Self {
            source,
            id_scheme: &config.id_scheme,
            archives,
            cache: ChecksumCache::load(&config.cache_file),
        }
    }

    /// Validates every distinct manifest entry, in manifest order.
    ///
    /// Valid records leave with `succeeded == None`; invalid ones are marked
    /// failed with the reason. The checksum cache is saved once at the end.
    pub async fn validate_manifest(&mut self, manifest: &Manifest) -> Result<ValidationReport> {
        info!("🔍 Validating {} file(s) from {}", manifest.entries.len(), manifest.origin);
        let pb = progress::files_bar(manifest.entries.len() as u64, "Validating files");

        let mut records = Vec::with_capacity(manifest.entries.len());
        for entry in &manifest.entries {
            pb.set_message(entry.name.clone());
            let record = self.validate_entry(entry, manifest.has_identifier_column).await?;
            if let Some(reason) = record.errors.first() {
                warn!("❌ {}: {}", entry.name, reason);
            } else {
                debug!("✅ {} is valid", entry.name);
            }
            records.push(record);
            pb.inc(1);
        }
        pb.finish_and_clear();

        self.finish(records)
    }

    /// Metadata mode: every `.tsv`/`.txt` file directly in `dir` becomes a record.
    pub async fn validate_directory(&mut self, dir: &Path) -> Result<ValidationReport> {
        info!("🔍 Collecting metadata files from {}", dir.display());
        let mut paths = Vec::new();
        let mut read_dir = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            let is_metadata = path
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| METADATA_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
                .unwrap_or(false);
            if is_metadata && entry.file_type().await?.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        if paths.is_empty() {
            warn!("❌ No metadata files found in {}", dir.display());
            return Err(UploadError::ValidationFailed { invalid: 0, total: 0 });
        }

        let mut records = Vec::with_capacity(paths.len());
        for path in paths {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let size = tokio::fs::metadata(&path).await?.len();
            let mut record = FileRecord::new(name.clone(), &path, size);
            match self.cache.checksum(&path).await {
                Ok(md5) => record.checksum = Some(md5),
                Err(e) => {
                    warn!("❌ {}: {}", name, e);
                    record.mark_invalid(format!("Failed to compute md5 of {}: {}", name, e));
                }
            }
            records.push(record);
        }

        self.finish(records)
    }

    fn finish(&mut self, records: Vec<FileRecord>) -> Result<ValidationReport> {
        if let Err(e) = self.cache.save() {
            warn!("⚠️  Failed to save checksum cache: {}", e);
        }
        debug!(
            "Checksum cache: {} hit(s), {} computed",
            self.cache.hits(),
            self.cache.misses()
        );

        let report = ValidationReport { records };
        info!(
            "Validation finished: {} valid, {} invalid",
            report.valid_count(),
            report.invalid_count()
        );
        Ok(report)
    }

    async fn validate_entry(&mut self, entry: &ManifestEntry, require_id: bool) -> Result<FileRecord> {
        let mut record = FileRecord::new(entry.name.clone(), self.source.describe(&entry.name), 0);
        record.checksum = entry.md5.as_ref().map(|m| m.to_ascii_lowercase());
        record.identifier = entry.identifier.clone();
        record.subfolder_alias = subfolder_alias(&entry.name);

        if let Some(conflict) = &entry.conflict {
            record.mark_invalid(conflict.clone());
            return Ok(record);
        }
        if let Err(reason) = check_name(&entry.name) {
            record.mark_invalid(reason);
            return Ok(record);
        }

        let Some(size_text) = entry.size.as_deref() else {
            record.mark_invalid(format!("Size of {} is not set in the manifest!", entry.name));
            return Ok(record);
        };
        let Some(manifest_size) = parse_size(size_text) else {
            record.mark_invalid(format!(
                "Size \"{}\" of {} is not a valid number!",
                size_text, entry.name
            ));
            return Ok(record);
        };
        let actual_size = match self.source.size(&entry.name).await {
            Ok(Some(size)) => size,
            Ok(None) => {
                record.mark_invalid(format!(
                    "File {} does not exist!",
                    self.source.describe(&entry.name)
                ));
                return Ok(record);
            }
            Err(e) => {
                record.mark_invalid(unreachable_file(self.source, &entry.name, &e));
                return Ok(record);
            }
        };
        record.size = actual_size;
        if actual_size != manifest_size {
            record.mark_invalid(format!(
                "Real file size {} of file {} does not match with that in manifest {}!",
                actual_size, entry.name, size_text
            ));
            return Ok(record);
        }

        let Some(expected_md5) = record.checksum.clone() else {
            record.mark_invalid(format!("MD5 of {} is not set in the manifest!", entry.name));
            return Ok(record);
        };
        let path = match self.source.fetch(&entry.name).await {
            Ok(path) => path,
            Err(e) => {
                record.mark_invalid(unreachable_file(self.source, &entry.name, &e));
                return Ok(record);
            }
        };
        record.path = path.clone();
        let actual_md5 = match self.cache.checksum(&path).await {
            Ok(md5) => md5,
            Err(e) => {
                record.mark_invalid(format!("Failed to compute md5 of {}: {}", entry.name, e));
                return Ok(record);
            }
        };
        if !actual_md5.eq_ignore_ascii_case(&expected_md5) {
            record.mark_invalid(format!(
                "Real file md5 {} of file {} does not match with that in manifest {}!",
                actual_md5, entry.name, expected_md5
            ));
            return Ok(record);
        }
        record.checksum = Some(actual_md5);

        match &entry.identifier {
            Some(id) => {
                if let Err(reason) = self.id_scheme.validate(id) {
                    record.mark_invalid(format!("File id of {} is invalid: {}", entry.name, reason));
                    return Ok(record);
                }
            }
            None if require_id => {
                record.mark_invalid(format!("File id of {} is not set in the manifest!", entry.name));
                return Ok(record);
            }
            None => {}
        }

        if ArchiveKind::detect(&entry.name).is_some() {
            if let Err(e) = self.archives.inspect(&entry.name, &path).await {
                record.mark_invalid(e.to_string());
                return Ok(record);
            }
        }

        Ok(record)
    }
}

fn unreachable_file(source: &FileSource, name: &str, e: &UploadError) -> String {
    debug!("Reading {} failed: {:?}", name, e);
    format!("File {} could not be read: {}", source.describe(name), e)
}

fn check_name(name: &str) -> std::result::Result<(), String> {
    if name.is_empty() {
        return Err("File name is empty!".into());
    }
    if name.starts_with('/') || name.starts_with('\\') || Path::new(name).is_absolute() {
        return Err(format!("File name {} must be relative to the data folder!", name));
    }
    if !name.is_ascii() {
        return Err(format!("File name {} contains non-ASCII characters!", name));
    }
    if let Some(c) = name.chars().find(|c| FORBIDDEN_NAME_CHARS.contains(c)) {
        return Err(format!("File name {} contains invalid character '{}'!", name, c));
    }
    Ok(())
}

fn parse_size(text: &str) -> Option<u64> {
    text.replace(',', "").trim().parse().ok()
}

/// Flattened storage name for manifest names that contain directories.
pub fn subfolder_alias(name: &str) -> Option<String> {
    if name.contains(['/', '\\']) {
        Some(name.replace(['/', '\\'], "_"))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checksum::md5_hex;
    use crate::config::RawConfig;
    use crate::manifest::ManifestReader;

    const ID: &str = "dg.4DFC/4a1c6c0e-7d3b-4f0e-9a55-1f2b0a6f9d10";

    fn config(dir: &Path) -> UploadConfig {
        let manifest = dir.join("manifest.tsv");
        std::fs::write(&manifest, "file_name\n").unwrap();
        let mut config = UploadConfig::from_raw(RawConfig {
            api_url: Some("http://localhost/api".into()),
            token: Some("t".into()),
            submission: Some("s".into()),
            upload_type: Some("data file".into()),
            data: Some(dir.display().to_string()),
            manifest: Some(manifest.display().to_string()),
            ..Default::default()
        })
        .unwrap();
        config.cache_file = dir.join("cache.csv");
        config
    }

    async fn run(dir: &Path, text: &str) -> ValidationReport {
        let config = config(dir);
        let manifest_path = dir.join("m.tsv");
        std::fs::write(&manifest_path, text).unwrap();
        let manifest = ManifestReader::new(&config.columns)
            .read_local(&manifest_path)
            .await
            .unwrap();

        let source = FileSource::local(dir);
        let inspector = ArchiveInspector::new(None, dir.join("scratch"), false);
        let mut validator = FileValidator::new(&config, &source, inspector);
        validator.validate_manifest(&manifest).await.unwrap()
    }

    #[tokio::test]
    async fn valid_file_stays_pending() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        let text = format!(
            "file_name\tfile_size\tmd5sum\na.txt\t3\t{}\n",
            md5_hex(b"abc").to_uppercase()
        );

        let report = run(dir.path(), &text).await;
        let record = &report.records[0];
        assert!(record.is_pending());
        assert_eq!(record.size, 3);
        assert_eq!(record.checksum.as_deref(), Some(md5_hex(b"abc").as_str()));
        assert_eq!(record.path, dir.path().join("a.txt"));
        assert!(dir.path().join("cache.csv").exists());
    }

    #[tokio::test]
    async fn size_mismatch_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.bin"), b"abcd").unwrap();
        let text = format!("file_name\tfile_size\tmd5sum\nb.bin\t1,000\t{}\n", md5_hex(b"abcd"));

        let report = run(dir.path(), &text).await;
        let record = &report.records[0];
        assert_eq!(record.succeeded, Some(false));
        assert!(record.errors[0].contains("does not match"));
        assert_eq!(report.invalid_count(), 1);
    }

    #[tokio::test]
    async fn missing_file_and_bad_checksum_are_invalid() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("c.txt"), b"abc").unwrap();
        let text = "file_name\tfile_size\tmd5sum\nmissing.txt\t3\tx\nc.txt\t3\tdeadbeef\n";

        let report = run(dir.path(), text).await;
        assert!(report.records[0].errors[0].contains("does not exist"));
        assert!(report.records[1].errors[0].contains("md5"));
        assert!(report.invalid_count() > 0);
    }

    #[tokio::test]
    async fn identifier_rules() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"abc").unwrap();
        std::fs::write(dir.path().join("c.txt"), b"abc").unwrap();
        let md5 = md5_hex(b"abc");
        let text = format!(
            "file_name\tfile_size\tmd5sum\tfile_id\na.txt\t3\t{m}\t{id}\nb.txt\t3\t{m}\tnot-a-uuid\nc.txt\t3\t{m}\t\n",
            m = md5,
            id = ID
        );

        let report = run(dir.path(), &text).await;
        assert!(report.records[0].is_pending());
        assert!(report.records[1].errors[0].contains("invalid"));
        assert!(report.records[2].errors[0].contains("not set"));
    }

    #[tokio::test]
    async fn archive_without_archive_manifest_is_invalid() {
        let dir = tempfile::tempdir().unwrap();
        let zip_path = dir.path().join("bundle.zip");
        {
            use std::io::Write;
            let mut zip = zip::ZipWriter::new(std::fs::File::create(&zip_path).unwrap());
            zip.start_file("x.txt", zip::write::SimpleFileOptions::default())
                .unwrap();
            zip.write_all(b"x").unwrap();
            zip.finish().unwrap();
        }
        let bytes = std::fs::read(&zip_path).unwrap();
        let text = format!(
            "file_name\tfile_size\tmd5sum\nbundle.zip\t{}\t{}\n",
            bytes.len(),
            md5_hex(&bytes)
        );

        let report = run(dir.path(), &text).await;
        assert!(report.records[0].errors[0].contains("no archive manifest"));
    }

    #[tokio::test]
    async fn storage_errors_only_invalidate_their_record() {
        use crate::source::BucketLocation;
        use crate::testing::{MemoryStore, StoreFault};
        use std::sync::Arc;

        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let store = Arc::new(MemoryStore::new("bucket"));
        store.insert("incoming/a.txt", b"abc".to_vec());
        store.insert("incoming/b.txt", b"xyz".to_vec());
        store.fail_head(StoreFault::Request, 1);

        let manifest_path = dir.path().join("m.tsv");
        std::fs::write(
            &manifest_path,
            format!(
                "file_name\tfile_size\tmd5sum\na.txt\t3\t{}\nb.txt\t3\t{}\n",
                md5_hex(b"abc"),
                md5_hex(b"xyz")
            ),
        )
        .unwrap();
        let manifest = ManifestReader::new(&config.columns)
            .read_local(&manifest_path)
            .await
            .unwrap();

        let source = FileSource::RemoteBucket {
            store: store.clone(),
            location: BucketLocation::parse("s3://bucket/incoming").unwrap(),
            download_dir: dir.path().join("downloads"),
        };
        let inspector = ArchiveInspector::new(None, dir.path().join("scratch"), false);
        let mut validator = FileValidator::new(&config, &source, inspector);
        let report = validator.validate_manifest(&manifest).await.unwrap();

        assert_eq!(report.records[0].succeeded, Some(false));
        assert!(report.records[0].errors[0].contains("could not be read"));
        assert!(report.records[1].is_pending());
        assert_eq!(report.invalid_count(), 1);
        assert!(dir.path().join("cache.csv").exists());
    }

    #[test]
    fn name_rules() {
        assert!(check_name("a.txt").is_ok());
        assert!(check_name("dir/a.txt").is_ok());
        assert!(check_name("").is_err());
        assert!(check_name("/etc/passwd").is_err());
        assert!(check_name("naïve.txt").is_err());
        assert!(check_name("a?.txt").is_err());
        assert!(check_name("C:\\a.txt").is_err());
    }

    #[test]
    fn sizes_accept_thousands_separators() {
        assert_eq!(parse_size("1,234,567"), Some(1_234_567));
        assert_eq!(parse_size("12a"), None);
    }

    #[test]
    fn alias_flattens_separators() {
        assert_eq!(subfolder_alias("a.txt"), None);
        assert_eq!(subfolder_alias("d1/d2\\a.txt").as_deref(), Some("d1_d2_a.txt"));
    }

    #[tokio::test]
    async fn metadata_mode_collects_tsv_and_txt() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("data");
        std::fs::create_dir_all(&data).unwrap();
        std::fs::write(data.join("study.tsv"), b"type\n").unwrap();
        std::fs::write(data.join("notes.txt"), b"x\n").unwrap();
        std::fs::write(data.join("image.png"), b"x").unwrap();

        let config = config(dir.path());
        let source = FileSource::local(&data);
        let inspector = ArchiveInspector::new(None, dir.path().join("scratch"), false);
        let mut validator = FileValidator::new(&config, &source, inspector);
        let report = validator.validate_directory(&data).await.unwrap();
        let names: Vec<_> = report.records.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["notes.txt", "study.tsv"]);
        assert_eq!(report.invalid_count(), 0);

        let empty = dir.path().join("empty");
        std::fs::create_dir_all(&empty).unwrap();
        assert!(matches!(
            validator.validate_directory(&empty).await,
            Err(UploadError::ValidationFailed { .. })
        ));
    }
}
