//! Archive inspection.
//!
//! Zip and tar bundles are unpacked into a scratch directory and every
//! contained file is checked against the archive manifest, a TSV with the
//! columns `archive_name`, `path`, `size` and `md5`.

use crate::error::{Result, UploadError};
use crate::manifest::TsvTable;
use flate2::read::GzDecoder;
use md5::{Digest, Md5};
use std::collections::{BTreeMap, HashMap};
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};

const ARCHIVE_NAME_COLUMN: &str = "archive_name";
const PATH_COLUMN: &str = "path";
const SIZE_COLUMN: &str = "size";
const MD5_COLUMN: &str = "md5";

/// Supported archive formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Zip,
    Tar,
    TarGz,
}

impl ArchiveKind {
    /// Detects the format from a file name extension.
    pub fn detect(name: &str) -> Option<Self> {
        let lower = name.to_ascii_lowercase();
        if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else {
            None
        }
    }
}

/// Expected size and checksum of one file inside an archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub size: u64,
    pub md5: String,
}

/// Archive manifest keyed by archive name, then contained path.
#[derive(Debug, Clone, Default)]
pub struct ArchiveManifest {
    archives: HashMap<String, BTreeMap<String, ArchiveEntry>>,
}

impl ArchiveManifest {
    pub async fn load(path: &Path) -> Result<Self> {
        let table = TsvTable::read(path).await?;
        Self::from_table(&table, &path.display().to_string())
    }

    pub fn from_table(table: &TsvTable, origin: &str) -> Result<Self> {
        for column in [ARCHIVE_NAME_COLUMN, PATH_COLUMN, SIZE_COLUMN, MD5_COLUMN] {
            if table.column(column).is_none() {
                return Err(UploadError::ManifestUnreadable(format!(
                    "archive manifest {} has no \"{}\" column",
                    origin, column
                )));
            }
        }

        let mut archives: HashMap<String, BTreeMap<String, ArchiveEntry>> = HashMap::new();
        for row in 0..table.rows.len() {
            let cell = |column: &str| table.value(row, column).unwrap_or_default();
            let archive = cell(ARCHIVE_NAME_COLUMN);
            let path = normalize_entry_path(cell(PATH_COLUMN));
            let size_text = cell(SIZE_COLUMN);
            let size = size_text.replace(',', "").parse::<u64>().map_err(|_| {
                UploadError::ManifestUnreadable(format!(
                    "archive manifest {} row {}: size \"{}\" is not a number",
                    origin,
                    row + 1,
                    size_text
                ))
            })?;
            if archive.is_empty() || path.is_empty() {
                return Err(UploadError::ManifestUnreadable(format!(
                    "archive manifest {} row {} is missing the archive name or path",
                    origin,
                    row + 1
                )));
            }
            archives.entry(archive.to_string()).or_default().insert(
                path,
                ArchiveEntry {
                    size,
                    md5: cell(MD5_COLUMN).to_ascii_lowercase(),
                },
            );
        }

        debug!("Archive manifest {} describes {} archive(s)", origin, archives.len());
        Ok(Self { archives })
    }

    pub fn entries(&self, archive_name: &str) -> Option<&BTreeMap<String, ArchiveEntry>> {
        self.archives.get(archive_name)
    }
}

/// Validates archive contents against an [`ArchiveManifest`].
#[derive(Debug)]
pub struct ArchiveInspector {
    manifest: Option<ArchiveManifest>,
    scratch_dir: PathBuf,
    bypass: bool,
}

impl ArchiveInspector {
    pub fn new(manifest: Option<ArchiveManifest>, scratch_dir: impl Into<PathBuf>, bypass: bool) -> Self {
        Self {
            manifest,
            scratch_dir: scratch_dir.into(),
            bypass,
        }
    }

    /// Checks the archive at `path`, listed in the manifest as `archive_name`.
    ///
    /// Fails with [`UploadError::ArchiveContentMismatch`] when entries are
    /// missing, unexpected, or differ in size or checksum.
    pub async fn inspect(&self, archive_name: &str, path: &Path) -> Result<()> {
        let Some(kind) = ArchiveKind::detect(archive_name) else {
            return Ok(());
        };
        if self.bypass {
            debug!("Archive validation bypassed for {}", archive_name);
            return Ok(());
        }

        let mismatch = |reason: String| UploadError::ArchiveContentMismatch {
            archive: archive_name.to_string(),
            reason,
        };
        let expected = self
            .manifest
            .as_ref()
            .ok_or_else(|| mismatch("no archive manifest was provided".into()))?
            .entries(archive_name)
            .ok_or_else(|| mismatch("archive is not listed in the archive manifest".into()))?
            .clone();

        let archive = path.to_path_buf();
        let scratch = self.scratch_dir.clone();
        let actual = tokio::task::spawn_blocking(move || {
            let _guard = ScratchGuard::create(&scratch)?;
            unpack(kind, &archive, &scratch)
        })
        .await
        .map_err(|e| UploadError::IoError(std::io::Error::other(format!("Task join error: {}", e))))?
        .map_err(|e| mismatch(format!("cannot unpack archive: {}", e)))?;

        info!("📂 Unpacked {} file(s) from {}", actual.len(), archive_name);

        let problems = compare(&expected, &actual);
        if problems.is_empty() {
            info!("✅ Archive {} matches the archive manifest", archive_name);
            Ok(())
        } else {
            for p in &problems {
                warn!("❌ {}: {}", archive_name, p);
            }
            Err(mismatch(problems.join("; ")))
        }
    }
}

/// Empties the scratch directory on creation and again on drop.
struct ScratchGuard<'a> {
    dir: &'a Path,
}

impl<'a> ScratchGuard<'a> {
    fn create(dir: &'a Path) -> std::io::Result<Self> {
        if dir.exists() {
            std::fs::remove_dir_all(dir)?;
        }
        std::fs::create_dir_all(dir)?;
        Ok(Self { dir })
    }
}

impl Drop for ScratchGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_dir_all(self.dir) {
            debug!("Could not clear scratch dir {}: {}", self.dir.display(), e);
        }
    }
}

fn compare(
    expected: &BTreeMap<String, ArchiveEntry>,
    actual: &BTreeMap<String, ArchiveEntry>,
) -> Vec<String> {
    let mut problems = Vec::new();
    for (path, want) in expected {
        match actual.get(path) {
            None => problems.push(format!("{} is missing from the archive", path)),
            Some(got) if got.size != want.size => problems.push(format!(
                "{} is {} bytes, archive manifest says {}",
                path, got.size, want.size
            )),
            Some(got) if got.md5 != want.md5 => problems.push(format!(
                "{} has md5 {}, archive manifest says {}",
                path, got.md5, want.md5
            )),
            Some(_) => {}
        }
    }
    for path in actual.keys().filter(|p| !expected.contains_key(*p)) {
        problems.push(format!("{} is not listed in the archive manifest", path));
    }
    problems
}

fn normalize_entry_path(path: &str) -> String {
    path.trim().trim_start_matches("./").replace('\\', "/")
}

/// OS metadata and hidden files that archivers add on their own.
fn is_junk(path: &Path) -> bool {
    path.components().any(|c| match c {
        Component::Normal(part) => {
            let part = part.to_string_lossy();
            part == "__MACOSX" || part.starts_with('.')
        }
        _ => false,
    })
}

/// Relative path inside the archive, rejecting anything that escapes the root.
fn safe_relative(path: &Path) -> std::io::Result<PathBuf> {
    let mut out = PathBuf::new();
    for c in path.components() {
        match c {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    format!("unsafe entry path {}", path.display()),
                ))
            }
        }
    }
    Ok(out)
}

struct HashingWriter<W> {
    inner: W,
    hasher: Md5,
    written: u64,
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Writes one entry below `scratch`, returning its size and checksum.
fn extract_entry(
    reader: &mut impl Read,
    relative: &Path,
    scratch: &Path,
) -> std::io::Result<ArchiveEntry> {
    let dest = scratch.join(relative);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = HashingWriter {
        inner: std::fs::File::create(&dest)?,
        hasher: Md5::new(),
        written: 0,
    };
    std::io::copy(reader, &mut writer)?;
    writer.flush()?;
    Ok(ArchiveEntry {
        size: writer.written,
        md5: writer
            .hasher
            .finalize()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect(),
    })
}

fn unpack(
    kind: ArchiveKind,
    archive: &Path,
    scratch: &Path,
) -> std::io::Result<BTreeMap<String, ArchiveEntry>> {
    let file = std::fs::File::open(archive)?;
    match kind {
        ArchiveKind::Zip => unpack_zip(file, scratch),
        ArchiveKind::Tar => unpack_tar(tar::Archive::new(file), scratch),
        ArchiveKind::TarGz => unpack_tar(tar::Archive::new(GzDecoder::new(file)), scratch),
    }
}

fn unpack_tar<R: Read>(
    mut archive: tar::Archive<R>,
    scratch: &Path,
) -> std::io::Result<BTreeMap<String, ArchiveEntry>> {
    let mut found = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path()?.into_owned();
        if is_junk(&path) {
            debug!("Skipping junk entry {}", path.display());
            continue;
        }
        let relative = safe_relative(&path)?;
        let extracted = extract_entry(&mut entry, &relative, scratch)?;
        found.insert(relative_key(&relative), extracted);
    }
    Ok(found)
}

fn unpack_zip(
    file: std::fs::File,
    scratch: &Path,
) -> std::io::Result<BTreeMap<String, ArchiveEntry>> {
    let mut archive = zip::ZipArchive::new(file).map_err(std::io::Error::other)?;
    let mut found = BTreeMap::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(std::io::Error::other)?;
        if entry.is_dir() {
            continue;
        }
        let relative = entry.enclosed_name().ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("unsafe entry path {}", entry.name()),
            )
        })?;
        if is_junk(&relative) {
            debug!("Skipping junk entry {}", relative.display());
            continue;
        }
        let extracted = extract_entry(&mut entry, &relative, scratch)?;
        found.insert(relative_key(&relative), extracted);
    }
    Ok(found)
}

fn relative_key(path: &Path) -> String {
    path.components()
        .filter_map(|c| match c {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
