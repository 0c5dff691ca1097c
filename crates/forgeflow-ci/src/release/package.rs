//! Bundling compiled binaries and auxiliary files into release archives.

use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;
use zip::write::SimpleFileOptions;

use crate::error::{CiError, CiResult};
use crate::release::target::{ArchiveFormat, TargetTriple};

/// Files produced by one successful release job.
///
/// Created once per job and never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactSet {
    pub target: TargetTriple,
    pub tag: String,
    /// Compiled binaries, absolute paths.
    pub binaries: Vec<PathBuf>,
    /// Auxiliary files bundled next to the binaries, absolute paths.
    pub extra_files: Vec<PathBuf>,
    /// The archive uploaded as the release asset. It lives in the job's
    /// workspace and is gone once an ephemeral job finishes; the publisher's
    /// `PublishedAsset::location` is the durable copy.
    pub archive: PathBuf,
    pub format: ArchiveFormat,
    /// SHA-256 of the archive, hex.
    pub sha256: String,
    pub created_at: DateTime<Utc>,
}

impl ArtifactSet {
    /// Asset name on the release (the archive file name).
    pub fn asset_name(&self) -> String {
        file_name(&self.archive)
    }

    /// Names of the entries at the archive root, binaries first.
    pub fn entry_names(&self) -> Vec<String> {
        self.binaries
            .iter()
            .chain(self.extra_files.iter())
            .map(|p| file_name(p))
            .collect()
    }
}

/// Inputs for [`package`].
#[derive(Debug, Clone)]
pub struct PackageRequest<'a> {
    pub project: &'a str,
    pub tag: &'a str,
    pub target: &'a TargetTriple,
    pub binaries: &'a [PathBuf],
    pub extra_files: &'a [PathBuf],
    pub out_dir: &'a Path,
}

/// Archive name: `<project>_<tag>_<triple>.<ext>`, with path separators
/// in the project and tag replaced by `-`.
pub fn archive_name(project: &str, tag: &str, target: &TargetTriple) -> String {
    format!(
        "{}_{}_{}.{}",
        path_safe(project),
        path_safe(tag),
        target,
        target.archive_format().extension()
    )
}

/// `value` usable as a single path component.
pub(crate) fn path_safe(value: &str) -> String {
    let safe = value.replace(['/', '\\'], "-");
    if safe == ".." || safe == "." {
        safe.replace('.', "-")
    } else {
        safe
    }
}

/// Write the release archive for one target.
///
/// Every binary and auxiliary file must exist; the archive holds exactly
/// those files, flat at its root.
pub fn package(req: &PackageRequest<'_>) -> CiResult<ArtifactSet> {
    if req.binaries.is_empty() {
        return Err(CiError::Package(format!(
            "no binaries to package for {}",
            req.target
        )));
    }
    for path in req.binaries.iter().chain(req.extra_files.iter()) {
        if !path.is_file() {
            return Err(CiError::Package(format!("missing file {}", path.display())));
        }
    }

    std::fs::create_dir_all(req.out_dir)?;
    let format = req.target.archive_format();
    let archive = req
        .out_dir
        .join(archive_name(req.project, req.tag, req.target));
    let entries: Vec<&PathBuf> = req.binaries.iter().chain(req.extra_files.iter()).collect();

    match format {
        ArchiveFormat::Zip => write_zip(&archive, &entries, req.binaries.len())?,
        ArchiveFormat::TarGz => write_tar_gz(&archive, &entries)?,
    }

    let sha256 = sha256_file(&archive)?;
    info!(
        archive = %archive.display(),
        target = %req.target,
        entries = entries.len(),
        "packaged release archive"
    );

    Ok(ArtifactSet {
        target: req.target.clone(),
        tag: req.tag.to_string(),
        binaries: req.binaries.to_vec(),
        extra_files: req.extra_files.to_vec(),
        archive,
        format,
        sha256,
        created_at: Utc::now(),
    })
}

fn write_zip(archive: &Path, entries: &[&PathBuf], executable_count: usize) -> CiResult<()> {
    let mut writer = zip::ZipWriter::new(File::create(archive)?);
    for (i, path) in entries.iter().enumerate() {
        let mode = if i < executable_count { 0o755 } else { 0o644 };
        let options = SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .unix_permissions(mode);
        writer.start_file(file_name(path), options)?;
        let mut reader = BufReader::new(File::open(path)?);
        std::io::copy(&mut reader, &mut writer)?;
    }
    writer.finish()?.flush()?;
    Ok(())
}

fn write_tar_gz(archive: &Path, entries: &[&PathBuf]) -> CiResult<()> {
    let encoder = GzEncoder::new(File::create(archive)?, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    for path in entries {
        builder.append_path_with_name(path, file_name(path))?;
    }
    let encoder = builder.into_inner()?;
    encoder.finish()?.flush()?;
    Ok(())
}

fn sha256_file(path: &Path) -> CiResult<String> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}
