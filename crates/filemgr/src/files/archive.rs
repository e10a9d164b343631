//! Zip archive safety checks, extraction and creation.
//!
//! Archives are inspected from their central directory before anything is
//! decompressed. An archive is refused when it has too many entries, when any
//! entry compresses suspiciously well, or when the declared sizes add up past
//! the extraction budget. Entry names are resolved inside the output
//! directory so that no entry can land outside it.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Read, Seek};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info, warn};
use walkdir::WalkDir;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::atomic::AtomicWriter;
use super::sandbox::{CanonicalPath, Sandbox};

/// Default maximum number of entries in an archive.
pub const DEFAULT_MAX_FILES: usize = 1000;

/// Default maximum compression ratio of a single entry.
pub const DEFAULT_MAX_RATIO: u64 = 100;

/// Default maximum total extracted size (200MB).
pub const DEFAULT_MAX_TOTAL_SIZE: u64 = 200 * 1024 * 1024;

/// Default maximum size of a single file read, written or archived (20MB).
pub const DEFAULT_MAX_UPLOAD_SIZE: u64 = 20 * 1024 * 1024;

/// Errors that can occur while handling archives.
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// More entries than allowed.
    #[error("archive has {count} entries, limit is {limit}")]
    TooManyFiles { count: usize, limit: usize },

    /// An entry compresses better than any legitimate payload.
    #[error(
        "suspicious compression ratio for '{name}': {uncompressed} bytes from {compressed}, limit is {limit}x"
    )]
    SuspiciousRatio {
        name: String,
        compressed: u64,
        uncompressed: u64,
        limit: u64,
    },

    /// Declared sizes exceed the extraction budget.
    #[error("total extracted size too large: {total} bytes after {entries} entries, limit is {limit}")]
    TotalSizeExceeded { total: u64, entries: usize, limit: u64 },

    /// An entry name is absolute or escapes the output directory.
    #[error("unsafe entry '{name}': {reason}")]
    UnsafeEntry { name: String, reason: String },

    /// An entry decompressed to more bytes than its header declared.
    #[error("entry '{name}' is larger than its declared size of {declared} bytes")]
    SizeMismatch { name: String, declared: u64 },

    /// A file is too large to be archived.
    #[error("file too large to archive: {} is {size} bytes, limit is {limit}", .path.display())]
    FileTooLarge { path: PathBuf, size: u64, limit: u64 },

    /// Malformed archive.
    #[error("invalid zip archive: {0}")]
    Zip(#[from] ZipError),

    /// IO error.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ArchiveError {
    fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

/// Limits applied to reads, writes and archives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_files: usize,
    pub max_ratio: u64,
    pub max_total_size: u64,
    pub max_upload_size: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_ratio: DEFAULT_MAX_RATIO,
            max_total_size: DEFAULT_MAX_TOTAL_SIZE,
            max_upload_size: DEFAULT_MAX_UPLOAD_SIZE,
        }
    }
}

/// Central-directory view of one archive member.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name: String,
    pub compressed_size: u64,
    pub uncompressed_size: u64,
    pub is_dir: bool,
}

/// An entry that passed validation, with its destination.
#[derive(Debug, Clone)]
pub struct PlannedEntry {
    pub index: usize,
    pub entry: ArchiveEntry,
    pub target: CanonicalPath,
}

/// Result of a successful extraction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractSummary {
    pub files: usize,
    pub directories: usize,
    pub bytes: u64,
}

/// Result of a successful archive creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveSummary {
    pub files: usize,
    pub bytes: u64,
}

/// Read entry metadata without decompressing anything.
pub fn read_entries<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    let mut entries = Vec::with_capacity(archive.len());
    for index in 0..archive.len() {
        let file = archive.by_index_raw(index)?;
        entries.push(ArchiveEntry {
            name: file.name().to_string(),
            compressed_size: file.compressed_size(),
            uncompressed_size: file.size(),
            is_dir: file.is_dir(),
        });
    }
    Ok(entries)
}

/// Check declared entry sizes against `limits`, failing on the first
/// violation.
pub fn inspect_entries(entries: &[ArchiveEntry], limits: &ArchiveLimits) -> Result<(), ArchiveError> {
    if entries.len() > limits.max_files {
        return Err(ArchiveError::TooManyFiles {
            count: entries.len(),
            limit: limits.max_files,
        });
    }

    let mut total: u64 = 0;
    for (seen, entry) in entries.iter().enumerate() {
        let ceiling = entry
            .compressed_size
            .max(1)
            .saturating_mul(limits.max_ratio);
        if entry.uncompressed_size > ceiling {
            return Err(ArchiveError::SuspiciousRatio {
                name: entry.name.clone(),
                compressed: entry.compressed_size,
                uncompressed: entry.uncompressed_size,
                limit: limits.max_ratio,
            });
        }

        total = total.saturating_add(entry.uncompressed_size);
        if total > limits.max_total_size {
            return Err(ArchiveError::TotalSizeExceeded {
                total,
                entries: seen + 1,
                limit: limits.max_total_size,
            });
        }
    }

    Ok(())
}

/// Inspect an open archive and return its entries if it is safe to extract.
pub fn inspect<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    limits: &ArchiveLimits,
) -> Result<Vec<ArchiveEntry>, ArchiveError> {
    if archive.len() > limits.max_files {
        return Err(ArchiveError::TooManyFiles {
            count: archive.len(),
            limit: limits.max_files,
        });
    }

    let entries = read_entries(archive)?;
    inspect_entries(&entries, limits)?;
    Ok(entries)
}

/// Inspect the archive and resolve every entry inside `outdir`.
///
/// Nothing is written. Any unsafe entry rejects the whole archive.
pub fn plan_extraction<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    sandbox: &Sandbox,
    outdir: &CanonicalPath,
    limits: &ArchiveLimits,
) -> Result<Vec<PlannedEntry>, ArchiveError> {
    let entries = inspect(archive, limits)?;

    let mut plan = Vec::with_capacity(entries.len());
    for (index, entry) in entries.into_iter().enumerate() {
        let unsafe_entry = |reason: String| ArchiveError::UnsafeEntry {
            name: entry.name.clone(),
            reason,
        };

        if entry.name.is_empty() || entry.name.contains('\0') {
            return Err(unsafe_entry("invalid name".to_string()));
        }
        if Path::new(&entry.name)
            .components()
            .any(|c| matches!(c, Component::RootDir | Component::Prefix(_)))
        {
            return Err(unsafe_entry("absolute path".to_string()));
        }

        let target = sandbox
            .resolve_within(outdir, &entry.name)
            .map_err(|e| unsafe_entry(e.to_string()))?;
        if !entry.is_dir && target == *outdir {
            return Err(unsafe_entry("file entry names the output directory".to_string()));
        }

        plan.push(PlannedEntry {
            index,
            entry,
            target,
        });
    }

    check_conflicts(&plan, outdir)?;
    Ok(plan)
}

/// Reject entries that collide with each other or with what is already on
/// disk, so that extraction cannot fail after it has started writing.
fn check_conflicts(plan: &[PlannedEntry], outdir: &CanonicalPath) -> Result<(), ArchiveError> {
    let files: HashSet<&Path> = plan
        .iter()
        .filter(|p| !p.entry.is_dir)
        .map(|p| p.target.as_path())
        .collect();
    let dirs: HashSet<&Path> = plan
        .iter()
        .filter(|p| p.entry.is_dir)
        .map(|p| p.target.as_path())
        .collect();

    for planned in plan {
        let conflict = |reason: String| ArchiveError::UnsafeEntry {
            name: planned.entry.name.clone(),
            reason,
        };
        let target = planned.target.as_path();
        let existing = fs::symlink_metadata(target).ok();

        if planned.entry.is_dir {
            if existing.is_some_and(|m| !m.is_dir()) {
                return Err(conflict("an existing file is in the way".to_string()));
            }
        } else {
            if dirs.contains(target) {
                return Err(conflict("also listed as a directory".to_string()));
            }
            if existing.is_some_and(|m| m.is_dir()) {
                return Err(conflict("an existing directory is in the way".to_string()));
            }
        }

        for ancestor in target
            .ancestors()
            .skip(1)
            .take_while(|a| a.starts_with(outdir.as_path()))
        {
            if files.contains(ancestor) {
                return Err(conflict(format!(
                    "parent {} is also a file entry",
                    ancestor.display()
                )));
            }
            if fs::symlink_metadata(ancestor).is_ok_and(|m| !m.is_dir()) {
                return Err(conflict(format!(
                    "parent {} is an existing file",
                    ancestor.display()
                )));
            }
        }
    }

    Ok(())
}

/// Write one planned entry to disk and return the bytes written.
///
/// Decompression is capped at the declared size, so a lying header cannot
/// exceed the budget checked during planning.
pub fn extract_entry<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    planned: &PlannedEntry,
) -> Result<u64, ArchiveError> {
    if planned.entry.is_dir {
        fs::create_dir_all(planned.target.as_path()).map_err(|e| {
            ArchiveError::io(format!("failed to create {}", planned.target), e)
        })?;
        return Ok(0);
    }

    let declared = planned.entry.uncompressed_size;
    let mut file = archive.by_index(planned.index)?;
    let mut writer = AtomicWriter::begin(&planned.target)
        .map_err(|e| ArchiveError::io(format!("failed to create {}", planned.target), e))?;

    let written = io::copy(&mut (&mut file).take(declared.saturating_add(1)), &mut writer)
        .map_err(|e| ArchiveError::io(format!("failed to extract '{}'", planned.entry.name), e))?;
    if written > declared {
        // Writer is dropped here, so nothing of this entry reaches the target.
        return Err(ArchiveError::SizeMismatch {
            name: planned.entry.name.clone(),
            declared,
        });
    }

    writer
        .commit()
        .map_err(|e| ArchiveError::io(format!("failed to write {}", planned.target), e))?;
    Ok(written)
}

/// Write every entry of a validated plan, in archive order.
pub fn extract_planned<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    plan: &[PlannedEntry],
    outdir: &CanonicalPath,
) -> Result<ExtractSummary, ArchiveError> {
    let mut summary = ExtractSummary::default();
    for planned in plan {
        summary.bytes += extract_entry(archive, planned)?;
        if planned.entry.is_dir {
            summary.directories += 1;
        } else {
            summary.files += 1;
        }
    }

    info!(
        outdir = %outdir,
        files = summary.files,
        bytes = summary.bytes,
        "Extracted archive"
    );
    Ok(summary)
}

/// Validate the whole archive, then extract it into `outdir`.
pub fn safe_extract<R: Read + Seek>(
    archive: &mut ZipArchive<R>,
    sandbox: &Sandbox,
    outdir: &CanonicalPath,
    limits: &ArchiveLimits,
) -> Result<ExtractSummary, ArchiveError> {
    let plan = plan_extraction(archive, sandbox, outdir, limits)?;
    extract_planned(archive, &plan, outdir)
}

struct SourceFile {
    path: PathBuf,
    name: String,
    size: u64,
}

fn collect_sources(
    source: &CanonicalPath,
    limits: &ArchiveLimits,
) -> Result<Vec<SourceFile>, ArchiveError> {
    let root = source.as_path();
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let context = format!("failed to walk {}", root.display());
            ArchiveError::io(context, io::Error::other(e))
        })?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path().to_path_buf();
        let size = entry
            .metadata()
            .map_err(|e| ArchiveError::io(format!("failed to stat {}", path.display()), io::Error::other(e)))?
            .len();
        if size > limits.max_upload_size {
            return Err(ArchiveError::FileTooLarge {
                path,
                size,
                limit: limits.max_upload_size,
            });
        }

        // A single-file source is stored under its own name.
        let name = match path.strip_prefix(root) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/"),
            _ => source.file_name(),
        };

        files.push(SourceFile { path, name, size });
        if files.len() > limits.max_files {
            return Err(ArchiveError::TooManyFiles {
                count: files.len(),
                limit: limits.max_files,
            });
        }
    }

    Ok(files)
}

/// Zip `source` (a directory or a single file) into `dest`.
///
/// The archive is written to a temporary file and inspected before it
/// replaces `dest`; a failed check leaves nothing behind.
pub fn create_archive(
    source: &CanonicalPath,
    dest: &CanonicalPath,
    limits: &ArchiveLimits,
) -> Result<ArchiveSummary, ArchiveError> {
    let sources = collect_sources(source, limits)?;
    debug!(source = %source, files = sources.len(), "Collected files to archive");

    let mut writer = AtomicWriter::begin(dest)
        .map_err(|e| ArchiveError::io(format!("failed to create {}", dest), e))?;

    let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
    let mut summary = ArchiveSummary::default();
    {
        let mut zip = ZipWriter::new(writer.file_mut());
        for file in &sources {
            // The archive may live inside the tree being archived
            if file.path == dest.as_path() {
                continue;
            }
            zip.start_file(file.name.as_str(), options)?;
            let mut input = File::open(&file.path)
                .map_err(|e| ArchiveError::io(format!("failed to open {}", file.path.display()), e))?;
            io::copy(&mut input, &mut zip)
                .map_err(|e| ArchiveError::io(format!("failed to archive {}", file.path.display()), e))?;
            summary.files += 1;
            summary.bytes += file.size;
        }
        zip.finish()?;
    }

    let check = File::open(writer.temp_path())
        .map_err(|e| ArchiveError::io("failed to reopen archive", e))?;
    let mut archive = ZipArchive::new(check)?;
    if let Err(e) = inspect(&mut archive, limits) {
        warn!(dest = %dest, error = %e, "Created archive failed inspection");
        return Err(e);
    }

    writer
        .commit()
        .map_err(|e| ArchiveError::io(format!("failed to write {}", dest), e))?;

    info!(dest = %dest, files = summary.files, bytes = summary.bytes, "Created archive");
    Ok(summary)
}
