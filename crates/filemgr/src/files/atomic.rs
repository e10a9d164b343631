//! Crash-safe file replacement.
//!
//! Content is written to a temporary file in the target's directory, synced,
//! and then renamed over the target. Readers observe either the old content
//! or the new content, never a mix. An [`AtomicWriter`] that is dropped
//! without [`AtomicWriter::commit`] removes its temporary file and leaves the
//! target untouched.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use fs2::FileExt;
use tempfile::NamedTempFile;
use tracing::{debug, warn};

use super::sandbox::CanonicalPath;

const TEMP_PREFIX: &str = ".filemgr-";
const TEMP_SUFFIX: &str = ".tmp";

/// Scoped writer that replaces its target atomically on commit.
pub struct AtomicWriter {
    target: CanonicalPath,
    temp: NamedTempFile,
}

impl AtomicWriter {
    /// Start replacing `target`.
    ///
    /// Creates the parent directory if needed and takes an exclusive advisory
    /// lock on the temporary file.
    pub fn begin(target: &CanonicalPath) -> io::Result<Self> {
        let parent = target.as_path().parent().ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "target has no parent directory")
        })?;
        fs::create_dir_all(parent)?;

        let temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .suffix(TEMP_SUFFIX)
            .tempfile_in(parent)?;
        FileExt::lock_exclusive(temp.as_file())?;

        // Keep the permissions of a file being replaced
        if let Ok(metadata) = fs::metadata(target.as_path()) {
            if metadata.is_file() {
                temp.as_file().set_permissions(metadata.permissions())?;
            }
        }

        debug!(target = %target, temp = %temp.path().display(), "Started atomic write");
        Ok(Self {
            target: target.clone(),
            temp,
        })
    }

    /// The file being written.
    pub fn file_mut(&mut self) -> &mut File {
        self.temp.as_file_mut()
    }

    /// Location of the temporary file, valid until commit or drop.
    pub fn temp_path(&self) -> &Path {
        self.temp.path()
    }

    pub fn target(&self) -> &CanonicalPath {
        &self.target
    }

    /// Flush, sync and move the temporary file onto the target.
    pub fn commit(self) -> io::Result<()> {
        let Self { target, mut temp } = self;

        temp.as_file_mut().flush()?;
        temp.as_file().sync_all()?;
        FileExt::unlock(temp.as_file())?;

        temp.persist(target.as_path()).map_err(|e| e.error)?;

        // Make the rename itself durable
        if let Some(parent) = target.as_path().parent() {
            if let Err(e) = File::open(parent).and_then(|dir| dir.sync_all()) {
                warn!(dir = %parent.display(), error = %e, "Failed to sync directory after rename");
            }
        }

        debug!(target = %target, "Committed atomic write");
        Ok(())
    }
}

impl Write for AtomicWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.temp.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.temp.flush()
    }
}

/// Replace `target` with `content` atomically.
pub fn write_atomic(target: &CanonicalPath, content: &[u8]) -> io::Result<()> {
    let mut writer = AtomicWriter::begin(target)?;
    writer.write_all(content)?;
    writer.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::files::sandbox::Sandbox;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Sandbox) {
        let temp = TempDir::new().unwrap();
        let sandbox = Sandbox::new(temp.path(), 255).unwrap();
        (temp, sandbox)
    }

    fn leftover_temp_files(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.starts_with(TEMP_PREFIX))
            .collect()
    }

    #[test]
    fn test_write_atomic_creates_file() {
        let (_temp, sandbox) = setup();
        let target = sandbox.resolve("nested/dir/out.txt").unwrap();

        write_atomic(&target, b"hello").unwrap();

        assert_eq!(fs::read(target.as_path()).unwrap(), b"hello");
        assert!(leftover_temp_files(sandbox.root()).is_empty());
    }

    #[test]
    fn test_write_atomic_replaces_file() {
        let (_temp, sandbox) = setup();
        let target = sandbox.resolve("out.txt").unwrap();
        fs::write(target.as_path(), b"old content").unwrap();

        write_atomic(&target, b"new").unwrap();

        assert_eq!(fs::read(target.as_path()).unwrap(), b"new");
    }

    #[test]
    fn test_drop_without_commit_leaves_target() {
        let (_temp, sandbox) = setup();
        let target = sandbox.resolve("out.txt").unwrap();
        fs::write(target.as_path(), b"original").unwrap();

        {
            let mut writer = AtomicWriter::begin(&target).unwrap();
            writer.write_all(b"partial").unwrap();
            assert!(writer.temp_path().exists());
        }

        assert_eq!(fs::read(target.as_path()).unwrap(), b"original");
        assert!(leftover_temp_files(sandbox.root()).is_empty());
    }

    #[test]
    fn test_drop_without_commit_new_target_absent() {
        let (_temp, sandbox) = setup();
        let target = sandbox.resolve("fresh.txt").unwrap();

        let mut writer = AtomicWriter::begin(&target).unwrap();
        writer.write_all(b"partial").unwrap();
        drop(writer);

        assert!(!target.as_path().exists());
        assert!(leftover_temp_files(sandbox.root()).is_empty());
    }

    #[test]
    fn test_panic_mid_write_cleans_up() {
        let (_temp, sandbox) = setup();
        let target = sandbox.resolve("out.txt").unwrap();
        fs::write(target.as_path(), b"original").unwrap();

        let result = std::panic::catch_unwind(|| {
            let mut writer = AtomicWriter::begin(&target).unwrap();
            writer.write_all(b"half").unwrap();
            panic!("interrupted");
        });

        assert!(result.is_err());
        assert_eq!(fs::read(target.as_path()).unwrap(), b"original");
        assert!(leftover_temp_files(sandbox.root()).is_empty());
    }

    #[test]
    fn test_temp_file_lives_next_to_target() {
        let (_temp, sandbox) = setup();
        let target = sandbox.resolve("sub/out.txt").unwrap();

        let writer = AtomicWriter::begin(&target).unwrap();
        assert_eq!(writer.temp_path().parent(), target.as_path().parent());
    }

    #[test]
    fn test_replacement_keeps_permissions() {
        let (_temp, sandbox) = setup();
        let target = sandbox.resolve("script.sh").unwrap();
        fs::write(target.as_path(), b"#!/bin/sh").unwrap();
        fs::set_permissions(target.as_path(), fs::Permissions::from_mode(0o755)).unwrap();

        write_atomic(&target, b"#!/bin/sh\necho hi").unwrap();

        let mode = fs::metadata(target.as_path()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o755);
    }
}
