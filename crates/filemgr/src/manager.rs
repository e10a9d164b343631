//! The file manager: authenticated, sandboxed, audited file actions.
//!
//! Every action checks the current user, resolves its paths through the
//! [`Sandbox`] and serializes access per path through the
//! [`LockRegistry`]. Mutations are written atomically, then reflected in the
//! file record store, then appended to the operation log.

use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use records::{FileRecord, FileRecordStore, OperationLog, OperationType, StoreError, UserId};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{info, warn};
use zip::ZipArchive;

use crate::auth::Authenticator;
use crate::error::{FileOpError, Result};
use crate::files::archive::{self, ArchiveLimits, ArchiveSummary, ExtractSummary};
use crate::files::{
    decode, write_atomic, CanonicalPath, Decoded, DirectoryEntry, LockRegistry, ReadFormat,
    Sandbox,
};

/// Where the content of a write comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteSource {
    /// In-memory content.
    Bytes(Vec<u8>),
    /// A file on the local filesystem, outside the storage root.
    LocalFile(PathBuf),
    /// Standard input, read to the end.
    Stdin,
}

/// Result of a successful write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub record: FileRecord,
    /// `Create` for a new record, `Update` for an existing one.
    pub op_type: OperationType,
}

/// Facade over the secure file primitives.
pub struct FileManager<S, A> {
    sandbox: Sandbox,
    limits: ArchiveLimits,
    store: S,
    auth: A,
    locks: Arc<LockRegistry>,
}

impl<S, A> FileManager<S, A>
where
    S: FileRecordStore + OperationLog,
    A: Authenticator,
{
    /// Create a file manager using the process-wide lock registry.
    pub fn new(sandbox: Sandbox, limits: ArchiveLimits, store: S, auth: A) -> Self {
        Self {
            sandbox,
            limits,
            store,
            auth,
            locks: LockRegistry::global(),
        }
    }

    /// Use a dedicated lock registry instead of the global one.
    pub fn with_lock_registry(mut self, locks: Arc<LockRegistry>) -> Self {
        self.locks = locks;
        self
    }

    pub fn sandbox(&self) -> &Sandbox {
        &self.sandbox
    }

    pub fn limits(&self) -> &ArchiveLimits {
        &self.limits
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn locks(&self) -> &LockRegistry {
        &self.locks
    }

    fn require_user(&self) -> Result<UserId> {
        self.auth
            .current_user_id()
            .ok_or(FileOpError::Unauthenticated)
    }

    /// List the immediate children of a directory.
    pub async fn list(&self, path: &str) -> Result<Vec<DirectoryEntry>> {
        self.require_user()?;
        let dir = self.sandbox.resolve(path)?;

        let metadata = match tokio::fs::metadata(dir.as_path()).await {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(FileOpError::NotFound(dir.as_path().to_path_buf()))
            }
            Err(e) => return Err(FileOpError::io(format!("failed to stat {dir}"), e)),
        };
        if !metadata.is_dir() {
            return Err(FileOpError::NotADirectory(dir.as_path().to_path_buf()));
        }

        Ok(self.sandbox.list(&dir)?)
    }

    /// Read a file and decode it in the requested format.
    pub async fn read(&self, path: &str, format: ReadFormat) -> Result<Decoded> {
        self.require_user()?;
        let target = self.sandbox.resolve(path)?;

        let size = self.existing_size(&target).await?;
        let limit = self.limits.max_upload_size;
        if size > limit {
            return Err(FileOpError::TooLarge { size, limit });
        }

        let lock = self.locks.lock_for(&target);
        let _guard = lock.lock().await;

        let file = tokio::fs::File::open(target.as_path())
            .await
            .map_err(|e| not_found_or_io(e, &target, "failed to open"))?;
        let bytes = read_capped(file, limit)
            .await
            .map_err(|e| FileOpError::io(format!("failed to read {target}"), e))?;
        if bytes.len() as u64 > limit {
            // Grew since it was checked
            return Err(FileOpError::TooLarge {
                size: bytes.len() as u64,
                limit,
            });
        }

        Ok(decode(&bytes, format)?)
    }

    /// Replace the content of a file, creating it if needed.
    ///
    /// Only the owner of an existing file may overwrite it.
    pub async fn write(&self, path: &str, source: WriteSource) -> Result<WriteOutcome> {
        let user = self.require_user()?;
        let target = self.sandbox.resolve(path)?;
        self.sandbox.validate_filename(&target)?;
        let name = self.sandbox.relative_name(&target);

        let lock = self.locks.lock_for(&target);
        let _guard = lock.lock().await;

        let existing = self.store.fetch_by_name(&name).await?;
        if let Some(record) = &existing {
            if !record.is_owned_by(user) {
                warn!(path = %name, user_id = %user, "Rejected write to file owned by another user");
                return Err(FileOpError::PermissionDenied(format!(
                    "'{name}' belongs to another user"
                )));
            }
        }

        let content = self.read_source(source).await?;
        write_atomic(&target, &content)
            .map_err(|e| FileOpError::io(format!("failed to write {target}"), e))?;
        let size = content.len() as u64;

        let (record, op_type) = match existing {
            Some(_) => match self.store.update(&name, size).await? {
                Some(record) => (record, OperationType::Update),
                None => (self.store.create(&name, user, size).await?, OperationType::Create),
            },
            None => (self.store.create(&name, user, size).await?, OperationType::Create),
        };
        self.store.append(op_type, record.id, user).await?;

        info!(path = %name, user_id = %user, size, op = %op_type, "Wrote file");
        Ok(WriteOutcome { record, op_type })
    }

    /// Create a new file. Fails if the file already exists.
    pub async fn create_file(&self, path: &str, content: &[u8]) -> Result<FileRecord> {
        let user = self.require_user()?;
        let target = self.sandbox.resolve(path)?;
        self.sandbox.validate_filename(&target)?;
        let name = self.sandbox.relative_name(&target);

        let size = content.len() as u64;
        let limit = self.limits.max_upload_size;
        if size > limit {
            return Err(FileOpError::TooLarge { size, limit });
        }

        let lock = self.locks.lock_for(&target);
        let _guard = lock.lock().await;

        let exists_on_disk = tokio::fs::symlink_metadata(target.as_path()).await.is_ok();
        if exists_on_disk || self.store.fetch_by_name(&name).await?.is_some() {
            return Err(FileOpError::AlreadyExists(target.as_path().to_path_buf()));
        }

        write_atomic(&target, content)
            .map_err(|e| FileOpError::io(format!("failed to write {target}"), e))?;

        let record = self
            .store
            .create(&name, user, size)
            .await
            .map_err(|e| match e {
                StoreError::Conflict(_) => FileOpError::AlreadyExists(target.as_path().to_path_buf()),
                other => FileOpError::Storage(other),
            })?;
        self.store
            .append(OperationType::Create, record.id, user)
            .await?;

        info!(path = %name, user_id = %user, size, "Created file");
        Ok(record)
    }

    /// Delete a file owned by the current user.
    pub async fn delete(&self, path: &str) -> Result<FileRecord> {
        let user = self.require_user()?;
        let target = self.sandbox.resolve(path)?;
        if tokio::fs::symlink_metadata(target.as_path()).await.is_err() {
            return Err(FileOpError::NotFound(target.as_path().to_path_buf()));
        }
        let name = self.sandbox.relative_name(&target);

        let lock = self.locks.lock_for(&target);
        let _guard = lock.lock().await;

        let record = match self.store.fetch_by_name(&name).await? {
            Some(record) if record.is_owned_by(user) => record,
            _ => {
                warn!(path = %name, user_id = %user, "Rejected delete of file not owned by user");
                return Err(FileOpError::PermissionDenied(format!(
                    "'{name}' is not owned by the current user"
                )));
            }
        };

        tokio::fs::remove_file(target.as_path())
            .await
            .map_err(|e| not_found_or_io(e, &target, "failed to delete"))?;
        self.store.delete(&name, user).await?;
        self.store
            .append(OperationType::Delete, record.id, user)
            .await?;

        info!(path = %name, user_id = %user, "Deleted file");
        Ok(record)
    }

    /// Zip `src` (a directory or a single file) into the new archive `dst`.
    pub async fn create_zip(&self, src: &str, dst: &str) -> Result<ArchiveSummary> {
        self.require_user()?;
        let source = self.sandbox.resolve(src)?;
        let dest = self.sandbox.resolve(dst)?;
        self.sandbox.validate_filename(&dest)?;

        let lock = self.locks.lock_for(&dest);
        let _guard = lock.lock().await;

        if tokio::fs::symlink_metadata(dest.as_path()).await.is_ok() {
            return Err(FileOpError::AlreadyExists(dest.as_path().to_path_buf()));
        }
        if tokio::fs::symlink_metadata(source.as_path()).await.is_err() {
            return Err(FileOpError::NotFound(source.as_path().to_path_buf()));
        }

        Ok(archive::create_archive(&source, &dest, &self.limits)?)
    }

    /// Extract an archive into `outdir` after inspecting it.
    ///
    /// The whole archive is validated before the first file is written.
    pub async fn extract_zip(&self, zip: &str, outdir: &str) -> Result<ExtractSummary> {
        let user = self.require_user()?;
        let zip_path = self.sandbox.resolve(zip)?;
        let outdir = self.sandbox.resolve(outdir)?;

        let file = File::open(zip_path.as_path())
            .map_err(|e| not_found_or_io(e, &zip_path, "failed to open"))?;
        let mut zip = ZipArchive::new(file).map_err(archive::ArchiveError::from)?;

        let plan = match archive::plan_extraction(&mut zip, &self.sandbox, &outdir, &self.limits) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(archive = %zip_path, error = %e, "Refusing to extract archive");
                return Err(e.into());
            }
        };

        // Hold every target's guard for the whole extraction. Taking them in
        // path order keeps concurrent extractions from deadlocking.
        let mut targets: Vec<&CanonicalPath> = plan
            .iter()
            .filter(|p| !p.entry.is_dir)
            .map(|p| &p.target)
            .collect();
        targets.sort_by(|a, b| a.as_path().cmp(b.as_path()));
        targets.dedup();
        let locks: Vec<_> = targets.iter().map(|t| self.locks.lock_for(t)).collect();
        let mut guards = Vec::with_capacity(locks.len());
        for lock in &locks {
            guards.push(lock.lock().await);
        }

        // Never overwrite another user's file
        for target in &targets {
            let name = self.sandbox.relative_name(target);
            if let Some(record) = self.store.fetch_by_name(&name).await? {
                if !record.is_owned_by(user) {
                    warn!(
                        archive = %zip_path,
                        path = %name,
                        user_id = %user,
                        "Rejected extraction over file owned by another user"
                    );
                    return Err(FileOpError::PermissionDenied(format!(
                        "archive would overwrite '{name}' owned by another user"
                    )));
                }
            }
        }

        let summary = archive::extract_planned(&mut zip, &plan, &outdir)?;
        drop(guards);
        Ok(summary)
    }

    async fn existing_size(&self, target: &CanonicalPath) -> Result<u64> {
        tokio::fs::metadata(target.as_path())
            .await
            .map(|m| m.len())
            .map_err(|e| not_found_or_io(e, target, "failed to stat"))
    }

    async fn read_source(&self, source: WriteSource) -> Result<Vec<u8>> {
        let limit = self.limits.max_upload_size;
        let bytes = match source {
            WriteSource::Bytes(bytes) => bytes,
            WriteSource::LocalFile(path) => {
                let file = tokio::fs::File::open(&path).await.map_err(|e| {
                    if e.kind() == io::ErrorKind::NotFound {
                        FileOpError::NotFound(path.clone())
                    } else {
                        FileOpError::io(format!("failed to open {}", path.display()), e)
                    }
                })?;
                let size = file
                    .metadata()
                    .await
                    .map_err(|e| FileOpError::io(format!("failed to stat {}", path.display()), e))?
                    .len();
                if size > limit {
                    return Err(FileOpError::TooLarge { size, limit });
                }
                read_capped(file, limit)
                    .await
                    .map_err(|e| FileOpError::io(format!("failed to read {}", path.display()), e))?
            }
            WriteSource::Stdin => read_capped(tokio::io::stdin(), limit)
                .await
                .map_err(|e| FileOpError::io("failed to read standard input", e))?,
        };

        let size = bytes.len() as u64;
        if size > limit {
            return Err(FileOpError::TooLarge { size, limit });
        }
        Ok(bytes)
    }
}

/// Read at most `limit + 1` bytes, enough to tell whether `limit` is exceeded.
async fn read_capped<R: AsyncRead + Unpin>(reader: R, limit: u64) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    reader
        .take(limit.saturating_add(1))
        .read_to_end(&mut buf)
        .await?;
    Ok(buf)
}

fn not_found_or_io(err: io::Error, path: &CanonicalPath, action: &str) -> FileOpError {
    if err.kind() == io::ErrorKind::NotFound {
        FileOpError::NotFound(path.as_path().to_path_buf())
    } else {
        FileOpError::io(format!("{action} {path}"), err)
    }
}
