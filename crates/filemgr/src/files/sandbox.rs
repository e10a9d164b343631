//! Path resolution confined to a storage root.
//!
//! Every user-supplied path goes through [`Sandbox::resolve`] before any
//! filesystem access. The result is a [`CanonicalPath`], which can only be
//! constructed here and is guaranteed to lie at or below the storage root
//! after symlink resolution.

use std::ffi::OsStr;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;

use thiserror::Error;

/// Errors produced while resolving a sandboxed path.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// The path escapes its base directory.
    #[error("path traversal detected: {0}")]
    PathTraversal(String),

    /// The final path component is unacceptable.
    #[error("invalid filename: {0}")]
    InvalidFilename(String),

    /// The storage root could not be prepared.
    #[error("storage root {path}: {source}")]
    Root {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// An absolute, symlink-resolved path inside the storage root.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CanonicalPath(PathBuf);

impl CanonicalPath {
    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// Key used by the lock registry.
    pub fn key(&self) -> String {
        self.0.to_string_lossy().into_owned()
    }

    /// Final component of the path, empty for the filesystem root.
    pub fn file_name(&self) -> String {
        self.0
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

impl AsRef<Path> for CanonicalPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl fmt::Display for CanonicalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Kind of a directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    File,
    Directory,
    Symlink,
    Other,
}

impl fmt::Display for EntryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::File => "file",
            Self::Directory => "dir",
            Self::Symlink => "link",
            Self::Other => "other",
        };
        f.write_str(s)
    }
}

/// A directory entry with metadata.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    /// Entry name (not full path).
    pub name: String,
    pub entry_type: EntryType,
    /// Size in bytes (0 for anything but regular files).
    pub size: u64,
    pub modified: SystemTime,
}

/// Resolver that confines paths to a single storage root.
#[derive(Debug, Clone)]
pub struct Sandbox {
    root: PathBuf,
    max_filename_length: usize,
}

impl Sandbox {
    /// Create a sandbox over `root`, creating the directory if needed.
    ///
    /// The root is canonicalized once here and never changes afterwards.
    pub fn new(root: impl AsRef<Path>, max_filename_length: usize) -> Result<Self, SandboxError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|source| SandboxError::Root {
            path: root.to_path_buf(),
            source,
        })?;
        let root = fs::canonicalize(root).map_err(|source| SandboxError::Root {
            path: root.to_path_buf(),
            source,
        })?;

        Ok(Self {
            root,
            max_filename_length,
        })
    }

    /// The canonical storage root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn max_filename_length(&self) -> usize {
        self.max_filename_length
    }

    /// Resolve a root-relative path.
    ///
    /// An empty path (or `"."`) resolves to the root itself. The target does
    /// not need to exist.
    pub fn resolve(&self, relative: &str) -> Result<CanonicalPath, SandboxError> {
        resolve_under(&self.root, relative, self.max_filename_length).map(CanonicalPath)
    }

    /// Resolve `relative` against `base` and require the result to stay
    /// inside `base`.
    pub fn resolve_within(
        &self,
        base: &CanonicalPath,
        relative: &str,
    ) -> Result<CanonicalPath, SandboxError> {
        resolve_under(base.as_path(), relative, self.max_filename_length).map(CanonicalPath)
    }

    /// Root-relative, `/`-separated name of a resolved path.
    pub fn relative_name(&self, path: &CanonicalPath) -> String {
        path.as_path()
            .strip_prefix(&self.root)
            .map(|rel| {
                rel.components()
                    .map(|c| c.as_os_str().to_string_lossy())
                    .collect::<Vec<_>>()
                    .join("/")
            })
            .unwrap_or_default()
    }

    /// Check the final component of a path that is about to be written.
    pub fn validate_filename(&self, path: &CanonicalPath) -> Result<(), SandboxError> {
        let name = path.file_name();
        if name.is_empty() || path.as_path() == self.root {
            return Err(SandboxError::InvalidFilename(
                "path does not name a file".to_string(),
            ));
        }
        check_component_length(OsStr::new(&name), self.max_filename_length)
    }

    /// List the immediate children of a directory.
    ///
    /// Directories sort first, then entries by case-insensitive name.
    pub fn list(&self, dir: &CanonicalPath) -> Result<Vec<DirectoryEntry>, SandboxError> {
        let mut results = Vec::new();

        for entry_result in fs::read_dir(dir.as_path())? {
            let entry = match entry_result {
                Ok(e) => e,
                Err(_) => continue, // Skip entries we can't read
            };

            // Don't follow symlinks: a link may point outside the root
            let metadata = match fs::symlink_metadata(entry.path()) {
                Ok(m) => m,
                Err(_) => continue,
            };

            let file_type = metadata.file_type();
            let entry_type = if file_type.is_symlink() {
                EntryType::Symlink
            } else if file_type.is_dir() {
                EntryType::Directory
            } else if file_type.is_file() {
                EntryType::File
            } else {
                EntryType::Other
            };

            results.push(DirectoryEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                entry_type,
                size: if file_type.is_file() { metadata.len() } else { 0 },
                modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
            });
        }

        results.sort_by(|a, b| {
            let a_is_dir = a.entry_type == EntryType::Directory;
            let b_is_dir = b.entry_type == EntryType::Directory;
            match (a_is_dir, b_is_dir) {
                (true, false) => std::cmp::Ordering::Less,
                (false, true) => std::cmp::Ordering::Greater,
                _ => a.name.to_lowercase().cmp(&b.name.to_lowercase()),
            }
        });

        Ok(results)
    }
}

fn check_component_length(name: &OsStr, max: usize) -> Result<(), SandboxError> {
    let len = name.to_string_lossy().chars().count();
    if len > max {
        return Err(SandboxError::InvalidFilename(format!(
            "name is {len} characters, limit is {max}"
        )));
    }
    Ok(())
}

/// Lexically normalize `relative`, join it onto `base`, resolve symlinks in
/// the existing part and verify the result stays under `base`.
fn resolve_under(base: &Path, relative: &str, max_len: usize) -> Result<PathBuf, SandboxError> {
    let mut parts: Vec<&OsStr> = Vec::new();
    for component in Path::new(relative).components() {
        match component {
            Component::Prefix(_) | Component::RootDir => {
                return Err(SandboxError::PathTraversal(format!(
                    "absolute path not allowed: {relative}"
                )));
            }
            Component::CurDir => {}
            Component::ParentDir => {
                if parts.pop().is_none() {
                    return Err(SandboxError::PathTraversal(format!(
                        "path escapes its base directory: {relative}"
                    )));
                }
            }
            Component::Normal(part) => parts.push(part),
        }
    }

    if let Some(last) = parts.last() {
        check_component_length(last, max_len)?;
    }

    let joined = parts
        .iter()
        .fold(base.to_path_buf(), |acc, part| acc.join(part));
    let resolved = canonicalize_existing(&joined)?;

    if !resolved.starts_with(base) {
        return Err(SandboxError::PathTraversal(format!(
            "path resolves outside its base directory: {relative}"
        )));
    }

    Ok(resolved)
}

/// Canonicalize the longest existing ancestor of `path` and re-append the
/// remainder.
fn canonicalize_existing(path: &Path) -> Result<PathBuf, SandboxError> {
    let mut existing = path;
    let mut remainder: Vec<&OsStr> = Vec::new();

    loop {
        match fs::canonicalize(existing) {
            Ok(canonical) => {
                return Ok(remainder
                    .iter()
                    .rev()
                    .fold(canonical, |acc, part| acc.join(part)));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A dangling symlink would be followed on creation.
                if fs::symlink_metadata(existing).is_ok() {
                    return Err(SandboxError::PathTraversal(format!(
                        "dangling symlink: {}",
                        existing.display()
                    )));
                }
                match (existing.parent(), existing.file_name()) {
                    (Some(parent), Some(name)) => {
                        remainder.push(name);
                        existing = parent;
                    }
                    _ => return Err(SandboxError::Io(e)),
                }
            }
            Err(e) => return Err(SandboxError::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;
    use tempfile::TempDir;

    fn sandbox() -> (TempDir, Sandbox) {
        let temp = TempDir::new().unwrap();
        let sandbox = Sandbox::new(temp.path().join("root"), 255).unwrap();
        (temp, sandbox)
    }

    #[test]
    fn test_new_creates_root() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join("a/b/c");
        let sandbox = Sandbox::new(&root, 255).unwrap();
        assert!(root.is_dir());
        assert!(sandbox.root().is_absolute());
    }

    #[test]
    fn test_resolve_empty_is_root() {
        let (_temp, sandbox) = sandbox();
        assert_eq!(sandbox.resolve("").unwrap().as_path(), sandbox.root());
        assert_eq!(sandbox.resolve(".").unwrap().as_path(), sandbox.root());
    }

    #[test]
    fn test_resolve_missing_target() {
        let (_temp, sandbox) = sandbox();
        let path = sandbox.resolve("new/dir/file.txt").unwrap();
        assert_eq!(path.as_path(), sandbox.root().join("new/dir/file.txt"));
    }

    #[test]
    fn test_resolve_inner_parent_dir() {
        let (_temp, sandbox) = sandbox();
        let path = sandbox.resolve("a/../b.txt").unwrap();
        assert_eq!(path.as_path(), sandbox.root().join("b.txt"));
    }

    #[test]
    fn test_resolve_rejects_escape() {
        let (_temp, sandbox) = sandbox();
        for bad in ["..", "../etc/passwd", "a/../../x", "./../root2"] {
            assert!(
                matches!(sandbox.resolve(bad), Err(SandboxError::PathTraversal(_))),
                "{bad} should be rejected"
            );
        }
    }

    #[test]
    fn test_resolve_rejects_absolute() {
        let (_temp, sandbox) = sandbox();
        assert!(matches!(
            sandbox.resolve("/etc/passwd"),
            Err(SandboxError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_symlink_escape() {
        let (temp, sandbox) = sandbox();
        let outside = temp.path().join("outside");
        fs::create_dir(&outside).unwrap();
        fs::write(outside.join("secret.txt"), "secret").unwrap();
        symlink(&outside, sandbox.root().join("link")).unwrap();

        assert!(matches!(
            sandbox.resolve("link/secret.txt"),
            Err(SandboxError::PathTraversal(_))
        ));
        assert!(matches!(
            sandbox.resolve("link/new.txt"),
            Err(SandboxError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_resolve_rejects_dangling_symlink() {
        let (temp, sandbox) = sandbox();
        symlink(temp.path().join("nowhere"), sandbox.root().join("dangling")).unwrap();

        assert!(matches!(
            sandbox.resolve("dangling"),
            Err(SandboxError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_resolve_allows_internal_symlink() {
        let (_temp, sandbox) = sandbox();
        fs::create_dir(sandbox.root().join("real")).unwrap();
        symlink(sandbox.root().join("real"), sandbox.root().join("alias")).unwrap();

        let path = sandbox.resolve("alias/file.txt").unwrap();
        assert_eq!(path.as_path(), sandbox.root().join("real/file.txt"));
    }

    #[test]
    fn test_prefix_check_is_component_wise() {
        let temp = TempDir::new().unwrap();
        let sandbox = Sandbox::new(temp.path().join("foo"), 255).unwrap();
        fs::create_dir(temp.path().join("foobar")).unwrap();
        symlink(temp.path().join("foobar"), sandbox.root().join("sneaky")).unwrap();

        assert!(matches!(
            sandbox.resolve("sneaky/x"),
            Err(SandboxError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_filename_length_limit() {
        let temp = TempDir::new().unwrap();
        let sandbox = Sandbox::new(temp.path(), 8).unwrap();

        assert!(sandbox.resolve("12345678").is_ok());
        assert!(matches!(
            sandbox.resolve("123456789"),
            Err(SandboxError::InvalidFilename(_))
        ));
    }

    #[test]
    fn test_validate_filename_rejects_root() {
        let (_temp, sandbox) = sandbox();
        let root = sandbox.resolve("").unwrap();
        assert!(matches!(
            sandbox.validate_filename(&root),
            Err(SandboxError::InvalidFilename(_))
        ));
        assert!(sandbox
            .validate_filename(&sandbox.resolve("a.txt").unwrap())
            .is_ok());
    }

    #[test]
    fn test_resolve_within() {
        let (_temp, sandbox) = sandbox();
        let base = sandbox.resolve("out").unwrap();

        let inner = sandbox.resolve_within(&base, "x/y.txt").unwrap();
        assert!(inner.as_path().starts_with(base.as_path()));

        assert!(matches!(
            sandbox.resolve_within(&base, "../escape.txt"),
            Err(SandboxError::PathTraversal(_))
        ));
    }

    #[test]
    fn test_relative_name() {
        let (_temp, sandbox) = sandbox();
        let path = sandbox.resolve("docs/report.txt").unwrap();
        assert_eq!(sandbox.relative_name(&path), "docs/report.txt");
        assert_eq!(sandbox.relative_name(&sandbox.resolve("").unwrap()), "");
    }

    #[test]
    fn test_list_sorts_directories_first() {
        let (_temp, sandbox) = sandbox();
        let root = sandbox.root();
        fs::write(root.join("b.txt"), "bb").unwrap();
        fs::write(root.join("A.txt"), "a").unwrap();
        fs::create_dir(root.join("zdir")).unwrap();

        let entries = sandbox.list(&sandbox.resolve("").unwrap()).unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["zdir", "A.txt", "b.txt"]);
        assert_eq!(entries[0].entry_type, EntryType::Directory);
        assert_eq!(entries[2].size, 2);
    }

    #[test]
    fn test_list_reports_symlinks() {
        let (temp, sandbox) = sandbox();
        symlink(temp.path(), sandbox.root().join("out")).unwrap();

        let entries = sandbox.list(&sandbox.resolve("").unwrap()).unwrap();
        assert_eq!(entries[0].entry_type, EntryType::Symlink);
    }
}
