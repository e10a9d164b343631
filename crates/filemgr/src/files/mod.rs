//! Secure file primitives.
//!
//! This module provides the building blocks used by the file manager:
//! - Path resolution confined to the storage root
//! - Atomic file replacement using temp files
//! - Per-path async locking
//! - Zip archive inspection, extraction and creation
//! - Decoding of read results
//!
//! # Security
//!
//! Every path is resolved through the [`Sandbox`] before use. Symlinks are
//! resolved before the containment check, and archive entries are resolved
//! inside their output directory before anything is extracted.

pub mod archive;
pub mod atomic;
pub mod decode;
pub mod locks;
pub mod sandbox;

pub use archive::{ArchiveEntry, ArchiveError, ArchiveLimits, ArchiveSummary, ExtractSummary};
pub use atomic::{write_atomic, AtomicWriter};
pub use decode::{decode, DecodeError, Decoded, ReadFormat};
pub use locks::LockRegistry;
pub use sandbox::{CanonicalPath, DirectoryEntry, EntryType, Sandbox, SandboxError};
