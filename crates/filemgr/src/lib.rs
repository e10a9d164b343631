//! # filemgr
//!
//! A secure, authenticated file manager confined to a single storage root.
//!
//! ## Overview
//!
//! filemgr lets logged-in users list, read, write, create, delete and
//! archive files below a configured storage root, and keeps an audit trail
//! of every mutation. The core provides:
//!
//! - **Path Sandboxing**: every path is resolved, symlinks included, and
//!   must stay inside the storage root
//! - **Atomic Writes**: content goes to a temp file that is synced and
//!   renamed over the target
//! - **Per-Path Locking**: operations on the same file are serialized
//! - **Archive Inspection**: zip bombs and zip-slip entries are refused
//!   before anything is extracted
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        FileManager                          │
//! ├──────────────┬──────────────┬──────────────┬────────────────┤
//! │   Sandbox    │ LockRegistry │ AtomicWriter │    Archive     │
//! ├──────────────┴──────────────┴──────────────┴────────────────┤
//! │        Authenticator        │   records (SQLite store)      │
//! └─────────────────────────────┴───────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use filemgr::auth::SessionFile;
//! use filemgr::files::{ReadFormat, Sandbox};
//! use filemgr::{Config, FileManager};
//! use records::Database;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load_default()?;
//!     let sandbox = Sandbox::new(&config.storage.root, config.storage.max_filename_length)?;
//!     let db = Database::open(config.database_path())?;
//!     let session = SessionFile::new(config.session_path());
//!
//!     let manager = FileManager::new(sandbox, config.limits(), db, session);
//!     manager.create_file("notes/todo.txt", b"buy milk").await?;
//!     println!("{}", manager.read("notes/todo.txt", ReadFormat::Text).await?);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`files`]: Sandbox, atomic writer, lock registry, archives, decoding
//! - [`manager`]: The file manager facade
//! - [`auth`]: Users, password hashing and the login session
//! - [`config`]: Configuration loading and defaults
//! - [`system`]: Disk usage
//! - [`error`]: Error types

pub mod auth;
pub mod config;
pub mod error;
pub mod files;
pub mod manager;
pub mod system;

// Re-export records for convenience
pub use records;

pub use auth::{Authenticator, SessionFile};
pub use config::Config;
pub use error::{FileOpError, Result};
pub use manager::{FileManager, WriteOutcome, WriteSource};
