//! # filemgr records
//!
//! Durable state for the filemgr file manager.
//!
//! ## Overview
//!
//! The file manager keeps three kinds of records next to the files it
//! manages:
//!
//! - **File records**: owner and size of every tracked file, keyed by its
//!   path relative to the storage root
//! - **Operation log**: an append-only audit trail of creates, updates and
//!   deletes
//! - **Users**: accounts with argon2 password hashes
//!
//! The [`store`] module defines one narrow async trait per concern, and
//! [`Database`] implements all of them on top of SQLite.
//!
//! ## Example Usage
//!
//! ```rust
//! use records::{Database, FileRecordStore, OperationLog, OperationType, UserStore};
//!
//! # tokio_test_block(async {
//! let db = Database::open_in_memory().unwrap();
//! let user = db.create_user("alice", "$argon2id$...").await.unwrap();
//!
//! let record = db.create("notes/todo.txt", user.id, 42).await.unwrap();
//! db.append(OperationType::Create, record.id, user.id).await.unwrap();
//!
//! assert_eq!(db.list(None).await.unwrap().len(), 1);
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f);
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`types`]: Record types
//! - [`store`]: Storage traits
//! - [`database`]: SQLite implementation
//! - [`error`]: Error types

pub mod database;
pub mod error;
pub mod store;
pub mod types;

pub use database::{Database, CURRENT_SCHEMA_VERSION};
pub use error::{StoreError, StoreResult};
pub use store::{FileRecordStore, OperationLog, UserStore};
pub use types::{FileRecord, OperationRecord, OperationType, User, UserId};
