//! Narrow persistence interfaces consumed by the file manager.
//!
//! Each trait covers one concern so that callers only depend on what they
//! use. [`crate::Database`] implements all of them; tests may substitute
//! their own implementations.

use crate::error::StoreResult;
use crate::types::{FileRecord, OperationRecord, OperationType, User, UserId};

/// Storage for per-file ownership and size metadata.
///
/// File names are unique: at most one record exists per name.
#[allow(async_fn_in_trait)]
pub trait FileRecordStore: Send + Sync {
    /// Inserts a new record.
    ///
    /// Fails with [`crate::StoreError::Conflict`] if the name is taken.
    async fn create(&self, file_name: &str, user_id: UserId, size: u64)
        -> StoreResult<FileRecord>;

    /// Looks up the record for `file_name`, if any.
    async fn fetch_by_name(&self, file_name: &str) -> StoreResult<Option<FileRecord>>;

    /// Sets the size of an existing record and returns the updated row.
    async fn update(&self, file_name: &str, size: u64) -> StoreResult<Option<FileRecord>>;

    /// Removes the record for `file_name` if it belongs to `user_id`.
    ///
    /// Returns whether a row was removed.
    async fn delete(&self, file_name: &str, user_id: UserId) -> StoreResult<bool>;
}

/// Append-only audit log of file mutations.
#[allow(async_fn_in_trait)]
pub trait OperationLog: Send + Sync {
    /// Appends one entry. Entries are never updated or removed.
    async fn append(
        &self,
        op_type: OperationType,
        file_id: i64,
        user_id: UserId,
    ) -> StoreResult<OperationRecord>;

    /// Returns the most recent entries, newest first.
    async fn list(&self, limit: Option<u32>) -> StoreResult<Vec<OperationRecord>>;
}

/// Registered user accounts.
#[allow(async_fn_in_trait)]
pub trait UserStore: Send + Sync {
    /// Registers a user with an already-hashed password.
    async fn create_user(&self, username: &str, password_hash: &str) -> StoreResult<User>;

    async fn fetch_by_id(&self, id: UserId) -> StoreResult<Option<User>>;

    async fn fetch_by_username(&self, username: &str) -> StoreResult<Option<User>>;
}
