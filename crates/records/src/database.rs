//! SQLite implementation of the record stores.
//!
//! This module provides:
//! - Schema management and migrations
//! - File record persistence
//! - The append-only operation log
//! - User accounts

use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult, Row};

use crate::error::{StoreError, StoreResult};
use crate::store::{FileRecordStore, OperationLog, UserStore};
use crate::types::{FileRecord, OperationRecord, OperationType, User, UserId};

/// Current schema version.
pub const CURRENT_SCHEMA_VERSION: i32 = 1;

impl ToSql for OperationType {
    fn to_sql(&self) -> SqliteResult<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for OperationType {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: String| FromSqlError::Other(e.into()))
    }
}

impl ToSql for UserId {
    fn to_sql(&self) -> SqliteResult<ToSqlOutput<'_>> {
        self.0.to_sql()
    }
}

impl FromSql for UserId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        i64::column_result(value).map(UserId)
    }
}

fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn file_from_row(row: &Row<'_>) -> SqliteResult<FileRecord> {
    Ok(FileRecord {
        id: row.get(0)?,
        file_name: row.get(1)?,
        user_id: row.get(2)?,
        file_size: row.get::<_, i64>(3)? as u64,
        created_at: row.get(4)?,
    })
}

fn operation_from_row(row: &Row<'_>) -> SqliteResult<OperationRecord> {
    Ok(OperationRecord {
        id: row.get(0)?,
        op_type: row.get(1)?,
        file_id: row.get(2)?,
        user_id: row.get(3)?,
        created_at: row.get(4)?,
    })
}

fn user_from_row(row: &Row<'_>) -> SqliteResult<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        created_at: row.get(3)?,
    })
}

/// Database wrapper providing all storage operations.
///
/// The connection sits behind a mutex so one `Database` can be shared by
/// every task in the process.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open or create a database at the given path.
    ///
    /// If the database doesn't exist, it will be created and migrations will be run.
    /// If it exists, any pending migrations will be applied.
    pub fn open<P: AsRef<Path>>(path: P) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StoreError::InvalidPath(format!(
                        "Failed to create directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        tracing::debug!(path = %path.display(), "Opened record database");
        Self::init(conn)
    }

    /// Open an in-memory database, for tests and throwaway sessions.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(mut conn: Connection) -> StoreResult<Self> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        run_migrations(&mut conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StoreError::LockPoisoned)
    }

    /// Get the current schema version.
    pub fn schema_version(&self) -> StoreResult<i32> {
        let conn = self.conn()?;
        schema_version(&conn)
    }
}

fn schema_version(conn: &Connection) -> StoreResult<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// Run all pending migrations.
fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    let current_version = schema_version(conn)?;

    if current_version > CURRENT_SCHEMA_VERSION {
        return Err(StoreError::Migration(format!(
            "database schema version {} is newer than supported version {}",
            current_version, CURRENT_SCHEMA_VERSION
        )));
    }

    if current_version < 1 {
        migrate_v1(conn)?;
        tracing::info!("Applied record schema migration v1");
    }

    Ok(())
}

/// Migration to version 1: users, files and the operation log.
///
/// The operation log deliberately has no foreign key to `files`: deleting a
/// file record must not remove its history.
fn migrate_v1(conn: &mut Connection) -> StoreResult<()> {
    let tx = conn.transaction()?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            username TEXT NOT NULL UNIQUE,
            password_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS files (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            file_name TEXT NOT NULL UNIQUE,
            user_id INTEGER NOT NULL,
            file_size INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            FOREIGN KEY (user_id) REFERENCES users(id) ON DELETE CASCADE
        )
        "#,
        [],
    )?;

    tx.execute(
        r#"
        CREATE TABLE IF NOT EXISTS operations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            op_type TEXT NOT NULL CHECK (op_type IN ('CREATE', 'UPDATE', 'DELETE')),
            file_id INTEGER NOT NULL,
            user_id INTEGER NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
        [],
    )?;

    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_operations_file_id ON operations(file_id)",
        [],
    )?;

    tx.execute(
        "CREATE INDEX IF NOT EXISTS idx_files_user_id ON files(user_id)",
        [],
    )?;

    tx.execute(&format!("PRAGMA user_version = {}", 1), [])?;

    tx.commit()?;
    Ok(())
}

impl FileRecordStore for Database {
    async fn create(&self, file_name: &str, user_id: UserId, size: u64) -> StoreResult<FileRecord> {
        let conn = self.conn()?;
        let created_at = now_secs();
        conn.execute(
            r#"
            INSERT INTO files (file_name, user_id, file_size, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![file_name, user_id, size as i64, created_at],
        )
        .map_err(|e| StoreError::from_insert(e, &format!("file '{}'", file_name)))?;

        Ok(FileRecord {
            id: conn.last_insert_rowid(),
            file_name: file_name.to_string(),
            user_id,
            file_size: size,
            created_at,
        })
    }

    async fn fetch_by_name(&self, file_name: &str) -> StoreResult<Option<FileRecord>> {
        let conn = self.conn()?;
        let record = conn
            .query_row(
                r#"
                SELECT id, file_name, user_id, file_size, created_at
                FROM files
                WHERE file_name = ?1
                "#,
                params![file_name],
                file_from_row,
            )
            .optional()?;
        Ok(record)
    }

    async fn update(&self, file_name: &str, size: u64) -> StoreResult<Option<FileRecord>> {
        let conn = self.conn()?;
        let rows_affected = conn.execute(
            "UPDATE files SET file_size = ?1 WHERE file_name = ?2",
            params![size as i64, file_name],
        )?;
        if rows_affected == 0 {
            return Ok(None);
        }

        let record = conn
            .query_row(
                r#"
                SELECT id, file_name, user_id, file_size, created_at
                FROM files
                WHERE file_name = ?1
                "#,
                params![file_name],
                file_from_row,
            )
            .optional()?;
        Ok(record)
    }

    async fn delete(&self, file_name: &str, user_id: UserId) -> StoreResult<bool> {
        let conn = self.conn()?;
        let rows_affected = conn.execute(
            "DELETE FROM files WHERE file_name = ?1 AND user_id = ?2",
            params![file_name, user_id],
        )?;
        Ok(rows_affected > 0)
    }
}

impl OperationLog for Database {
    async fn append(
        &self,
        op_type: OperationType,
        file_id: i64,
        user_id: UserId,
    ) -> StoreResult<OperationRecord> {
        let conn = self.conn()?;
        let created_at = now_secs();
        conn.execute(
            r#"
            INSERT INTO operations (op_type, file_id, user_id, created_at)
            VALUES (?1, ?2, ?3, ?4)
            "#,
            params![op_type, file_id, user_id, created_at],
        )?;

        Ok(OperationRecord {
            id: conn.last_insert_rowid(),
            op_type,
            file_id,
            user_id,
            created_at,
        })
    }

    async fn list(&self, limit: Option<u32>) -> StoreResult<Vec<OperationRecord>> {
        let conn = self.conn()?;
        // SQLite treats a negative LIMIT as "no limit".
        let limit = limit.map(i64::from).unwrap_or(-1);
        let mut stmt = conn.prepare(
            r#"
            SELECT id, op_type, file_id, user_id, created_at
            FROM operations
            ORDER BY id DESC
            LIMIT ?1
            "#,
        )?;

        let entries = stmt
            .query_map(params![limit], operation_from_row)?
            .collect::<SqliteResult<Vec<_>>>()?;

        Ok(entries)
    }
}

impl UserStore for Database {
    async fn create_user(&self, username: &str, password_hash: &str) -> StoreResult<User> {
        let conn = self.conn()?;
        let created_at = now_secs();
        conn.execute(
            r#"
            INSERT INTO users (username, password_hash, created_at)
            VALUES (?1, ?2, ?3)
            "#,
            params![username, password_hash, created_at],
        )
        .map_err(|e| StoreError::from_insert(e, &format!("user '{}'", username)))?;

        Ok(User {
            id: UserId(conn.last_insert_rowid()),
            username: username.to_string(),
            password_hash: password_hash.to_string(),
            created_at,
        })
    }

    async fn fetch_by_id(&self, id: UserId) -> StoreResult<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, username, password_hash, created_at FROM users WHERE id = ?1",
                params![id],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }

    async fn fetch_by_username(&self, username: &str) -> StoreResult<Option<User>> {
        let conn = self.conn()?;
        let user = conn
            .query_row(
                "SELECT id, username, password_hash, created_at FROM users WHERE username = ?1",
                params![username],
                user_from_row,
            )
            .optional()?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn db_with_user(name: &str) -> (Database, UserId) {
        let db = Database::open_in_memory().expect("Failed to create in-memory database");
        let user = db.create_user(name, "$argon2id$test").await.unwrap();
        (db, user.id)
    }

    #[test]
    fn test_in_memory_database() {
        let db = Database::open_in_memory().expect("Failed to create in-memory database");
        let version = db.schema_version().expect("Failed to get schema version");
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_open_creates_parent_directories() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("nested").join("records.db");

        let db = Database::open(&db_path).unwrap();
        assert!(db_path.exists());
        assert_eq!(db.schema_version().unwrap(), CURRENT_SCHEMA_VERSION);
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir.path().join("records.db");

        {
            let db = Database::open(&db_path).unwrap();
            let user = db.create_user("alice", "hash").await.unwrap();
            db.create("a.txt", user.id, 3).await.unwrap();
        }

        let db = Database::open(&db_path).unwrap();
        let record = db.fetch_by_name("a.txt").await.unwrap().unwrap();
        assert_eq!(record.file_size, 3);
    }

    #[tokio::test]
    async fn test_file_record_lifecycle() {
        let (db, alice) = db_with_user("alice").await;

        let created = db.create("docs/report.txt", alice, 128).await.unwrap();
        assert_eq!(created.file_name, "docs/report.txt");
        assert_eq!(created.user_id, alice);

        let fetched = db.fetch_by_name("docs/report.txt").await.unwrap().unwrap();
        assert_eq!(fetched, created);

        let updated = db.update("docs/report.txt", 512).await.unwrap().unwrap();
        assert_eq!(updated.id, created.id);
        assert_eq!(updated.file_size, 512);

        assert!(db.delete("docs/report.txt", alice).await.unwrap());
        assert!(db.fetch_by_name("docs/report.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_name_is_unique() {
        let (db, alice) = db_with_user("alice").await;

        db.create("a.txt", alice, 1).await.unwrap();
        let result = db.create("a.txt", alice, 2).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_update_missing_record() {
        let (db, _) = db_with_user("alice").await;
        assert!(db.update("missing.txt", 10).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_requires_owner() {
        let (db, alice) = db_with_user("alice").await;
        let bob = db.create_user("bob", "hash").await.unwrap().id;

        db.create("a.txt", alice, 1).await.unwrap();
        assert!(!db.delete("a.txt", bob).await.unwrap());
        assert!(db.fetch_by_name("a.txt").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_operation_log_survives_file_delete() {
        let (db, alice) = db_with_user("alice").await;

        let record = db.create("a.txt", alice, 1).await.unwrap();
        db.append(OperationType::Create, record.id, alice).await.unwrap();
        db.delete("a.txt", alice).await.unwrap();
        db.append(OperationType::Delete, record.id, alice).await.unwrap();

        let log = db.list(None).await.unwrap();
        assert_eq!(log.len(), 2);
        // Newest first
        assert_eq!(log[0].op_type, OperationType::Delete);
        assert_eq!(log[1].op_type, OperationType::Create);
        assert!(log.iter().all(|op| op.file_id == record.id));
    }

    #[tokio::test]
    async fn test_operation_log_limit() {
        let (db, alice) = db_with_user("alice").await;
        for i in 0..5 {
            db.append(OperationType::Update, i, alice).await.unwrap();
        }

        let log = db.list(Some(2)).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0].file_id, 4);
    }

    #[tokio::test]
    async fn test_users() {
        let db = Database::open_in_memory().unwrap();

        let alice = db.create_user("alice", "hash-a").await.unwrap();
        assert_eq!(
            db.fetch_by_username("alice").await.unwrap().unwrap().id,
            alice.id
        );
        assert_eq!(
            db.fetch_by_id(alice.id).await.unwrap().unwrap().username,
            "alice"
        );
        assert!(db.fetch_by_username("nobody").await.unwrap().is_none());

        let duplicate = db.create_user("alice", "hash-b").await;
        assert!(matches!(duplicate, Err(StoreError::Conflict(_))));
    }

    #[tokio::test]
    async fn test_file_record_requires_existing_user() {
        let db = Database::open_in_memory().unwrap();
        let result = db.create("a.txt", UserId(999), 1).await;
        assert!(result.is_err());
    }
}
