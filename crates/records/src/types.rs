//! Record types shared between the store and the file manager.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Identifier of a registered user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub i64);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kind of mutation recorded in the operation log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OperationType {
    /// A new file was created.
    Create,
    /// An existing file was overwritten.
    Update,
    /// A file was removed.
    Delete,
}

impl OperationType {
    /// Storage representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

/// Metadata for a tracked file inside the storage root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Row identifier.
    pub id: i64,
    /// Root-relative path of the file, `/`-separated.
    pub file_name: String,
    /// Owner of the file.
    pub user_id: UserId,
    /// Size in bytes as of the last successful write.
    pub file_size: u64,
    /// Unix timestamp of creation.
    pub created_at: i64,
}

impl FileRecord {
    /// Whether `user` owns this record.
    pub fn is_owned_by(&self, user: UserId) -> bool {
        self.user_id == user
    }
}

/// One entry of the append-only audit log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
    pub id: i64,
    pub op_type: OperationType,
    pub file_id: i64,
    pub user_id: UserId,
    /// Unix timestamp at which the entry was appended.
    pub created_at: i64,
}

/// A registered user account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    pub username: String,
    /// PHC-formatted password hash. Never the plain password.
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub created_at: i64,
}
