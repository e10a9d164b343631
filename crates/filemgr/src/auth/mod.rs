//! Authentication: user accounts and the local login session.
//!
//! A login stores the user id in a small JSON session file. Every file
//! manager action asks an [`Authenticator`] for the current user; the
//! [`SessionFile`] implementation answers from that file.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::Argon2;
use records::{StoreError, User, UserId, UserStore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Maximum username length in characters.
pub const MAX_USERNAME_LENGTH: usize = 255;

/// Errors that can occur during authentication.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error("user not found")]
    UserNotFound,

    #[error("login or password is incorrect")]
    InvalidPassword,

    #[error("invalid username: {0}")]
    InvalidUsername(String),

    #[error("password must not be empty")]
    EmptyPassword,

    #[error("user already exists: {0}")]
    UserExists(String),

    #[error("password hashing failed: {0}")]
    Hash(String),

    #[error("session file {}: {source}", .path.display())]
    Session {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("storage error: {0}")]
    Store(#[from] StoreError),
}

/// Source of the identity performing file operations.
pub trait Authenticator: Send + Sync {
    /// The logged-in user, or `None` when nobody is authenticated.
    fn current_user_id(&self) -> Option<UserId>;
}

#[derive(Debug, Serialize, Deserialize)]
struct SessionData {
    user_id: UserId,
}

/// Login session persisted as `{"user_id": n}`.
#[derive(Debug, Clone)]
pub struct SessionFile {
    path: PathBuf,
}

impl SessionFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record `user_id` as the logged-in user.
    pub fn store(&self, user_id: UserId) -> Result<(), AuthError> {
        let session_err = |source| AuthError::Session {
            path: self.path.clone(),
            source,
        };

        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent).map_err(session_err)?;

        let contents = serde_json::to_vec(&SessionData { user_id })
            .map_err(|e| session_err(io::Error::other(e)))?;

        // Atomic write: temp file in the same directory, then rename
        let mut temp = tempfile::NamedTempFile::new_in(parent).map_err(session_err)?;
        temp.write_all(&contents).map_err(session_err)?;
        temp.as_file().sync_all().map_err(session_err)?;
        temp.persist(&self.path).map_err(|e| session_err(e.error))?;

        debug!(path = %self.path.display(), user_id = %user_id, "Saved session");
        Ok(())
    }

    /// Remove the session. Returns whether one existed.
    pub fn clear(&self) -> Result<bool, AuthError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(AuthError::Session {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Authenticator for SessionFile {
    fn current_user_id(&self) -> Option<UserId> {
        let contents = match fs::read(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to read session file");
                return None;
            }
        };

        match serde_json::from_slice::<SessionData>(&contents) {
            Ok(data) => Some(data.user_id),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Ignoring corrupt session file");
                None
            }
        }
    }
}

/// Hash a password into a PHC string with a random salt.
pub fn hash_password(password: &str) -> Result<String, AuthError> {
    let salt = SaltString::encode_b64(&rand::random::<[u8; 16]>())
        .map_err(|e| AuthError::Hash(e.to_string()))?;
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| AuthError::Hash(e.to_string()))?;
    Ok(hash.to_string())
}

/// Check a password against a stored PHC hash.
pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok(),
        Err(e) => {
            warn!(error = %e, "Stored password hash is malformed");
            false
        }
    }
}

fn validate_username(username: &str) -> Result<(), AuthError> {
    if username.trim().is_empty() {
        return Err(AuthError::InvalidUsername("must not be empty".to_string()));
    }
    if username.chars().count() > MAX_USERNAME_LENGTH {
        return Err(AuthError::InvalidUsername(format!(
            "longer than {MAX_USERNAME_LENGTH} characters"
        )));
    }
    if username.chars().any(char::is_control) {
        return Err(AuthError::InvalidUsername(
            "contains control characters".to_string(),
        ));
    }
    Ok(())
}

/// Register a new user.
pub async fn create_user<S: UserStore>(
    store: &S,
    username: &str,
    password: &str,
) -> Result<User, AuthError> {
    validate_username(username)?;
    if password.is_empty() {
        return Err(AuthError::EmptyPassword);
    }

    let hash = hash_password(password)?;
    let user = store
        .create_user(username, &hash)
        .await
        .map_err(|e| match e {
            StoreError::Conflict(_) => AuthError::UserExists(username.to_string()),
            other => AuthError::Store(other),
        })?;

    info!(user_id = %user.id, username = %user.username, "Created user");
    Ok(user)
}

/// Verify credentials and start a session.
pub async fn login<S: UserStore>(
    store: &S,
    session: &SessionFile,
    username: &str,
    password: &str,
) -> Result<User, AuthError> {
    let user = store
        .fetch_by_username(username)
        .await?
        .ok_or(AuthError::UserNotFound)?;

    if !verify_password(password, &user.password_hash) {
        warn!(username = %username, "Rejected login with wrong password");
        return Err(AuthError::InvalidPassword);
    }

    session.store(user.id)?;
    info!(user_id = %user.id, "User logged in");
    Ok(user)
}

/// End the current session. Returns whether a session existed.
pub fn logout(session: &SessionFile) -> Result<bool, AuthError> {
    let existed = session.clear()?;
    if existed {
        info!("User logged out");
    }
    Ok(existed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use records::Database;
    use tempfile::TempDir;

    #[test]
    fn test_hash_and_verify() {
        let hash = hash_password("s3cret").unwrap();
        assert!(hash.starts_with("$argon2"));
        assert!(verify_password("s3cret", &hash));
        assert!(!verify_password("wrong", &hash));
    }

    #[test]
    fn test_hashes_are_salted() {
        assert_ne!(hash_password("same").unwrap(), hash_password("same").unwrap());
    }

    #[test]
    fn test_verify_malformed_hash() {
        assert!(!verify_password("anything", "not-a-hash"));
    }

    #[test]
    fn test_session_roundtrip() {
        let temp = TempDir::new().unwrap();
        let session = SessionFile::new(temp.path().join("state/session.json"));

        assert_eq!(session.current_user_id(), None);
        session.store(UserId(7)).unwrap();
        assert_eq!(session.current_user_id(), Some(UserId(7)));

        let raw = fs::read_to_string(session.path()).unwrap();
        assert_eq!(raw, r#"{"user_id":7}"#);

        assert!(session.clear().unwrap());
        assert!(!session.clear().unwrap());
        assert_eq!(session.current_user_id(), None);
    }

    #[test]
    fn test_corrupt_session_is_unauthenticated() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("session.json");
        fs::write(&path, "{not json").unwrap();

        assert_eq!(SessionFile::new(path).current_user_id(), None);
    }

    #[tokio::test]
    async fn test_create_user_and_login() {
        let temp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let session = SessionFile::new(temp.path().join("session.json"));

        let user = create_user(&db, "alice", "pw").await.unwrap();
        assert_ne!(user.password_hash, "pw");

        let logged_in = login(&db, &session, "alice", "pw").await.unwrap();
        assert_eq!(logged_in.id, user.id);
        assert_eq!(session.current_user_id(), Some(user.id));

        assert!(logout(&session).unwrap());
        assert_eq!(session.current_user_id(), None);
    }

    #[tokio::test]
    async fn test_login_failures() {
        let temp = TempDir::new().unwrap();
        let db = Database::open_in_memory().unwrap();
        let session = SessionFile::new(temp.path().join("session.json"));
        create_user(&db, "alice", "pw").await.unwrap();

        assert!(matches!(
            login(&db, &session, "bob", "pw").await,
            Err(AuthError::UserNotFound)
        ));
        assert!(matches!(
            login(&db, &session, "alice", "nope").await,
            Err(AuthError::InvalidPassword)
        ));
        assert_eq!(session.current_user_id(), None);
    }

    #[tokio::test]
    async fn test_create_user_validation() {
        let db = Database::open_in_memory().unwrap();

        assert!(matches!(
            create_user(&db, "", "pw").await,
            Err(AuthError::InvalidUsername(_))
        ));
        assert!(matches!(
            create_user(&db, &"x".repeat(256), "pw").await,
            Err(AuthError::InvalidUsername(_))
        ));
        assert!(matches!(
            create_user(&db, "alice", "").await,
            Err(AuthError::EmptyPassword)
        ));

        create_user(&db, "alice", "pw").await.unwrap();
        assert!(matches!(
            create_user(&db, "alice", "pw2").await,
            Err(AuthError::UserExists(_))
        ));
    }
}
