use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use super::state::{SessionState, SESSION_FORMAT_VERSION};
use super::{SessionError, SessionResult};
use crate::persist::write_atomic;

/// Durable home of the [`SessionState`]. Writes replace the file atomically;
/// the last writer wins.
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing, corrupt or outdated file all read as "no session"; only
    /// I/O failures other than absence are errors.
    pub fn load(&self) -> SessionResult<Option<SessionState>> {
        let content = match std::fs::read(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted session");
                return Ok(None);
            }
            Err(source) => {
                return Err(SessionError::Store {
                    source,
                    path: self.path.clone(),
                })
            }
        };
        let state: SessionState = match serde_json::from_slice(&content) {
            Ok(state) => state,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "ignoring corrupt session file");
                return Ok(None);
            }
        };
        if state.version != SESSION_FORMAT_VERSION {
            warn!(
                path = %self.path.display(),
                version = state.version,
                "ignoring session file with unsupported version"
            );
            return Ok(None);
        }
        Ok(Some(state))
    }

    pub fn save(&self, state: &SessionState) -> SessionResult<()> {
        let body = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.path, &body).map_err(|source| SessionError::Store {
            source,
            path: self.path.clone(),
        })?;
        debug!(path = %self.path.display(), backend = %state.backend, "session state persisted");
        Ok(())
    }

    /// Returns whether a file was removed.
    pub fn clear(&self) -> SessionResult<bool> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(source) => Err(SessionError::Store {
                source,
                path: self.path.clone(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn missing_file_is_no_session() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session.json"));
        assert!(store.load().unwrap().is_none());
        assert!(!store.clear().unwrap());
    }

    #[test]
    fn saved_state_loads_back() {
        let dir = tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("nested/session.json"));
        let state = SessionState::new("fake", json!({ "token": "abc" }));
        store.save(&state).unwrap();
        assert_eq!(store.load().unwrap(), Some(state));
        assert!(store.clear().unwrap());
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn corrupt_or_outdated_files_are_ignored() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.json");
        let store = SessionStore::new(&path);

        std::fs::write(&path, b"{ not json").unwrap();
        assert!(store.load().unwrap().is_none());

        let mut state = SessionState::new("fake", json!({}));
        state.version = SESSION_FORMAT_VERSION + 1;
        std::fs::write(&path, serde_json::to_vec(&state).unwrap()).unwrap();
        assert!(store.load().unwrap().is_none());
    }
}
