//! Authentication lifecycle: persisted state, validity probing and the
//! operator-driven login fallback.

mod manager;
mod state;
mod store;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::browser::BrowserError;

pub use manager::{
    LoginDecision, LoginPrompt, LoginReason, LoginRequest, ProbeVerdict, SessionManager,
    SessionOrigin, ValidatedSession,
};
pub use state::{SessionState, SESSION_FORMAT_VERSION};
pub use store::SessionStore;

pub type SessionResult<T> = Result<T, SessionError>;

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("login was not completed within {}s", waited.as_secs())]
    LoginAbandoned { waited: Duration },
    #[error("operator declined to log in")]
    LoginDeclined,
    #[error("session store {path}: {source}")]
    Store { source: io::Error, path: PathBuf },
    #[error("failed to encode session state: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("browser backend failed: {0}")]
    Backend(#[from] BrowserError),
    #[error("session acquisition cancelled")]
    Cancelled,
}
