use serde::Serialize;
use thiserror::Error;

use super::sink::SinkError;
use crate::browser::BrowserError;
use crate::session::SessionError;

#[derive(Debug, Error)]
pub enum NavigationError {
    #[error("invalid feed url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("primary view not reached after {attempts} attempts: {last}")]
    Exhausted { attempts: usize, last: BrowserError },
    #[error("navigation cancelled")]
    Cancelled,
}

/// Why a run ended in [`RunOutcome::Error`](super::RunOutcome::Error).
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Navigation(#[from] NavigationError),
    #[error("browser backend failed: {0}")]
    Backend(#[from] BrowserError),
    #[error("record sink failed: {0}")]
    Sink(#[from] SinkError),
    #[error("run cancelled")]
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Session,
    Navigation,
    Backend,
    Sink,
}

impl RunError {
    /// `None` for cancellation, which is not an error outcome.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RunError::Session(SessionError::Cancelled)
            | RunError::Navigation(NavigationError::Cancelled)
            | RunError::Cancelled => None,
            RunError::Session(_) => Some(ErrorKind::Session),
            RunError::Navigation(_) => Some(ErrorKind::Navigation),
            RunError::Backend(_) => Some(ErrorKind::Backend),
            RunError::Sink(_) => Some(ErrorKind::Sink),
        }
    }
}
