use thiserror::Error;

pub type BrowserResult<T> = Result<T, BrowserError>;

#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("chromium launch failed: {0}")]
    Launch(String),
    #[error("cdp error: {0}")]
    Cdp(#[from] chromiumoxide::error::CdpError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("timeout waiting for {0}")]
    Timeout(String),
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("element {0} is no longer attached to the document")]
    Detached(u64),
    #[error("session state could not be restored: {0}")]
    State(String),
    #[error("page is closed")]
    Closed,
    #[error("unexpected error: {0}")]
    Unexpected(String),
}

impl BrowserError {
    /// The element went away between lookup and use, typically because the
    /// page re-rendered underneath us.
    pub fn is_detached(&self) -> bool {
        matches!(self, BrowserError::Detached(_))
    }
}

impl From<tokio::task::JoinError> for BrowserError {
    fn from(err: tokio::task::JoinError) -> Self {
        BrowserError::Unexpected(err.to_string())
    }
}
