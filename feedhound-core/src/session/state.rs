use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const SESSION_FORMAT_VERSION: u32 = 1;

/// Serialized authentication context. The payload is opaque outside the
/// backend that produced it.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    pub version: u32,
    pub backend: String,
    pub captured_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl SessionState {
    pub fn new(backend: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            version: SESSION_FORMAT_VERSION,
            backend: backend.into(),
            captured_at: Utc::now(),
            payload,
        }
    }

    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.captured_at
    }
}

// Payloads hold live credentials; keep them out of logs.
impl fmt::Debug for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionState")
            .field("version", &self.version)
            .field("backend", &self.backend)
            .field("captured_at", &self.captured_at)
            .field("payload", &"<redacted>")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn debug_output_hides_payload() {
        let state = SessionState::new("chromium", json!({ "cookies": [{ "value": "secret" }] }));
        let rendered = format!("{state:?}");
        assert!(rendered.contains("chromium"));
        assert!(!rendered.contains("secret"));
    }
}
