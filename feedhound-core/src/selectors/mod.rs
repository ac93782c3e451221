//! Named, self-healing element lookups.
//!
//! Every logical target ("post container", "close button", ...) maps to an
//! ordered list of candidate locators. Resolution tries them in order and the
//! first one that matches moves to the front, so markup drift that breaks the
//! preferred candidate is absorbed after a single miss.

mod defaults;
mod locator;
mod registry;

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub use defaults::{default_catalogue, targets};
pub use locator::Locator;
pub use registry::{CandidateHealth, SelectorRegistry, SelectorSpec};

#[derive(Debug, Error)]
pub enum SelectorError {
    #[error("selector target '{0}' has no candidates")]
    EmptyCandidates(String),
    #[error("malformed locator '{raw}': {reason}")]
    Malformed { raw: String, reason: String },
    #[error("failed to access learned selectors {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("learned selectors {path} are not valid: {source}")]
    Parse {
        source: serde_json::Error,
        path: PathBuf,
    },
}
