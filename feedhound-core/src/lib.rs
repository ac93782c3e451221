pub mod browser;
pub mod config;
pub mod engine;
pub mod error;
pub mod extract;
pub mod persist;
pub mod selectors;
pub mod session;
pub mod testing;

pub use config::{load_engine_config, EngineConfig};
pub use engine::{
    ErrorKind, RecordSink, RunError, RunOrchestrator, RunOutcome, RunRequest, RunState,
    RunSummary, SinkError, VecSink,
};
pub use error::{ConfigError, Result};
pub use extract::{RawRecord, RecordKind};
pub use selectors::{SelectorError, SelectorRegistry};
pub use session::{
    LoginDecision, LoginPrompt, LoginReason, LoginRequest, SessionError, SessionManager,
    SessionOrigin, SessionStore,
};
