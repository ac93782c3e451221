use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::Args;
use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use feedhound_core::browser::{
    ChromiumDriverFactory, DriverFactory, EngineMetrics, LaunchMode, RetryPolicy,
};
use feedhound_core::session::{ProbeVerdict, SessionOrigin};
use feedhound_core::{
    LoginDecision, LoginPrompt, LoginReason, LoginRequest, SessionManager, SessionStore,
};

use crate::{cancel_on_interrupt, AppContext, DisplayFallback, Result};

#[derive(Args, Debug, Clone)]
pub struct LoginArgs {
    /// Start without asking for confirmation first
    #[arg(long)]
    pub yes: bool,
}

#[derive(Args, Debug, Clone)]
pub struct CheckSessionArgs {
    /// Probe with a visible window
    #[arg(long)]
    pub headed: bool,
}

/// Asks the operator on the terminal before a manual login. An empty line
/// proceeds; `q`, `quit` or end of input aborts.
pub struct TerminalPrompt<R> {
    input: Mutex<BufReader<R>>,
}

impl TerminalPrompt<tokio::io::Stdin> {
    pub fn stdin() -> Self {
        Self::new(tokio::io::stdin())
    }
}

impl<R> TerminalPrompt<R>
where
    R: AsyncRead + Unpin + Send,
{
    pub fn new(input: R) -> Self {
        Self {
            input: Mutex::new(BufReader::new(input)),
        }
    }
}

#[async_trait]
impl<R> LoginPrompt for TerminalPrompt<R>
where
    R: AsyncRead + Unpin + Send,
{
    async fn login_required(&self, request: &LoginRequest) -> LoginDecision {
        let why = match request.reason {
            LoginReason::NoSession => "no saved session",
            LoginReason::ProbeFailed => "the saved session was rejected",
            LoginReason::Requested => "a fresh login was requested",
        };
        eprintln!(
            "Login required ({why}). A browser window will open at {}.\n\
             Log in there within {}s. Press Enter to continue or type q to abort.",
            request.login_url,
            request.timeout.as_secs()
        );
        let mut line = String::new();
        let mut input = self.input.lock().await;
        match input.read_line(&mut line).await {
            Ok(0) => LoginDecision::Abort,
            Ok(_) => match line.trim().to_ascii_lowercase().as_str() {
                "q" | "quit" | "abort" => LoginDecision::Abort,
                _ => LoginDecision::Proceed,
            },
            Err(err) => {
                warn!(error = %err, "failed to read login confirmation");
                LoginDecision::Abort
            }
        }
    }
}

/// Skips the question, for `login --yes`.
struct AlwaysProceed;

#[async_trait]
impl LoginPrompt for AlwaysProceed {
    async fn login_required(&self, request: &LoginRequest) -> LoginDecision {
        eprintln!(
            "Log in at {} within {}s.",
            request.login_url,
            request.timeout.as_secs()
        );
        LoginDecision::Proceed
    }
}

#[derive(Debug, Serialize)]
pub struct SessionReport {
    pub state_path: PathBuf,
    pub verdict: ProbeVerdict,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub origin: Option<SessionOrigin>,
    pub captured_at: Option<DateTime<Utc>>,
}

impl SessionReport {
    pub fn is_valid(&self) -> bool {
        self.verdict == ProbeVerdict::Valid
    }

    fn from_store(
        store: &SessionStore,
        verdict: ProbeVerdict,
        origin: Option<SessionOrigin>,
    ) -> Self {
        let captured_at = match store.load() {
            Ok(state) => state.map(|state| state.captured_at),
            Err(err) => {
                warn!(error = %err, "failed to read session state");
                None
            }
        };
        Self {
            state_path: store.path().to_path_buf(),
            verdict,
            origin,
            captured_at,
        }
    }
}

impl DisplayFallback for SessionReport {
    fn display(&self) -> String {
        let verdict = match self.verdict {
            ProbeVerdict::Valid => "valid",
            ProbeVerdict::LoginRequired => "login required",
        };
        let mut lines = vec![format!("session: {verdict}")];
        lines.push(format!("  state file: {}", self.state_path.display()));
        if let Some(captured_at) = self.captured_at {
            lines.push(format!("  captured at: {}", captured_at.to_rfc3339()));
        }
        lines.join("\n")
    }
}

fn manager(
    context: &AppContext,
    factory: Arc<dyn DriverFactory>,
    prompt: Arc<dyn LoginPrompt>,
) -> SessionManager {
    let config = context.config();
    SessionManager::new(
        factory,
        SessionStore::new(config.session_state_path()),
        prompt,
        config.session.clone(),
        RetryPolicy::new(config.retry.clone()),
    )
}

pub async fn login(context: &AppContext, args: &LoginArgs) -> Result<SessionReport> {
    let factory: Arc<dyn DriverFactory> =
        Arc::new(ChromiumDriverFactory::new(Arc::clone(context.config()))?);
    let prompt: Arc<dyn LoginPrompt> = if args.yes {
        Arc::new(AlwaysProceed)
    } else {
        Arc::new(TerminalPrompt::stdin())
    };
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    fresh_login(context, factory, prompt, &cancel).await
}

pub async fn fresh_login(
    context: &AppContext,
    factory: Arc<dyn DriverFactory>,
    prompt: Arc<dyn LoginPrompt>,
    cancel: &CancellationToken,
) -> Result<SessionReport> {
    let manager = manager(context, factory, prompt);
    let mut registry = context.registry()?;
    let mut metrics = EngineMetrics::default();
    let mut session = manager
        .manual_login(LoginReason::Requested, &mut registry, &mut metrics, cancel)
        .await?;
    if let Err(err) = session.driver.close().await {
        warn!(error = %err, "failed to close login window");
    }
    Ok(SessionReport::from_store(
        manager.store(),
        ProbeVerdict::Valid,
        Some(session.origin),
    ))
}

pub async fn check(context: &AppContext, args: &CheckSessionArgs) -> Result<SessionReport> {
    let factory: Arc<dyn DriverFactory> =
        Arc::new(ChromiumDriverFactory::new(Arc::clone(context.config()))?);
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());
    probe_session(context, factory, LaunchMode::from_headless(!args.headed), &cancel).await
}

pub async fn probe_session(
    context: &AppContext,
    factory: Arc<dyn DriverFactory>,
    mode: LaunchMode,
    cancel: &CancellationToken,
) -> Result<SessionReport> {
    let manager = manager(context, factory, Arc::new(AlwaysProceed));
    let mut registry = context.registry()?;
    let mut metrics = EngineMetrics::default();
    let verdict = manager
        .check(mode, &mut registry, &mut metrics, cancel)
        .await?;
    Ok(SessionReport::from_store(manager.store(), verdict, None))
}
