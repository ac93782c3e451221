use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Args;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::info;

use feedhound_core::browser::{ChromiumDriverFactory, DriverFactory};
use feedhound_core::engine::{RecordSink, SinkError};
use feedhound_core::{
    EngineConfig, LoginPrompt, RawRecord, RunOrchestrator, RunOutcome, RunRequest, RunSummary,
};

use super::session::TerminalPrompt;
use crate::{cancel_on_interrupt, render, render_to, AppContext, AppError, DisplayFallback};
use crate::{OutputFormat, Result};

#[derive(Args, Debug, Clone)]
pub struct RunArgs {
    /// Feed URL to extract from
    #[arg(long)]
    pub url: String,
    /// Stop after this many records (0 runs until the feed is exhausted)
    #[arg(long)]
    pub quota: Option<usize>,
    /// Run the browser without a window
    #[arg(long, conflicts_with = "headed")]
    pub headless: bool,
    /// Run the browser with a visible window
    #[arg(long)]
    pub headed: bool,
    /// Write records here instead of stdout
    #[arg(short, long)]
    pub output: Option<PathBuf>,
    /// Seed for scroll pacing
    #[arg(long)]
    pub seed: Option<u64>,
}

impl RunArgs {
    /// Resolves `--headless/--headed` against the configured default.
    pub fn headless(&self, default: bool) -> bool {
        if self.headed {
            false
        } else {
            self.headless || default
        }
    }

    pub fn request(&self, config: &EngineConfig) -> RunRequest {
        RunRequest {
            target_url: self.url.clone(),
            quota: self.quota.unwrap_or(0),
            headless: self.headless(config.chromium.headless),
        }
    }
}

/// Writes each record as one JSON document per line.
pub struct JsonLinesSink<W> {
    writer: W,
    written: usize,
}

impl<W> JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(writer: W) -> Self {
        Self { writer, written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

#[async_trait]
impl<W> RecordSink for JsonLinesSink<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn accept(&mut self, batch: Vec<RawRecord>) -> std::result::Result<(), SinkError> {
        for record in &batch {
            let mut line = serde_json::to_vec(record)?;
            line.push(b'\n');
            self.writer.write_all(&line).await?;
        }
        self.writer.flush().await?;
        self.written += batch.len();
        Ok(())
    }

    async fn finish(&mut self, _summary: &RunSummary) -> std::result::Result<(), SinkError> {
        self.writer.flush().await?;
        Ok(())
    }
}

pub async fn execute(context: &AppContext, args: &RunArgs, format: OutputFormat) -> Result<()> {
    let config = Arc::clone(context.config());
    let factory: Arc<dyn DriverFactory> =
        Arc::new(ChromiumDriverFactory::new(Arc::clone(&config))?);
    let prompt: Arc<dyn LoginPrompt> = Arc::new(TerminalPrompt::stdin());
    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let summary = match &args.output {
        Some(path) => {
            let file = tokio::fs::File::create(path).await?;
            let mut sink = JsonLinesSink::new(BufWriter::new(file));
            let summary = extract(config, factory, prompt, args, cancel, &mut sink).await?;
            info!(records = sink.written(), path = %path.display(), "records written");
            render(&summary, format)?;
            summary
        }
        None => {
            let mut sink = JsonLinesSink::new(tokio::io::stdout());
            let summary = extract(config, factory, prompt, args, cancel, &mut sink).await?;
            render_to(&mut io::stderr().lock(), &summary, format)?;
            summary
        }
    };
    outcome_status(&summary.outcome)
}

/// One orchestrated run into `sink`.
pub async fn extract(
    config: Arc<EngineConfig>,
    factory: Arc<dyn DriverFactory>,
    prompt: Arc<dyn LoginPrompt>,
    args: &RunArgs,
    cancel: CancellationToken,
    sink: &mut dyn RecordSink,
) -> Result<RunSummary> {
    let request = args.request(&config);
    let mut orchestrator = RunOrchestrator::new(config, factory, prompt)?.with_cancellation(cancel);
    if let Some(seed) = args.seed {
        orchestrator = orchestrator.with_seed(seed);
    }
    Ok(orchestrator.run(request, sink).await)
}

fn outcome_status(outcome: &RunOutcome) -> Result<()> {
    match outcome {
        RunOutcome::Success | RunOutcome::Exhausted => Ok(()),
        RunOutcome::Cancelled => Err(AppError::Interrupted),
        RunOutcome::Error { message, .. } => Err(AppError::RunFailed(message.clone())),
    }
}

impl DisplayFallback for RunSummary {
    fn display(&self) -> String {
        let outcome = match &self.outcome {
            RunOutcome::Success => "success".to_string(),
            RunOutcome::Exhausted => "exhausted".to_string(),
            RunOutcome::Cancelled => "cancelled".to_string(),
            RunOutcome::Error { kind, message } => format!("error ({kind:?}): {message}"),
        };
        let session = match self.session {
            Some(origin) => format!("{origin:?}"),
            None => "-".to_string(),
        };
        let metrics = &self.metrics;
        [
            format!("run {}: {outcome}", self.run_id),
            format!(
                "  records: {} (posts {}, comments {})",
                self.records, self.posts, self.comments
            ),
            format!("  session: {session}"),
            format!(
                "  scrolls: {} stalls: {} overlays dismissed: {} stabilization timeouts: {}",
                metrics.scrolls,
                metrics.stalls,
                metrics.overlays_dismissed,
                metrics.stabilization_timeouts
            ),
            format!(
                "  degraded fields: {} duplicates skipped: {}",
                metrics.field_degradations, metrics.duplicates_skipped
            ),
            format!("  elapsed: {}ms", self.elapsed_ms),
        ]
        .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feedhound_core::session::SessionStore;
    use feedhound_core::testing::{FakeFeed, FeedScript, ScriptedPrompt};
    use feedhound_core::LoginDecision;
    use serde_json::Value;

    fn args(quota: usize) -> RunArgs {
        RunArgs {
            url: "https://feed.test/groups/fake".into(),
            quota: Some(quota),
            headless: true,
            headed: false,
            output: None,
            seed: Some(3),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn writes_one_json_line_per_record() {
        let temp = tempfile::tempdir().unwrap();
        let config = Arc::new(FakeFeed::engine_config(temp.path()));
        let feed = FakeFeed::new(FeedScript::with_posts(12));
        SessionStore::new(config.session_state_path())
            .save(&feed.valid_session())
            .unwrap();
        let mut sink = JsonLinesSink::new(Vec::new());

        let summary = extract(
            config,
            Arc::new(feed),
            Arc::new(ScriptedPrompt::new(LoginDecision::Abort)),
            &args(6),
            CancellationToken::new(),
            &mut sink,
        )
        .await
        .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Success);
        assert_eq!(sink.written(), 6);
        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<Value> = output
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 6);
        assert_eq!(lines[0]["kind"], "post");
        assert_eq!(lines[0]["source_id"], "10000");
        assert!(outcome_status(&summary.outcome).is_ok());
    }

    #[test]
    fn error_outcomes_fail_the_command() {
        let outcome = RunOutcome::Error {
            kind: feedhound_core::ErrorKind::Navigation,
            message: "primary view not reached".into(),
        };
        assert!(matches!(outcome_status(&outcome), Err(AppError::RunFailed(_))));
        assert!(matches!(
            outcome_status(&RunOutcome::Cancelled),
            Err(AppError::Interrupted)
        ));
        assert!(outcome_status(&RunOutcome::Exhausted).is_ok());
    }

    #[test]
    fn headless_flag_resolution() {
        let mut args = args(0);
        args.headless = false;
        assert!(args.headless(true));
        assert!(!args.headless(false));
        args.headed = true;
        assert!(!args.headless(true));
    }
}
