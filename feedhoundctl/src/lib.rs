use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{CommandFactory, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use feedhound_core::browser::BrowserError;
use feedhound_core::{load_engine_config, EngineConfig, SelectorError, SelectorRegistry};

pub mod commands;

use commands::run::RunArgs;
use commands::selectors::SelectorsCommands;
use commands::session::{CheckSessionArgs, LoginArgs};

pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("config error: {0}")]
    Config(#[from] feedhound_core::ConfigError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("browser error: {0}")]
    Browser(#[from] BrowserError),
    #[error("selector error: {0}")]
    Selector(#[from] SelectorError),
    #[error("session error: {0}")]
    Session(#[from] feedhound_core::SessionError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("run failed: {0}")]
    RunFailed(String),
    #[error("run interrupted")]
    Interrupted,
    #[error("persisted session is not valid; run `feedhoundctl login`")]
    SessionInvalid,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "feedhound extraction engine control interface", long_about = None)]
pub struct Cli {
    /// Path to engine.toml
    #[arg(long, default_value = "configs/engine.toml")]
    pub config: PathBuf,
    /// Directory relative state paths resolve against (overrides paths.base_dir)
    #[arg(long)]
    pub base_dir: Option<PathBuf>,
    /// Session state file (overrides paths.session_state)
    #[arg(long)]
    pub session_state: Option<PathBuf>,
    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Extract records from a feed as JSON lines
    Run(RunArgs),
    /// Log in by hand in a visible browser and persist the session
    Login(LoginArgs),
    /// Probe the persisted session without prompting
    CheckSession(CheckSessionArgs),
    /// Inspect the selector table
    #[command(subcommand)]
    Selectors(SelectorsCommands),
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

/// Installs the stderr log subscriber; stdout is reserved for output.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("feedhound_core=info,feedhoundctl=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

pub async fn run(cli: Cli) -> Result<()> {
    if let Commands::Completions { shell } = &cli.command {
        clap_complete::generate(
            *shell,
            &mut Cli::command(),
            "feedhoundctl",
            &mut io::stdout(),
        );
        return Ok(());
    }
    let context = AppContext::new(&cli)?;

    match &cli.command {
        Commands::Run(args) => commands::run::execute(&context, args, cli.format).await?,
        Commands::Login(args) => {
            let report = commands::session::login(&context, args).await?;
            render(&report, cli.format)?;
        }
        Commands::CheckSession(args) => {
            let report = commands::session::check(&context, args).await?;
            render(&report, cli.format)?;
            if !report.is_valid() {
                return Err(AppError::SessionInvalid);
            }
        }
        Commands::Selectors(SelectorsCommands::Show) => {
            let table = commands::selectors::show(&context)?;
            render(&table, cli.format)?;
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn render<T>(value: &T, format: OutputFormat) -> Result<()>
where
    T: Serialize + DisplayFallback,
{
    render_to(&mut io::stdout().lock(), value, format)
}

fn render_to<W, T>(out: &mut W, value: &T, format: OutputFormat) -> Result<()>
where
    W: Write,
    T: Serialize + DisplayFallback,
{
    match format {
        OutputFormat::Text => writeln!(out, "{}", value.display())?,
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(value)?;
            writeln!(out, "{json}")?;
        }
    }
    Ok(())
}

trait DisplayFallback {
    fn display(&self) -> String;
}

#[derive(Debug)]
pub struct AppContext {
    config: Arc<EngineConfig>,
    config_path: PathBuf,
}

impl AppContext {
    pub fn new(cli: &Cli) -> Result<Self> {
        let mut config = load_engine_config(&cli.config)?;
        if let Some(base_dir) = &cli.base_dir {
            config.paths.base_dir = base_dir.to_string_lossy().into_owned();
        }
        if let Some(path) = &cli.session_state {
            config.paths.session_state = absolute(path)?.to_string_lossy().into_owned();
        }
        config.validate().map_err(AppError::Invalid)?;
        Ok(Self {
            config: Arc::new(config),
            config_path: cli.config.clone(),
        })
    }

    pub fn config(&self) -> &Arc<EngineConfig> {
        &self.config
    }

    pub fn config_path(&self) -> &Path {
        &self.config_path
    }

    /// Catalogue plus overrides plus learned entries, as a run would see it.
    pub fn registry(&self) -> Result<SelectorRegistry> {
        let mut registry = SelectorRegistry::from_config(&self.config)?;
        let path = self.config.learned_selectors_path();
        match registry.load_learned(&path) {
            Ok(merged) if merged > 0 => {
                info!(targets = merged, path = %path.display(), "applied learned selectors")
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "ignoring learned selectors"),
        }
        Ok(registry)
    }
}

fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// Cancels `token` on the first Ctrl-C.
fn cancel_on_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing the current step");
            token.cancel();
        }
    });
}
