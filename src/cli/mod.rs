//! CLI commands for voxqueue using clap.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::auth::{AuthTokenCache, Credentials, HttpCredentialIssuer};
use crate::broker::{BrokerConsumer, JsonLinesConsumer};
use crate::config::{get_settings_path, load_settings_or_default, Settings};
use crate::core::Message;
use crate::pipeline::{
    OrchestratorResult, PostProcessingStrategy, Strategy, StrategyOrchestrator, ValidationStrategy,
};
use crate::worker::WorkerPool;

/// voxqueue - priority message worker for speech requests.
#[derive(Parser)]
#[command(name = "voxqueue")]
#[command(version)]
#[command(about = "voxqueue - prioritized, strategy-driven message worker", long_about = None)]
pub struct Commands {
    /// Settings file (defaults to ~/.voxqueue/settings.json)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Process JSON-lines messages until end of input or Ctrl+C
    Run {
        /// Read messages from a file instead of stdin
        #[arg(long)]
        input: Option<PathBuf>,
    },

    /// Run one message through the pipeline and print the result
    Check {
        /// File holding one JSON message
        file: PathBuf,
    },

    /// Show effective settings (secrets masked)
    Config,

    /// Log in against the auth endpoint and show the token expiry
    Token,
}

impl Commands {
    /// Run the command.
    pub async fn run(&self) -> Result<()> {
        let settings = load_settings_or_default(self.config.as_deref());
        match &self.command {
            Command::Run { input } => cmd_run(&settings, input.as_deref()).await,
            Command::Check { file } => cmd_check(&settings, file).await,
            Command::Config => cmd_config(&settings, self.config.as_deref()),
            Command::Token => cmd_token(&settings).await,
        }
    }
}

/// Built-in stages, filtered by the settings' enable flags.
pub fn build_orchestrator(settings: &Settings) -> Result<StrategyOrchestrator> {
    let strategies: Vec<Arc<dyn Strategy>> = vec![
        Arc::new(ValidationStrategy::new(&settings.validation)?),
        Arc::new(PostProcessingStrategy::new()),
    ];
    Ok(StrategyOrchestrator::with_enabled(strategies, &settings.strategies)?)
}

// Command implementations

async fn cmd_run(settings: &Settings, input: Option<&Path>) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(settings)?);
    let pool = WorkerPool::from_settings(settings, orchestrator);
    pool.start().await?;

    println!(
        "voxqueue worker running with {} processors (Ctrl+C to stop)",
        settings.worker.concurrency
    );

    match input {
        Some(path) => {
            let file = tokio::fs::File::open(path)
                .await
                .with_context(|| format!("Could not open {}", path.display()))?;
            consume_until_interrupted(&pool, JsonLinesConsumer::new(file)).await;
        }
        None => consume_until_interrupted(&pool, JsonLinesConsumer::new(tokio::io::stdin())).await,
    }

    let stats = pool.shutdown(settings.worker.drain_timeout()).await;
    println!("{}", stats);
    Ok(())
}

async fn consume_until_interrupted<C: BrokerConsumer>(pool: &WorkerPool, consumer: C) {
    tokio::select! {
        queued = pool.consume(consumer) => {
            tracing::info!(queued, "Input finished, shutting down");
        }
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("Interrupt received, shutting down"),
            Err(e) => tracing::error!("Failed to listen for Ctrl+C: {}", e),
        },
    }
}

/// Run the message in `file` through a fresh pipeline.
pub async fn check_file(settings: &Settings, file: &Path) -> Result<OrchestratorResult> {
    let body = tokio::fs::read(file)
        .await
        .with_context(|| format!("Could not read {}", file.display()))?;
    let message = Message::from_slice(&body)?;

    let orchestrator = build_orchestrator(settings)?;
    orchestrator.setup_all().await?;
    let result = orchestrator.run(&message).await;
    orchestrator.teardown_all().await;
    Ok(result)
}

async fn cmd_check(settings: &Settings, file: &Path) -> Result<()> {
    let result = check_file(settings, file).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    if !result.success {
        bail!("Message {} did not pass the pipeline", result.message_id);
    }
    Ok(())
}

fn cmd_config(settings: &Settings, explicit: Option<&Path>) -> Result<()> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => get_settings_path()?,
    };
    let exists = if path.exists() { "" } else { " (not found, using defaults)" };
    println!("Settings file: {}{}", path.display(), exists);
    println!("{}", serde_json::to_string_pretty(&settings.redacted())?);
    Ok(())
}

async fn cmd_token(settings: &Settings) -> Result<()> {
    let auth = &settings.auth;
    if !auth.has_credentials() {
        bail!("auth.email and auth.password must be set (or AUTH_EMAIL / AUTH_PASSWORD)");
    }

    let issuer = HttpCredentialIssuer::new(auth.url.clone(), auth.timeout())?;
    let cache = AuthTokenCache::new(
        Arc::new(issuer),
        Credentials::new(auth.email.clone(), auth.password.clone()),
        auth.refresh_margin(),
    );

    let token = cache.get_token().await?;
    let remaining = token.remaining(chrono::Utc::now());
    println!("Login successful for {}", auth.email);
    println!("  Expires at: {}", token.expires_at().to_rfc3339());
    println!("  Remaining:  {} min", remaining.num_minutes());
    println!("  State:      {:?}", cache.state());
    Ok(())
}
