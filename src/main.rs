//! Codeswarm CLI entry point.
//!
//! Runs a swarm against a goal. Until a provider/spawner backend is wired
//! in, execution uses the mock adapters (`--dry-run` is implied), which is
//! enough to exercise decomposition fallbacks, wave scheduling, budgets,
//! and the event stream end to end.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::Parser;

use codeswarm::adapters::{MockProvider, MockSpawner};
use codeswarm::infrastructure::config::ConfigLoader;
use codeswarm::infrastructure::logging::{self, LogConfig, LogFormat};
use codeswarm::services::orchestrator::{SwarmOrchestrator, SwarmRunContext};
use codeswarm::SwarmEvent;

#[derive(Parser, Debug)]
#[command(name = "codeswarm", about = "Multi-agent swarm orchestrator", version)]
struct Cli {
    /// The goal to decompose and execute.
    #[arg(long)]
    goal: String,

    /// Path to a YAML config file (defaults to .codeswarm/config.yaml).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Working directory the workers write into.
    #[arg(long, default_value = ".")]
    working_dir: PathBuf,

    /// Directory for run-state artifacts (swarm.state.json etc.).
    #[arg(long)]
    run_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Emit JSON logs instead of pretty console output.
    #[arg(long)]
    json_logs: bool,

    /// Print every swarm event to stdout as it happens.
    #[arg(long)]
    trace_events: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let _guard = logging::init(&LogConfig {
        level: cli.log_level.clone(),
        format: if cli.json_logs {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        log_dir: None,
    })?;

    let mut config = match &cli.config {
        Some(path) => ConfigLoader::load_from_file(path)?,
        None => ConfigLoader::load()?,
    };
    if let Some(run_root) = &cli.run_root {
        config.run_root = Some(run_root.clone());
        config.persist_events = true;
    }

    let ctx = SwarmRunContext::new(Arc::new(config), &cli.working_dir);
    let orchestrator = SwarmOrchestrator::new(
        ctx,
        Arc::new(MockProvider::new()),
        Arc::new(MockSpawner::succeeding(2_000)),
    );

    if cli.trace_events {
        orchestrator.event_bus().subscribe(Arc::new(|event: &SwarmEvent| {
            println!(
                "[{}] {} {}",
                event.timestamp.format("%H:%M:%S%.3f"),
                event.kind(),
                event.message
            );
        }));
    }

    let result = orchestrator.run(&cli.goal).await?;

    println!();
    println!(
        "run {}: {} ({})",
        orchestrator.run_id(),
        if result.success { "succeeded" } else { "failed" },
        result.reason.as_str()
    );
    println!(
        "tasks: {} completed, {} failed, {} skipped ({} degraded) across {} waves",
        result.stats.completed,
        result.stats.failed,
        result.stats.skipped,
        result.stats.degraded,
        result.stats.waves
    );
    println!(
        "tokens: {} (cost ${:.4}) in {} ms",
        result.stats.total_tokens, result.stats.total_cost_usd, result.duration_ms
    );
    if !result.artifacts.is_empty() {
        println!("artifacts: {}", result.artifacts.join(", "));
    }
    if !result.summary.is_empty() {
        println!("\n{}", result.summary);
    }

    std::process::exit(i32::from(!result.success));
}
