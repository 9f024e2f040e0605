//! Flowline daemon

mod engine;
mod runner;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use flowline_config::{SystemConfig, load_system_config, parse_pipeline};
use flowline_core::event::DomainEvent;
use flowline_core::flow::Flow;
use flowline_core::job::{Job, JobStatus, Trigger, Vars};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::engine::Engine;

#[derive(Parser)]
#[command(name = "flowlined")]
#[command(about = "Flowline job orchestrator daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// System configuration file (KDL)
    #[arg(long, env = "FLOWLINE_CONFIG")]
    config: Option<PathBuf>,

    /// PostgreSQL url; overrides the configuration file
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Number of local agents to run on this host
    #[arg(long, default_value_t = 1)]
    local_agents: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Serve every pipeline found in a directory
    Serve {
        /// Directory of pipeline files
        #[arg(short, long, default_value = "pipelines")]
        pipelines: PathBuf,

        /// Queue one job per pipeline at startup
        #[arg(long)]
        trigger: bool,
    },

    /// Run a single pipeline to completion
    Run {
        /// Path to the pipeline file
        path: PathBuf,

        /// Job variables as KEY=VALUE
        #[arg(short, long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },

    /// Validate a pipeline file
    Validate {
        /// Path to the pipeline file
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Commands::Validate { ref path } => validate(path),
        Commands::Serve {
            ref pipelines,
            trigger,
        } => {
            let config = load_config(&cli)?;
            serve(&config, cli.local_agents, pipelines, trigger).await
        }
        Commands::Run { ref path, ref vars } => {
            let config = load_config(&cli)?;
            run(&config, cli.local_agents, path, vars.iter().cloned().collect()).await
        }
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn load_config(cli: &Cli) -> Result<SystemConfig> {
    let mut config = match &cli.config {
        Some(path) => load_system_config(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => SystemConfig::default(),
    };
    if let Some(url) = &cli.database_url {
        config.database.url = Some(url.clone());
    }
    Ok(config)
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected KEY=VALUE, got '{}'", raw))
}

fn read_pipeline(path: &Path) -> Result<(Flow, String)> {
    let definition = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let tree = parse_pipeline(&definition)
        .with_context(|| format!("invalid pipeline {}", path.display()))?;
    Ok((Flow::from_name(tree.name), definition))
}

fn validate(path: &Path) -> Result<()> {
    let definition = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let tree = parse_pipeline(&definition)
        .with_context(|| format!("invalid pipeline {}", path.display()))?;

    println!("Pipeline '{}' is valid", tree.name);
    println!("  Steps: {}", tree.len());
    for node in &tree.steps {
        let mut flags = Vec::new();
        if node.allow_failure {
            flags.push("allow-failure");
        }
        if node.post {
            flags.push("post");
        }
        if flags.is_empty() {
            println!("    - {}", node.path);
        } else {
            println!("    - {} ({})", node.path, flags.join(", "));
        }
    }
    Ok(())
}

async fn serve(
    config: &SystemConfig,
    local_agents: usize,
    dir: &Path,
    trigger: bool,
) -> Result<()> {
    let mut pipelines = Vec::new();
    let entries =
        std::fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))?;
    for entry in entries {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "kdl") {
            pipelines.push(read_pipeline(&path)?);
        }
    }
    info!(count = pipelines.len(), dir = %dir.display(), "Pipelines loaded");

    let engine = Engine::start(config, local_agents).await?;
    let flows: Vec<Flow> = pipelines.iter().map(|(flow, _)| flow.clone()).collect();
    engine
        .service
        .init_flows(&flows)
        .await
        .context("failed to start flow queues")?;

    if trigger {
        for (flow, definition) in pipelines {
            let _ = engine
                .service
                .submit(flow, definition, Trigger::Manual, Vars::new());
        }
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Shutdown requested");
    engine.shutdown().await;
    Ok(())
}

async fn run(config: &SystemConfig, local_agents: usize, path: &Path, vars: Vars) -> Result<()> {
    if local_agents == 0 {
        bail!("run needs at least one local agent");
    }
    let (flow, definition) = read_pipeline(path)?;
    let engine = Engine::start(config, local_agents).await?;
    engine
        .service
        .on_flow_created(&flow)
        .await
        .context("failed to start flow queue")?;

    let mut events = engine.service.events().subscribe();
    let job = engine
        .service
        .run(&flow, &definition, Trigger::Manual, vars)
        .await
        .context("failed to start job")?;
    println!("Job #{} of '{}' queued", job.build_number, flow.name);

    let job = if job.is_terminal() {
        job
    } else {
        loop {
            match events.recv().await {
                Ok(DomainEvent::JobStatusChanged { job: changed })
                    if changed.id == job.id && changed.is_terminal() =>
                {
                    break *changed;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Event stream lagged, reloading job");
                    let current = engine.service.get(job.id).await?;
                    if current.is_terminal() {
                        break current;
                    }
                }
                Err(RecvError::Closed) => bail!("event stream closed before job finished"),
            }
        }
    };

    print_summary(&engine, &job).await?;
    engine.shutdown().await;

    if job.status != JobStatus::Success {
        bail!("job finished with {}", job.status);
    }
    Ok(())
}

async fn print_summary(engine: &Engine, job: &Job) -> Result<()> {
    let steps = engine.service.steps(job.id).await?;
    println!();
    println!("Job #{}: {}", job.build_number, job.status);
    if let Some(message) = &job.message {
        println!("  {}", message);
    }
    for step in steps {
        let duration = match (step.started_at, step.finished_at) {
            (Some(start), Some(end)) => format!(" ({}ms)", (end - start).num_milliseconds()),
            _ => String::new(),
        };
        println!("  {:<10} {}{}", step.status.to_string(), step.node_path, duration);
    }
    Ok(())
}
