use std::io::{self, IsTerminal, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use stepflow_core::config::EngineConfig;
use stepflow_core::event::EventBus;

use stepflow_engine::{
    EventBusObserver, RunLogger, TracingObserver, WorkflowEngine, WorkflowManifest,
};

#[derive(Parser)]
#[command(name = "stepflow", version, about = "Run graph workflows with retry, timeout and fallback policies")]
struct Cli {
    /// Path to engine config file
    #[arg(short, long, default_value = "stepflow.toml", env = "STEPFLOW_CONFIG")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a workflow manifest and print its output
    Run {
        /// Workflow manifest (TOML)
        workflow: PathBuf,
        /// Run input as JSON; anything that isn't valid JSON is taken as a string.
        /// Read from stdin when omitted and stdin is not a terminal.
        #[arg(short, long)]
        input: Option<String>,
        /// Override the per-node visit limit
        #[arg(long)]
        max_visits: Option<usize>,
        /// Print the full final context instead of just the output value
        #[arg(long)]
        full: bool,
    },
    /// Validate a workflow manifest and describe its graph
    Inspect {
        /// Workflow manifest (TOML)
        workflow: PathBuf,
    },
    /// Show the effective engine configuration
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("stepflow=info,warn")),
        )
        .with_writer(io::stderr)
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Inspect { workflow } => {
            inspect(&workflow, &config)?;
        }
        Commands::Run {
            workflow,
            input,
            max_visits,
            full,
        } => {
            let input = match input {
                Some(raw) => parse_input(&raw),
                None => read_stdin_input()?,
            };
            run_workflow(&workflow, input, max_visits, full, &config).await?;
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<EngineConfig> {
    if path.exists() {
        return Ok(EngineConfig::load(path)?);
    }

    // Check for config in the home directory
    if let Some(home_config) = dirs_home().map(|h| h.join(".stepflow").join("config.toml")) {
        if home_config.exists() {
            info!(path = %home_config.display(), "Loading config from home directory");
            return Ok(EngineConfig::load(&home_config)?);
        }
    }

    Ok(EngineConfig::default())
}

async fn run_workflow(
    workflow: &Path,
    input: Value,
    max_visits: Option<usize>,
    full: bool,
    config: &EngineConfig,
) -> anyhow::Result<()> {
    let manifest = WorkflowManifest::load(workflow)
        .with_context(|| format!("loading workflow {}", workflow.display()))?;
    let graph = manifest.build_graph(config)?;

    let mut engine = WorkflowEngine::with_config(graph, config);
    if let Some(limit) = max_visits {
        engine = engine.with_max_visits(limit);
    }
    engine.add_observer(Arc::new(TracingObserver));

    // Optional JSONL run log, fed from the event bus
    let cancel = CancellationToken::new();
    let logger = config.log_dir().map(|dir| {
        let bus = Arc::new(EventBus::new(config.engine.event_bus_capacity));
        engine.add_observer(Arc::new(EventBusObserver::new(bus.clone())));
        let level = config.log.as_ref().map(|l| l.level).unwrap_or(2);
        let rx = bus.subscribe();
        tokio::spawn(RunLogger::new(dir, level).run(rx, cancel.clone()))
    });

    let result = engine.execute(input).await;

    cancel.cancel();
    if let Some(handle) = logger {
        match handle.await {
            Ok(Some(path)) => info!(path = %path.display(), "Run log written"),
            Ok(None) => warn!("Run log could not be written"),
            Err(e) => warn!(error = %e, "Run logger task failed"),
        }
    }

    let report = result?;
    eprintln!("[path: {}] ({}ms)", report.path, report.elapsed_ms);
    let shown = if full {
        report.context.to_json()
    } else {
        report.output
    };
    println!("{}", serde_json::to_string_pretty(&shown)?);
    Ok(())
}

fn inspect(workflow: &Path, config: &EngineConfig) -> anyhow::Result<()> {
    let manifest = WorkflowManifest::load(workflow)
        .with_context(|| format!("loading workflow {}", workflow.display()))?;
    let graph = manifest.build_graph(config)?;

    println!("Workflow: {}", manifest.name.as_deref().unwrap_or("(unnamed)"));
    if let Some(desc) = &manifest.description {
        println!("  {}", desc);
    }
    println!("Start: {}", graph.start_node_id());
    println!("Output key: {}", graph.output_key());

    println!("\nNodes ({}):", manifest.nodes.len());
    for spec in &manifest.nodes {
        let mut policies = Vec::new();
        if let Some(retry) = spec.retry {
            policies.push(format!(
                "retry {}x/{}ms",
                retry.max_attempts,
                retry.delay.as_millis()
            ));
        }
        if let Some(timeout) = graph.node(&spec.id).and_then(|n| n.timeout()) {
            policies.push(format!("timeout {}ms", timeout.as_millis()));
        }
        if spec.fallback.is_some() {
            policies.push("fallback".to_string());
        }
        let kind = spec.builtin()?.kind();
        if policies.is_empty() {
            println!("  {:<20} {}", spec.id, kind);
        } else {
            println!("  {:<20} {} [{}]", spec.id, kind, policies.join(", "));
        }
    }

    println!("\nEdges ({}):", manifest.edges.len());
    for edge in &manifest.edges {
        let condition = edge.when.as_deref().unwrap_or("always");
        match &edge.label {
            Some(label) => println!("  {} -> {} ({}) \"{}\"", edge.from, edge.to, condition, label),
            None => println!("  {} -> {} ({})", edge.from, edge.to, condition),
        }
    }

    if graph.node(graph.start_node_id()).is_none() {
        println!("\nWarning: start node '{}' is not declared", graph.start_node_id());
    }
    let dangling = graph.dangling_targets();
    if !dangling.is_empty() {
        println!("\nWarning: edges reference undeclared nodes: {}", dangling.join(", "));
    }

    Ok(())
}

fn parse_input(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn read_stdin_input() -> anyhow::Result<Value> {
    let stdin = io::stdin();
    if stdin.is_terminal() {
        return Ok(Value::Null);
    }
    let mut raw = String::new();
    stdin.lock().read_to_string(&mut raw)?;
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(Value::Null);
    }
    Ok(parse_input(raw))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var("HOME").ok().map(PathBuf::from)
}
