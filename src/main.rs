mod agents;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{CommandFactory, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use weft_core::config::AppConfig;
use weft_core::event::EventBus;
use weft_core::traits::{Executor, SteeringHandler};
use weft_core::{NodeId, Registry, RunStatus};
use weft_engine::{AutoSteering, Engine, RoutingExecutor, RunLogger, RunResult};
use weft_graph::Graph;

use agents::{truncate, AskInterpreter, CommandExecutor, EchoExecutor, TerminalSteering};

#[derive(Parser)]
#[command(name = "weft", version, about = "Workflow orchestration DSL for multi-agent task graphs")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "weft.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate a workflow
    Check {
        /// Workflow file
        file: PathBuf,
    },
    /// Print the compiled graph
    Graph {
        file: PathBuf,
        /// Emit JSON instead of a listing
        #[arg(long)]
        json: bool,
    },
    /// Run a workflow
    Run {
        file: PathBuf,
        /// Continue at checkpoints without asking; failures stop the run
        #[arg(long, short = 'y')]
        yes: bool,
        /// Echo instructions instead of invoking agents
        #[arg(long)]
        dry_run: bool,
        /// Ask the operator to decide literal conditions
        #[arg(long)]
        ask: bool,
        /// Print the run result as JSON
        #[arg(long)]
        json: bool,
        /// Pre-bound variable (NAME=VALUE)
        #[arg(long = "var", value_parser = parse_var)]
        vars: Vec<(String, String)>,
    },
    /// Show current configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("weft=info,warn")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    // Handle completions before config loading
    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        clap_complete::generate(shell, &mut cmd, "weft", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(&cli.config)?;
    let registry = config.to_registry();

    match cli.command {
        Commands::Config => {
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Commands::Check { file } => {
            let graph = compile_file(&file, &registry, &BTreeSet::new())?;
            println!(
                "{}: ok ({} nodes, {} edges, {} variables)",
                file.display(),
                graph.len(),
                graph.edges.len(),
                graph.declared_vars.len()
            );
        }
        Commands::Graph { file, json } => {
            let graph = compile_file(&file, &registry, &BTreeSet::new())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&graph)?);
            } else {
                print_graph(&graph);
            }
        }
        Commands::Run {
            file,
            yes,
            dry_run,
            ask,
            json,
            vars,
        } => {
            let seeds: BTreeMap<String, String> = vars.into_iter().collect();
            let names: BTreeSet<String> = seeds.keys().cloned().collect();
            let graph = compile_file(&file, &registry, &names)?;
            let result = run_graph(&config, registry, graph, seeds, yes, dry_run, ask).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else {
                print_result(&result);
            }
            if result.status != RunStatus::Completed {
                std::process::exit(1);
            }
        }
        Commands::Completions { .. } => {}
    }

    Ok(())
}

fn load_config(path: &Path) -> anyhow::Result<AppConfig> {
    if path.exists() {
        let config = AppConfig::load(path)?;
        info!(path = %path.display(), "Loaded config");
        Ok(config)
    } else {
        info!(path = %path.display(), "No config file, using defaults");
        Ok(AppConfig::default())
    }
}

fn compile_file(file: &Path, registry: &Registry, seeds: &BTreeSet<String>) -> anyhow::Result<Graph> {
    let source = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))?;
    match weft_graph::compile_with(&source, registry, NodeId(0), seeds) {
        Ok(graph) => Ok(graph),
        Err(e) => {
            for diagnostic in e.diagnostics() {
                eprintln!("{}: {}", file.display(), diagnostic);
            }
            anyhow::bail!("{} is not a valid workflow", file.display())
        }
    }
}

async fn run_graph(
    config: &AppConfig,
    registry: Registry,
    graph: Graph,
    seeds: BTreeMap<String, String>,
    yes: bool,
    dry_run: bool,
    ask: bool,
) -> anyhow::Result<RunResult> {
    let executor: Arc<dyn Executor> = if dry_run {
        Arc::new(EchoExecutor)
    } else {
        let mut router = RoutingExecutor::new();
        for (agent, command) in &config.agents {
            router = router.route(agent.clone(), Arc::new(CommandExecutor::new(command.clone())));
        }
        for node in graph.nodes.values().filter(|n| !n.is_checkpoint()) {
            if !config.agents.contains_key(&node.agent_ref) {
                warn!(node_id = %node.id, agent = %node.agent_ref, "No command configured for agent");
            }
        }
        Arc::new(router)
    };

    let steering: Arc<dyn SteeringHandler> = if yes {
        Arc::new(AutoSteering::new())
    } else {
        Arc::new(TerminalSteering)
    };

    let event_bus = Arc::new(EventBus::default());
    let cancel = CancellationToken::new();

    let mut engine = Engine::new(executor, registry)
        .with_steering(steering)
        .with_config(config.engine.clone())
        .with_event_bus(event_bus.clone())
        .with_cancel(cancel.clone());
    if ask {
        engine = engine.with_conditions(Arc::new(AskInterpreter));
    }

    let logger = config
        .log
        .as_ref()
        .filter(|log| log.enabled)
        .map(|log| RunLogger::new(log.dir(), log.level).spawn(&event_bus, cancel.child_token()));

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, aborting run");
            ctrl_c.cancel();
        }
    });

    let result = engine.run_with_vars(graph, seeds).await?;

    if let Some(handle) = logger {
        if let Ok(Some(path)) = handle.await {
            info!(path = %path.display(), "Run log written");
        }
    }
    Ok(result)
}

fn print_graph(graph: &Graph) {
    for node in graph.nodes.values() {
        let head = if node.is_checkpoint() {
            node.display_name()
        } else {
            format!("{} \"{}\"", node.agent_ref, node.instruction)
        };
        match &node.output_var {
            Some(var) => println!("#{} {} => {}", node.id, head, var),
            None => println!("#{} {}", node.id, head),
        }
        for edge in graph.outgoing(node.id) {
            let back = if edge.back_edge { " (loop)" } else { "" };
            println!("    -> #{} [{}]{}", edge.to, edge.predicate.describe(), back);
        }
    }
    for binding in &graph.bindings {
        println!("{} := {}", binding.var, binding.predicate.describe());
    }
    for join in &graph.joins {
        println!("join {} => {}", ids(&join.branches), ids(&join.successors));
    }
}

fn ids(nodes: &[NodeId]) -> String {
    nodes
        .iter()
        .map(|id| format!("#{}", id))
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_result(result: &RunResult) {
    println!("{}", result.summary());
    if let Some(reason) = &result.reason {
        println!("reason: {}", reason);
    }
    for failure in &result.failures {
        println!("  failure #{} ({}): {}", failure.node, failure.agent, failure.error);
    }
    if !result.vars.is_empty() {
        println!("variables:");
        for (name, value) in &result.vars {
            println!("  {} = {}", name, truncate(value, 120));
        }
    }
}

fn parse_var(s: &str) -> Result<(String, String), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{}'", s))?;
    if !weft_core::template::is_identifier(name) {
        return Err(format!("invalid variable name '{}'", name));
    }
    Ok((name.to_string(), value.to_string()))
}

