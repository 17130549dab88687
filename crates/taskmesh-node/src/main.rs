//! TaskMesh Node Daemon
//!
//! Starts an origin node plus a number of worker nodes sharing one
//! in-process bus, then runs the requested tasks locally or dispatches them
//! to the workers.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use taskmesh_core::NodeId;
use taskmesh_runtime::{
    ExecRequest, Items, LocalBus, Membership, NodeContext, NodeService, OutputMode, Transport,
};

mod config;
mod demo;

use config::{parse_params, NodeArgs};

/// TaskMesh node - run tasks across in-process nodes
#[derive(Parser)]
#[command(name = "taskmesh-node")]
#[command(about = "Run declared tasks locally or across nodes", long_about = None)]
struct Cli {
    #[command(flatten)]
    node: NodeArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run tasks
    Run {
        /// Task names
        #[arg(required = true)]
        tasks: Vec<String>,

        /// Parameter passed to every task (key=value)
        #[arg(short, long = "param")]
        params: Vec<String>,

        /// Run on the origin node instead of dispatching
        #[arg(long)]
        local: bool,

        /// Dispatch to a random subset of this many workers
        #[arg(long)]
        fan_out: Option<usize>,
    },

    /// List the tasks offered by every node
    List {
        /// Glob restricting task names
        pattern: Option<String>,

        /// Group the listing by node
        #[arg(long)]
        by_node: bool,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let builder = FmtSubscriber::builder().with_target(true);
    match EnvFilter::try_from_default_env() {
        Ok(filter) => tracing::subscriber::set_global_default(builder.with_env_filter(filter).finish())?,
        Err(_) => tracing::subscriber::set_global_default(
            builder.with_max_level(cli.node.log_level).finish(),
        )?,
    }

    let config = cli.node.runtime_config();
    let bus = Arc::new(LocalBus::new());
    let transport: Arc<dyn Transport> = bus.clone();

    info!(
        workers = cli.node.nodes,
        dry_run = config.dry_run,
        "Starting TaskMesh nodes"
    );

    let origin_ctx = NodeContext::builder(NodeId::new("origin"), transport.clone())
        .config(config.clone())
        .worker(false)
        .build();
    demo::register(&origin_ctx).await?;
    let origin = NodeService::start(origin_ctx).await?;

    let mut services = vec![origin.clone()];
    for i in 1..=cli.node.nodes {
        let ctx = NodeContext::builder(NodeId::new(format!("node-{i}")), transport.clone())
            .config(config.clone())
            .build();
        demo::register(&ctx).await?;
        services.push(NodeService::start(ctx).await?);
    }

    for service in &services {
        service.announce().await?;
    }
    wait_for_workers(&origin, cli.node.nodes).await;

    let outcome = match cli.command {
        Commands::Run {
            tasks,
            params,
            local,
            fan_out,
        } => {
            let params = parse_params(&params)?;
            if local {
                run_local(&origin, tasks, params).await
            } else {
                run_remote(&origin, tasks, params, fan_out).await
            }
        }
        Commands::List { pattern, by_node } => list(&origin, pattern, by_node).await,
    };

    for service in &services {
        service.shutdown().await;
    }
    bus.close().await;

    outcome
}

/// Wait until the origin has heard from every worker.
async fn wait_for_workers(origin: &NodeService, expected: usize) {
    let membership = origin.context().membership();
    let waiting = async {
        while membership.worker_nodes().await.len() < expected {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    };
    if tokio::time::timeout(Duration::from_secs(2), waiting).await.is_err() {
        warn!(expected, "Not every worker announced itself in time");
    }
}

async fn run_local(
    origin: &NodeService,
    tasks: Vec<String>,
    params: serde_json::Map<String, serde_json::Value>,
) -> Result<(), Box<dyn std::error::Error>> {
    let result = origin.context().run_local(tasks, params).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_remote(
    origin: &NodeService,
    tasks: Vec<String>,
    params: serde_json::Map<String, serde_json::Value>,
    fan_out: Option<usize>,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut request = ExecRequest::new(tasks);
    request.parameters = params;
    request.fan_out = fan_out;

    let outcome = origin.context().exchange().run(request).await?;
    for (node, progress) in &outcome.nodes {
        println!("== {node}: {}", progress.state);
        if let Some(error) = &progress.error {
            println!("   error: {} ({})", error.message, error.code);
        }
        for line in &progress.logs {
            println!("   log: {line}");
        }
        if let Some(result) = progress.runner_result() {
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }
    Ok(())
}

async fn list(
    origin: &NodeService,
    pattern: Option<String>,
    by_node: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mode = if by_node {
        OutputMode::ByNode
    } else {
        OutputMode::Flat
    };
    let outcome = origin
        .context()
        .exchange()
        .list_remote_tasks(pattern, mode)
        .await?;

    match outcome.output.items {
        Items::Flat(items) => {
            for item in items {
                let field = |key: &str| item[key].as_str().unwrap_or("").to_string();
                println!(
                    "{:<12} {:<10} {}",
                    field("name"),
                    field("node_id"),
                    field("description")
                );
            }
        }
        Items::ByNode(by_node) => {
            for (node, items) in by_node {
                println!("{node}:");
                for item in items {
                    println!("  {}", item["name"].as_str().unwrap_or(""));
                }
            }
        }
    }
    println!("Total: {}", outcome.output.total);
    if !outcome.missing.is_empty() {
        println!("No answer from: {:?}", outcome.missing);
    }
    Ok(())
}
