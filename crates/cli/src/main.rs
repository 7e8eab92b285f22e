use std::str::FromStr;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tokio::signal;
use tracing::{info, warn};

use vigil_core::{CauseToken, ExecutionStateOptions, WatchError, WatcherConfig};
use vigil_watcher::{ExecutionClients, ExecutionState, ExecutionWatcher};

#[derive(Parser, Debug)]
#[command(name = "vigilctl", version, about = "Follow the reconciled state of an execution")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Kubernetes namespace (default: current context)
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print a summary on every commit until the execution completes
    Watch {
        /// Execution resource id (job name)
        id: String,
    },
    /// Print the first committed summary
    Get {
        /// Execution resource id (job name)
        id: String,
    },
}

fn init_tracing() {
    let env = std::env::var("VIGIL_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("VIGIL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid VIGIL_METRICS_ADDR; expected host:port");
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
struct Summary {
    resource_id: String,
    namespace: String,
    phase: &'static str,
    job_exists: bool,
    pod_exists: bool,
    pod: String,
    node: String,
    created_at: Option<DateTime<Utc>>,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    error: String,
}

impl Summary {
    fn of(state: &ExecutionState) -> Self {
        let error = state.execution_error();
        let phase = if state.completed() {
            if error.is_empty() { "succeeded" } else { "failed" }
        } else if state.pod_started() {
            "running"
        } else if state.pod_created() {
            "pending"
        } else {
            "queued"
        };
        Self {
            resource_id: state.resource_id(),
            namespace: state.namespace().to_string(),
            phase,
            job_exists: state.job_exists(),
            pod_exists: state.pod_exists(),
            pod: state.pod_name().to_string(),
            node: state.pod_node_name().to_string(),
            created_at: state.estimated_job_creation_timestamp(),
            started_at: state.estimated_pod_start_timestamp(),
            completed_at: state.completion_timestamp(),
            error,
        }
    }

    fn print(&self, output: Output) -> Result<()> {
        match output {
            Output::Human => {
                let age = render_age(self.created_at);
                let pod = if self.pod.is_empty() { "-" } else { self.pod.as_str() };
                let node = if self.node.is_empty() { "-" } else { self.node.as_str() };
                println!("{:<24} {:<10} {:<7} {:<32} {:<16} {}", self.resource_id, self.phase, age, pod, node, self.error);
            }
            Output::Json => println!("{}", serde_json::to_string(self)?),
        }
        Ok(())
    }
}

fn render_age(created: Option<DateTime<Utc>>) -> String {
    let Some(created) = created else { return "-".to_string() };
    let mut secs = (Utc::now() - created).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

/// Surface why the watcher stopped, unless it simply finished or was told to.
fn check_stopped(watcher: &ExecutionWatcher) -> Result<()> {
    match watcher.err() {
        None | Some(WatchError::Done) | Some(WatchError::Cancelled) => Ok(()),
        Some(e) => bail!("execution watcher stopped: {e}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    let client = kube::Client::try_default().await.context("connecting to the cluster")?;
    let namespace = cli.namespace.clone().unwrap_or_else(|| client.default_namespace().to_string());
    let config = WatcherConfig::from_env();
    let root = CauseToken::new();

    match cli.command {
        Commands::Get { id } => {
            info!(resource_id = %id, ns = %namespace, "get invoked");
            let options = ExecutionStateOptions { resource_id: id, namespace: namespace.clone(), ..Default::default() };
            let watcher = ExecutionWatcher::start(&root, ExecutionClients::kube(client, &namespace), options, config);
            tokio::select! {
                _ = watcher.started() => {}
                _ = signal::ctrl_c() => info!("Ctrl-C received; giving up"),
            }
            watcher.cancel();
            check_stopped(&watcher)?;
            Summary::of(&watcher.state()).print(cli.output)?;
        }
        Commands::Watch { id } => {
            info!(resource_id = %id, ns = %namespace, "watch invoked");
            let options = ExecutionStateOptions { resource_id: id, namespace: namespace.clone(), ..Default::default() };
            let watcher = ExecutionWatcher::start(&root, ExecutionClients::kube(client, &namespace), options, config);
            let mut updates = watcher.updated();
            watcher.started().await;

            let mut last = Summary::of(&watcher.state());
            last.print(cli.output)?;
            loop {
                tokio::select! {
                    more = updates.next() => {
                        let current = Summary::of(&watcher.state());
                        if current != last {
                            current.print(cli.output)?;
                            last = current;
                        }
                        if !more {
                            break;
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        watcher.cancel();
                        break;
                    }
                }
            }
            watcher.done().await;
            if let Err(e) = check_stopped(&watcher) {
                warn!(error = %e, "watch loop ended");
                return Err(e);
            }
        }
    }

    Ok(())
}
