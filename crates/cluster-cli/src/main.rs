//! Cluster Control CLI
//!
//! The `clusterctl` command drives a cluster through its lifecycle phases.
//!
//! ## Commands
//!
//! - `launch-cluster`: Bootstrap, configure and start a new cluster
//! - `stop-cluster`: Suspend every instance of a cluster
//! - `destroy-cluster`: Terminate every instance of a cluster
//! - `run-phase`: Run a single lifecycle phase
//! - `list-cluster`: Show the instances recorded for a cluster

mod config;
mod state;

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, Subcommand};
use cluster_compute::fakes::{MemoryComputeService, MemoryContextBuilder, STUB_PROVIDER};
use cluster_core::{
    cancellation, keys, ActionContext, CancellationSignal, Cluster, ClusterAction, ClusterSpec,
    ComputeServiceContextBuilder, HandlerRegistry, Phase, Strategy,
};
use tracing::{debug, info, warn, Level};

use crate::config::ClusterArgs;
use crate::state::StateFile;

#[derive(Parser)]
#[command(name = "clusterctl")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Launch, stop and destroy role-grouped compute clusters", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Bootstrap, configure and start a new cluster
    LaunchCluster {
        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Suspend every instance of a cluster
    StopCluster {
        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Terminate every instance of a cluster
    DestroyCluster {
        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Run one lifecycle phase against the recorded cluster
    RunPhase {
        /// bootstrap, configure, start, stop or destroy
        phase: Phase,

        #[command(flatten)]
        cluster: ClusterArgs,
    },

    /// Show the instances recorded for a cluster
    ListCluster {
        #[command(flatten)]
        cluster: ClusterArgs,
    },
}

/// Compute providers this binary can reach, by provider id.
///
/// `stub` holds nodes in memory only. It starts from the cluster recorded in
/// the state file, so a dry run carries over from one invocation to the next.
fn compute_for_provider(
    provider: &str,
    recorded: Option<&Cluster>,
    tag: &str,
) -> Option<Arc<dyn ComputeServiceContextBuilder>> {
    match provider {
        STUB_PROVIDER => {
            let service = MemoryComputeService::new();
            if let Some(cluster) = recorded {
                for node in cluster.node_descriptors(tag) {
                    service.restore_node(node);
                }
                debug!(nodes = cluster.len(), "stub provider restored recorded nodes");
            }
            let builder = MemoryContextBuilder::with_service(Arc::new(service));
            Some(Arc::new(builder))
        }
        _ => None,
    }
}

/// Flags a phase cannot run without, given the merged properties.
fn missing_options(
    properties: &BTreeMap<String, String>,
    phase: Option<Phase>,
) -> Vec<&'static str> {
    let provisions = phase.map_or(true, |p| p.strategy() == Strategy::RoleDispatch);
    let mut required = vec![
        (keys::PROVIDER, "--provider"),
        (keys::CLUSTER_NAME, "--cluster-name"),
    ];
    if provisions {
        required.push((keys::INSTANCE_TEMPLATES, "--instance-templates"));
    }
    required
        .into_iter()
        .filter(|(key, _)| properties.get(*key).map_or(true, |v| v.trim().is_empty()))
        .map(|(_, flag)| flag)
        .collect()
}

/// Usage error for `subcommand`, rendered the way clap reports its own.
fn usage_error(subcommand: &str, missing: &[&str]) -> clap::Error {
    let message = format!(
        "the following required options were not provided: {}",
        missing.join(", ")
    );
    let mut cli = Cli::command();
    cli.build();
    match cli.find_subcommand_mut(subcommand) {
        Some(command) => command.error(ErrorKind::MissingRequiredArgument, message),
        None => cli.error(ErrorKind::MissingRequiredArgument, message),
    }
}

/// Everything one invocation needs to run phases against a cluster.
struct Session {
    spec: ClusterSpec,
    registry: Arc<HandlerRegistry>,
    context: ActionContext,
    state: StateFile,
}

impl Session {
    fn open(
        args: &ClusterArgs,
        properties: &BTreeMap<String, String>,
        cancel: CancellationSignal,
    ) -> Result<Self> {
        let spec = ClusterSpec::from_properties(properties)
            .context("invalid cluster configuration")?;
        let registry = HandlerRegistry::from_properties(spec.properties())
            .context("invalid role configuration")?;
        let state = state_file(args, spec.cluster_name())?;

        let recorded = state.load()?;
        let provider = spec.provider();
        let compute = compute_for_provider(provider, recorded.as_ref(), spec.cluster_name())
            .with_context(|| {
                format!("unknown compute provider '{provider}' (available: {STUB_PROVIDER})")
            })?;
        let context = ActionContext::new(compute)
            .with_cancellation(cancel)
            .with_span(tracing::info_span!("clusterctl"));
        Ok(Self {
            spec,
            registry: Arc::new(registry),
            context,
            state,
        })
    }

    /// Run `phase` and record what it returns.
    async fn run(&self, phase: Phase, cluster: Option<&Cluster>) -> Result<Option<Cluster>> {
        let action =
            ClusterAction::for_phase(phase, self.context.clone(), Arc::clone(&self.registry));
        let next = action
            .execute(&self.spec, cluster)
            .await
            .with_context(|| format!("{phase} failed for cluster {}", self.spec.cluster_name()))?;
        self.state.record(next.as_ref())?;
        Ok(next)
    }
}

fn state_file(args: &ClusterArgs, cluster_name: &str) -> Result<StateFile> {
    match (&args.state_file, cluster_name) {
        (Some(path), _) => Ok(StateFile::new(path)),
        (None, "") => anyhow::bail!("--cluster-name or --state-file is required"),
        (None, name) => Ok(StateFile::for_cluster(name)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    cluster_core::init_tracing(cli.json, level);

    match run(cli.command).await {
        Err(err) => match err.downcast::<clap::Error>() {
            Ok(usage) => usage.exit(),
            Err(err) => Err(err),
        },
        ok => ok,
    }
}

async fn run(command: Commands) -> Result<()> {
    let (name, args, phase) = match &command {
        Commands::ListCluster { cluster } => return cmd_list(cluster),
        Commands::LaunchCluster { cluster } => ("launch-cluster", cluster, None),
        Commands::StopCluster { cluster } => ("stop-cluster", cluster, Some(Phase::Stop)),
        Commands::DestroyCluster { cluster } => ("destroy-cluster", cluster, Some(Phase::Destroy)),
        Commands::RunPhase { phase, cluster } => ("run-phase", cluster, Some(*phase)),
    };

    let properties = args.to_properties()?;
    let missing = missing_options(&properties, phase);
    if !missing.is_empty() {
        return Err(usage_error(name, &missing).into());
    }

    let (handle, signal) = cancellation();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, cancelling");
            handle.cancel();
        }
    });
    let session = Session::open(args, &properties, signal)?;

    match phase {
        None => cmd_launch(&session).await,
        Some(phase) => cmd_phase(&session, phase).await,
    }
}

async fn cmd_launch(session: &Session) -> Result<()> {
    let mut cluster = session.state.load()?;
    if cluster.is_some() {
        warn!(
            path = %session.state.path().display(),
            "state file already records a cluster; new instances are added to it"
        );
    }

    info!(cluster = %session.spec.cluster_name(), "launching cluster");
    for phase in [Phase::Bootstrap, Phase::Configure, Phase::Start] {
        cluster = session.run(phase, cluster.as_ref()).await?;
    }

    let cluster = cluster.unwrap_or_else(|| Cluster::empty(session.spec.digest()));
    println!("Started cluster of {} instances", cluster.len());
    print_cluster(&cluster);
    Ok(())
}

async fn cmd_phase(session: &Session, phase: Phase) -> Result<()> {
    let prior = session.state.load()?;
    match session.run(phase, prior.as_ref()).await? {
        Some(cluster) => {
            println!("{phase} complete: {} instances", cluster.len());
            print_cluster(&cluster);
        }
        None if phase == Phase::Destroy => {
            println!("Cluster {} destroyed", session.spec.cluster_name())
        }
        None => println!("No cluster recorded for {}", session.spec.cluster_name()),
    }
    Ok(())
}

fn cmd_list(args: &ClusterArgs) -> Result<()> {
    let properties = args.to_properties()?;
    let name = properties
        .get(keys::CLUSTER_NAME)
        .map(String::as_str)
        .unwrap_or_default();
    let state = state_file(args, name)?;
    match state.load()? {
        Some(cluster) => print_cluster(&cluster),
        None => println!("No cluster recorded at {}", state.path().display()),
    }
    Ok(())
}

fn print_cluster(cluster: &Cluster) {
    for line in render_cluster(cluster) {
        println!("{line}");
    }
}

fn render_cluster(cluster: &Cluster) -> Vec<String> {
    cluster
        .instances()
        .iter()
        .map(|i| {
            let roles: Vec<&str> = i.roles.iter().map(String::as_str).collect();
            format!(
                "{}\t{}\t{:?}\t{}\t{}",
                i.id,
                roles.join("+"),
                i.state,
                i.public_address.as_deref().unwrap_or("-"),
                i.private_address.as_deref().unwrap_or("-"),
            )
        })
        .collect()
}
