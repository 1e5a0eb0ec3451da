//! Kubexpose Kubernetes Operator
//!
//! Exposes Deployments on public ngrok URLs, driven by Kubexpose resources.
//!
//! ## Usage
//!
//! ```bash
//! # Run the operator (requires kubeconfig or in-cluster credentials)
//! kubexpose-operator
//!
//! # Print the CRD manifest
//! kubexpose-operator crd | kubectl apply -f -
//!
//! # Run with custom log level
//! RUST_LOG=debug kubexpose-operator --log-format text
//! ```

use clap::{Parser, Subcommand, ValueEnum};
use kube::{Client, CustomResourceExt};
use kubexpose_operator::leader_election::{self, LeaderElector, LeaseConfig};
use kubexpose_operator::{Kubexpose, KubexposeController, OperatorConfig};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Kubexpose Kubernetes Operator
#[derive(Parser, Debug)]
#[command(name = "kubexpose-operator")]
#[command(version, about = "Kubernetes operator exposing Deployments on public tunnel URLs")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    #[command(flatten)]
    run: RunArgs,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the controller (default)
    Run,
    /// Print the Kubexpose CustomResourceDefinition as YAML
    Crd,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(clap::Args, Debug)]
struct RunArgs {
    /// Namespace to watch (empty for all namespaces)
    #[arg(long, env = "KUBEXPOSE_NAMESPACE", default_value = "")]
    namespace: String,

    /// Enable leader election for HA deployments
    #[arg(long, env = "KUBEXPOSE_LEADER_ELECTION", default_value = "false")]
    leader_election: bool,

    /// Namespace for the leader election Lease (auto-detected if empty)
    #[arg(long, env = "KUBEXPOSE_LEADER_ELECTION_NAMESPACE", default_value = "")]
    leader_election_namespace: String,

    /// Image running the tunnel agent
    #[arg(long, env = "KUBEXPOSE_TUNNEL_IMAGE", default_value = kubexpose_operator::config::DEFAULT_TUNNEL_IMAGE)]
    tunnel_image: String,

    /// Name of the agent container inside the tunnel pod
    #[arg(long, env = "KUBEXPOSE_TUNNEL_CONTAINER", default_value = kubexpose_operator::config::DEFAULT_TUNNEL_CONTAINER)]
    tunnel_container: String,

    /// Port of the agent's local web interface
    #[arg(long, env = "KUBEXPOSE_AGENT_PORT", default_value_t = kubexpose_operator::config::DEFAULT_AGENT_PORT)]
    agent_port: i32,

    /// Path of the agent's tunnel listing endpoint
    #[arg(long, env = "KUBEXPOSE_AGENT_STATUS_PATH", default_value = kubexpose_operator::config::DEFAULT_AGENT_STATUS_PATH)]
    agent_status_path: String,

    /// Seconds to wait before retrying when the tunnel URL is not available yet
    #[arg(long, env = "KUBEXPOSE_NOT_READY_DELAY_SECS", default_value_t = 5)]
    not_ready_delay_secs: u64,

    /// Milliseconds to wait before re-evaluating after creating a Service or Deployment
    #[arg(long, env = "KUBEXPOSE_REQUEUE_AFTER_CREATE_MS", default_value_t = 1000)]
    requeue_after_create_ms: u64,

    /// Seconds to wait before retrying a failed reconcile pass
    #[arg(long, env = "KUBEXPOSE_ERROR_BACKOFF_SECS", default_value_t = 10)]
    error_backoff_secs: u64,

    /// Timeout in seconds for the exec call into the tunnel container
    #[arg(long, env = "KUBEXPOSE_EXEC_TIMEOUT_SECS", default_value_t = 10)]
    exec_timeout_secs: u64,

    /// Maximum concurrent reconcile passes (0 for unbounded)
    #[arg(long, env = "KUBEXPOSE_CONCURRENCY", default_value_t = 0)]
    concurrency: u16,

    /// Milliseconds to coalesce bursts of watch events
    #[arg(long, env = "KUBEXPOSE_DEBOUNCE_MS", default_value_t = 0)]
    debounce_ms: u64,

    /// Log output format
    #[arg(long, env = "KUBEXPOSE_LOG_FORMAT", value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,
}

impl RunArgs {
    fn operator_config(&self) -> OperatorConfig {
        OperatorConfig {
            tunnel_image: self.tunnel_image.clone(),
            tunnel_container: self.tunnel_container.clone(),
            agent_port: self.agent_port,
            agent_status_path: self.agent_status_path.clone(),
            not_ready_delay: Duration::from_secs(self.not_ready_delay_secs),
            requeue_after_create: Duration::from_millis(self.requeue_after_create_ms),
            error_backoff: Duration::from_secs(self.error_backoff_secs),
            exec_timeout: Duration::from_secs(self.exec_timeout_secs),
            concurrency: self.concurrency,
            debounce: Duration::from_millis(self.debounce_ms),
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Text => registry.with(tracing_subscriber::fmt::layer()).init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if let Some(Command::Crd) = cli.command {
        print!("{}", serde_yaml::to_string(&Kubexpose::crd())?);
        return Ok(());
    }

    let args = cli.run;
    init_tracing(args.log_format);

    let config = args.operator_config();
    config.validate()?;

    info!("Starting Kubexpose operator");
    info!(
        "Watching namespace: {}",
        if args.namespace.is_empty() {
            "all"
        } else {
            &args.namespace
        }
    );

    let client = Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let elector = if args.leader_election {
        let ns = leader_election::detect_namespace(&args.leader_election_namespace);
        info!("Leader election namespace: {}", ns);
        let elector = Arc::new(LeaderElector::new(client.clone(), &ns, LeaseConfig::default()));
        elector.acquire().await;
        Some(elector)
    } else {
        None
    };

    // Lease renewal; firing the channel stops the controller
    let (lost_tx, lost_rx) = oneshot::channel::<()>();
    let renew_handle = elector.clone().map(|e| {
        tokio::spawn(async move {
            e.hold().await;
            error!("Leader lease lost, initiating shutdown");
            let _ = lost_tx.send(());
        })
    });

    let namespace = (!args.namespace.is_empty()).then(|| args.namespace.clone());
    let controller = KubexposeController::new(client, config, namespace);
    controller
        .run(async move {
            // Sender dropped without firing means leader election is off
            if lost_rx.await.is_err() {
                std::future::pending::<()>().await;
            }
        })
        .await;

    if let Some(handle) = renew_handle {
        handle.abort();
    }
    // Release the lease so a standby replica can take over immediately
    if let Some(e) = &elector {
        e.release().await;
    }

    info!("Kubexpose operator shutting down");
    Ok(())
}
