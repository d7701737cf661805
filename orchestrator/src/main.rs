//! The `kuberm` Kubernetes resource manager.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap_verbosity_flag::Verbosity;
use clap_verbosity_flag::WarnLevel;
use kuberm_db::Database;
use kuberm_orchestrator::Server;
use kuberm_orchestrator::config::DEFAULT_CPU_PER_SLOT;
use kuberm_orchestrator::config::DEFAULT_NAMESPACE;
use kuberm_orchestrator::config::JobsConfig;
use kuberm_orchestrator::config::ResourcePoolsConfig;
use kuberm_orchestrator::config::SlotType;
use kuberm_orchestrator::http::DEFAULT_ADDRESS;
use kuberm_orchestrator::http::DEFAULT_PORT;
use kuberm_orchestrator::request_queue::DEFAULT_WORKERS;
use secrecy::SecretString;
use tracing_log::AsTrace as _;
use tracing_subscriber::EnvFilter;

/// The Kubernetes resource manager service.
#[derive(Parser)]
pub struct Args {
    /// The address to bind the service to.
    #[clap(short, long, default_value = DEFAULT_ADDRESS)]
    address: String,

    /// The port to bind the service to.
    #[clap(short, long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// The identifier of the cluster the resource manager belongs to.
    #[clap(long, env)]
    cluster_id: String,

    /// The namespaces jobs may run in.
    ///
    /// The first namespace is used for jobs that do not request one.
    #[clap(long, env, value_delimiter = ',', default_value = DEFAULT_NAMESPACE)]
    namespaces: Vec<String>,

    /// The kind of device a slot represents.
    #[clap(long, env, value_enum, default_value_t = SlotType::Cuda)]
    slot_type: SlotType,

    /// The number of CPUs making up a CPU slot.
    #[clap(long, env, default_value_t = DEFAULT_CPU_PER_SLOT)]
    cpu_per_slot: f32,

    /// The number of workers issuing Kubernetes create and delete requests.
    #[clap(long, env, default_value_t = DEFAULT_WORKERS)]
    request_queue_workers: usize,

    /// The path to a JSON file describing the resource pools.
    #[clap(long, env)]
    resource_pools: Option<PathBuf>,

    /// The pod name of the resource manager.
    #[clap(long, env, default_value = "kuberm")]
    pod_name: String,

    /// The verbosity level.
    #[command(flatten)]
    verbose: Verbosity<WarnLevel>,

    /// The database user name to use.
    #[clap(long, env)]
    database_user: String,

    /// The database password to use.
    #[clap(long, env, hide_env_values(true))]
    database_password: SecretString,

    /// The database host to use.
    #[clap(long, env)]
    database_host: String,

    /// The database port to use.
    #[clap(long, env, default_value_t = 5432)]
    database_port: i32,

    /// The database name to use.
    #[clap(long, env, default_value = "determined")]
    database_name: String,
}

impl Args {
    /// Gets the database from the CLI options.
    fn database(&self) -> Result<Arc<dyn Database>> {
        cfg_if::cfg_if! {
            if #[cfg(feature = "postgres")] {
                let url = kuberm_db::postgres::format_database_url(
                    &self.database_user,
                    &self.database_password,
                    &self.database_host,
                    self.database_port,
                    &self.database_name,
                    &self.pod_name,
                );
                Ok(Arc::new(kuberm_db::postgres::PostgresDatabase::new(
                    url.into(),
                )?))
            } else {
                compile_error!("no database feature was enabled");
            }
        }
    }

    /// Gets the jobs service configuration from the CLI options.
    fn jobs_config(&self) -> Result<JobsConfig> {
        let resource_pools = match &self.resource_pools {
            Some(path) => ResourcePoolsConfig::from_file(path)?,
            None => ResourcePoolsConfig::default(),
        };

        Ok(JobsConfig::builder()
            .cluster_id(&self.cluster_id)
            .namespaces(self.namespaces.clone())
            .slot_type(self.slot_type)
            .cpu_per_slot(self.cpu_per_slot)
            .request_queue_workers(self.request_queue_workers)
            .resource_pools(resource_pools)
            .build())
    }
}

#[cfg(unix)]
/// An async function that waits for a termination signal.
async fn terminate() {
    use tokio::select;
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;
    use tracing::info;

    let mut sigterm = signal(SignalKind::terminate()).expect("failed to create SIGTERM handler");
    let mut sigint = signal(SignalKind::interrupt()).expect("failed to create SIGINT handler");

    let signal = select! {
        _ = sigterm.recv() => "SIGTERM",
        _ = sigint.recv() => "SIGINT",
    };

    info!("received {signal} signal: initiating shutdown");
}

#[cfg(windows)]
/// An async function that waits for a termination signal.
async fn terminate() {
    use tokio::signal::windows::ctrl_c;
    use tracing::info;

    let mut signal = ctrl_c().expect("failed to create ctrl-c handler");
    signal.recv().await;

    info!("received Ctrl-C signal: initiating shutdown");
}

/// The main method.
#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    match std::env::var("RUST_LOG") {
        Ok(_) => tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_ansi(std::io::stdout().is_terminal())
            .init(),
        Err(_) => tracing_subscriber::fmt()
            .with_max_level(args.verbose.log_level_filter().as_trace())
            .with_ansi(std::io::stdout().is_terminal())
            .init(),
    }

    let config = args.jobs_config()?;
    let database = args.database()?;

    Server::builder()
        .address(&args.address)
        .port(args.port)
        .config(config)
        .shared_database(database)
        .build()
        .run(terminate())
        .await
        .context("failed to run server")
}
