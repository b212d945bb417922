//! Edge host agent binary.
//!
//! `edge-agent <net|storage|vm|stat>` runs one reconciliation domain until
//! SIGINT or SIGTERM.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use edge_host_agent::command::CommandRunner;
use edge_host_agent::config::Config;
use edge_host_agent::vm::SupervisorConfig;
use edge_host_agent::{
    logging, HostMetrics, NetworkReconciler, QemuLauncher, StorageConfig, StorageReconciler,
    SystemApplier, SystemRunner, TelemetryPublisher, VmSupervisor,
};
use edge_reconcile::{Domain, ReconcileLoop, DEFAULT_RECONCILE_INTERVAL, TELEMETRY_INTERVAL};
use edge_store::OvsdbCliStore;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DomainKind {
    /// Interfaces, bridge and system settings.
    Net,
    /// iSCSI targets and mounts.
    Storage,
    /// Virtual machines.
    Vm,
    /// Host telemetry.
    Stat,
}

#[derive(Debug, Parser)]
#[command(name = "edge-agent", version, about = "Edge host reconciliation agent")]
struct Args {
    /// Domain to run.
    #[arg(value_enum)]
    domain: DomainKind,

    /// Store remote (overrides EDGE_STORE_REMOTE).
    #[arg(long)]
    remote: Option<String>,

    /// Database name (overrides EDGE_STORE_DB).
    #[arg(long)]
    db: Option<String>,

    /// Schema file (overrides EDGE_SCHEMA_PATH).
    #[arg(long)]
    schema: Option<PathBuf>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        if let Some(remote) = &self.remote {
            config.store_remote = remote.clone();
        }
        if let Some(db) = &self.db {
            config.store_db = db.clone();
        }
        if let Some(schema) = &self.schema {
            config.schema_path = schema.clone();
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();
    let mut config = Config::from_env()?;
    args.apply(&mut config);

    let log_control = logging::init(&config.log_level)?;

    info!(
        domain = ?args.domain,
        remote = %config.store_remote,
        db = %config.store_db,
        "Starting edge agent"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
    match args.domain {
        DomainKind::Net => {
            let system = SystemApplier::new(Arc::clone(&runner), &config.timezone_file)
                .with_log_control(Arc::new(log_control));
            let domain = NetworkReconciler::new(runner, &config.bridge, system);
            run_domain(&config, domain, DEFAULT_RECONCILE_INTERVAL, shutdown_rx).await?;
        }
        DomainKind::Storage => {
            let domain = StorageReconciler::new(runner, StorageConfig::default());
            run_domain(&config, domain, DEFAULT_RECONCILE_INTERVAL, shutdown_rx).await?;
        }
        DomainKind::Vm => {
            let supervisor_config = SupervisorConfig {
                qemu_bin: config.qemu_bin.clone(),
                cgroup_procs: config.vm_cgroup_procs.clone(),
                stop_timeout: config.vm_stop_timeout,
            };
            let domain = VmSupervisor::new(Arc::new(QemuLauncher), supervisor_config);
            run_domain(&config, domain, DEFAULT_RECONCILE_INTERVAL, shutdown_rx).await?;
        }
        DomainKind::Stat => {
            let domain = TelemetryPublisher::new(HostMetrics::default());
            run_domain(&config, domain, TELEMETRY_INTERVAL, shutdown_rx).await?;
        }
    }

    info!("Edge agent shutdown complete");
    Ok(())
}

async fn run_domain<D: Domain>(
    config: &Config,
    domain: D,
    default_interval: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let store = OvsdbCliStore::connect(config.store_config(domain.tables()))
        .await
        .with_context(|| format!("failed to connect to store at {}", config.store_remote))?;

    let interval = config.poll_interval.unwrap_or(default_interval);
    ReconcileLoop::new(store, domain, interval)
        .run(shutdown)
        .await;
    Ok(())
}

async fn shutdown_signal() {
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}
