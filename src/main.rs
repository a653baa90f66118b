use mimalloc::MiMalloc;
use node_cpu_manager::runtime::ProcessAffinityRuntime;
use node_cpu_manager::state::{CheckpointState, FileCheckpointStore, MemoryState, State};
use node_cpu_manager::{CpuManager, CpuManagerConfig, CpuManagerMetrics, NoAffinity, Policy, StaticPolicy};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if let Err(e) = run().await {
        tracing::error!("node cpu manager failed: {}", e);
        std::process::exit(1);
    }
}

async fn run() -> node_cpu_manager::Result<()> {
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = CpuManagerConfig::load_or_default(config_path.as_deref())?;

    let topology = Arc::new(config.build_topology()?);
    topology.log_topology();

    let metrics = Arc::new(CpuManagerMetrics::new());
    let policy = StaticPolicy::new(
        topology.clone(),
        config.effective_num_reserved(),
        config.reserved_cpus.clone(),
        Arc::new(NoAffinity),
        config.policy_options.clone(),
        metrics.clone(),
    )?;

    let state: Box<dyn State> = match &config.state_file {
        Some(path) => Box::new(CheckpointState::new(
            Box::new(FileCheckpointStore::new(path)),
            policy.name(),
            topology.fingerprint(),
        )?),
        None => Box::new(MemoryState::new()),
    };

    let manager = Arc::new(CpuManager::new(
        Arc::new(policy),
        state,
        Arc::new(ProcessAffinityRuntime),
        metrics,
        config.reconcile_period(),
    )?);
    let reconcile = manager.spawn_reconcile_loop();

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down, allocatable cpus {}", manager.get_allocatable_cpus().await);
    reconcile.abort();
    Ok(())
}
