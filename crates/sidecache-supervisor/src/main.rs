use sidecache_supervisor::{CacheSupervisor, SupervisorConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = SupervisorConfig::from_env();
    tracing::info!(
        public_port = config.public_port,
        backend_port = config.backend_port,
        on_demand = config.on_demand,
        "sidecached starting"
    );

    let (supervisor, mut events) = CacheSupervisor::spawn(config).await?;

    // Keep the event stream drained; the sink already logs each event.
    let event_task = tokio::spawn(async move { while events.recv().await.is_some() {} });

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown signal received");

    supervisor.shutdown().await;
    event_task.abort();
    Ok(())
}
