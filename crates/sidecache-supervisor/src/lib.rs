//! Supervisor for an out-of-process key-value cache service.
//!
//! The managed service is spawned on demand on a private backend port,
//! republished on its conventional public port through a loopback proxy,
//! kept honest by keepalive and health loops, stopped when idle, and fronted
//! by a cache client that degrades to misses instead of failing.

pub mod client;
pub mod config;
pub mod console;
pub mod events;
pub mod health;
pub mod lifecycle;
pub mod process;
pub mod proxy;
pub mod resp;

use std::sync::Arc;

use tokio::sync::mpsc;

pub use client::{BatchOp, CacheClient, WarmupBundle};
pub use config::SupervisorConfig;
pub use events::{EventSink, SupervisorEvent};
pub use health::HealthHandle;
pub use lifecycle::IdleLifecycleController;
pub use process::ServiceProcessManager;
pub use proxy::{NetworkProxy, ProxyHandle};
pub use sidecache_types::{HealthSnapshot, ProbeState, RunId, ServiceState, ServiceStatus};

/// Everything wired together: process manager, public proxy, health loops,
/// idle lifecycle, and the client. Explicitly constructed, no globals.
pub struct CacheSupervisor {
    config: Arc<SupervisorConfig>,
    manager: ServiceProcessManager,
    lifecycle: Arc<IdleLifecycleController>,
    client: CacheClient,
    proxy: ProxyHandle,
    health: Option<HealthHandle>,
}

impl CacheSupervisor {
    /// Bind the proxy and start the background loops. The managed service
    /// itself is not started; that happens lazily on first use.
    ///
    /// Returns the supervisor plus the stream of structured events it emits.
    pub async fn spawn(
        config: SupervisorConfig,
    ) -> anyhow::Result<(Self, mpsc::UnboundedReceiver<SupervisorEvent>)> {
        let config = Arc::new(config);
        let (events, event_rx) = EventSink::new();

        let manager = ServiceProcessManager::new(config.clone(), events.clone());

        let proxy = NetworkProxy::new(
            config.public_port,
            config.backend_port,
            config.dial_timeout(),
            manager.state_watch(),
        )
        .listen()
        .await?;

        let health =
            health::HealthMonitor::new(manager.clone(), config.clone(), events.clone()).spawn();

        let lifecycle = Arc::new(IdleLifecycleController::new(
            manager.clone(),
            config.clone(),
        ));
        let client = CacheClient::new(lifecycle.clone(), config.clone(), events.clone());

        let supervisor = Self {
            config,
            manager,
            lifecycle,
            client,
            proxy,
            health: Some(health),
        };
        Ok((supervisor, event_rx))
    }

    pub fn client(&self) -> CacheClient {
        self.client.clone()
    }

    pub async fn status(&self) -> ServiceStatus {
        self.manager.status().await
    }

    pub async fn health(&self) -> Option<HealthSnapshot> {
        match &self.health {
            Some(handle) => Some(handle.snapshot().await),
            None => None,
        }
    }

    pub async fn tail_console(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.manager.tail_console(cursor, limit).await
    }

    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Tear down in reverse startup order: monitors first so no probe races
    /// the intentional stop, then the managed process, then the listener.
    pub async fn shutdown(mut self) {
        if let Some(health) = self.health.take() {
            health.shutdown();
        }
        self.lifecycle.shutdown();
        self.manager.stop().await;
        self.proxy.shutdown();
    }
}
