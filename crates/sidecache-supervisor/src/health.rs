use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use sidecache_types::{HealthSnapshot, ProbeState, ServiceState};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::SupervisorConfig;
use crate::events::{EventSink, SupervisorEvent};
use crate::process::ServiceProcessManager;
use crate::resp::{RespConnection, RespError};

/// Reserved key the keepalive loop writes; short TTL so it never lingers.
const KEEPALIVE_KEY: &str = "__sidecache:keepalive";
const KEEPALIVE_TTL_SECONDS: u64 = 60;

fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Watches the managed service from the outside: a keepalive loop that only
/// generates traffic, and a health loop that verifies correctness with a
/// protocol ping and asks the process manager for a restart when probes keep
/// failing. Restart execution and its single-flight guard stay with the
/// manager; this monitor only requests.
pub struct HealthMonitor {
    manager: ServiceProcessManager,
    config: Arc<SupervisorConfig>,
    events: EventSink,
}

/// Running monitor loops. `shutdown` stops both; do this before stopping the
/// managed process so no restart races an intentional shutdown.
#[derive(Debug)]
pub struct HealthHandle {
    state: Arc<Mutex<HealthSnapshot>>,
    keepalive_task: JoinHandle<()>,
    health_task: JoinHandle<()>,
}

impl HealthHandle {
    pub async fn snapshot(&self) -> HealthSnapshot {
        self.state.lock().await.clone()
    }

    pub fn shutdown(self) {
        self.keepalive_task.abort();
        self.health_task.abort();
    }
}

impl HealthMonitor {
    pub fn new(
        manager: ServiceProcessManager,
        config: Arc<SupervisorConfig>,
        events: EventSink,
    ) -> Self {
        Self {
            manager,
            config,
            events,
        }
    }

    pub fn spawn(self) -> HealthHandle {
        let state = Arc::new(Mutex::new(HealthSnapshot::default()));

        let keepalive_task = tokio::spawn(keepalive_loop(
            self.manager.clone(),
            self.config.clone(),
        ));
        let health_task = tokio::spawn(health_loop(
            self.manager,
            self.config,
            self.events,
            state.clone(),
        ));

        HealthHandle {
            state,
            keepalive_task,
            health_task,
        }
    }
}

/// Trivial write/read on a fixed interval, purely to keep intermediate
/// infrastructure from reclaiming an idle-looking connection path. Failures
/// are not a health signal; the health loop owns that judgement.
async fn keepalive_loop(manager: ServiceProcessManager, config: Arc<SupervisorConfig>) {
    let backend = SocketAddr::from((Ipv4Addr::LOCALHOST, config.backend_port));
    let mut service_rx = manager.state_watch();

    let period = config.keepalive_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if *service_rx.borrow_and_update() != ServiceState::Running {
            continue;
        }

        let result = tokio::time::timeout(config.probe_timeout(), async {
            let mut conn = RespConnection::connect(backend, config.dial_timeout()).await?;
            conn.set(KEEPALIVE_KEY, b"1", Some(KEEPALIVE_TTL_SECONDS))
                .await?;
            conn.get(KEEPALIVE_KEY).await?;
            Ok::<_, RespError>(())
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(error = %err, "keepalive write failed"),
            Err(_) => tracing::debug!("keepalive timed out"),
        }
    }
}

async fn probe(backend: SocketAddr, config: &SupervisorConfig) -> Result<(), String> {
    let result = tokio::time::timeout(config.probe_timeout(), async {
        let mut conn = RespConnection::connect(backend, config.dial_timeout()).await?;
        conn.ping().await
    })
    .await;

    match result {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(err.to_string()),
        Err(_) => Err(format!(
            "ping timed out after {}ms",
            config.probe_timeout_ms
        )),
    }
}

async fn health_loop(
    manager: ServiceProcessManager,
    config: Arc<SupervisorConfig>,
    events: EventSink,
    state: Arc<Mutex<HealthSnapshot>>,
) {
    let backend = SocketAddr::from((Ipv4Addr::LOCALHOST, config.backend_port));
    let mut service_rx = manager.state_watch();

    let period = config.health_interval();
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;
        if *service_rx.borrow_and_update() != ServiceState::Running {
            let mut snap = state.lock().await;
            snap.connected = false;
            continue;
        }

        {
            let mut snap = state.lock().await;
            if snap.probe_state == ProbeState::Unknown {
                snap.probe_state = ProbeState::Probing;
                snap.last_transition_unix_ms = now_unix_ms();
                events.emit(SupervisorEvent::HealthChanged {
                    from: ProbeState::Unknown,
                    to: ProbeState::Probing,
                    consecutive_failures: 0,
                    error: None,
                });
            }
        }

        match probe(backend, &config).await {
            Ok(()) => {
                let mut snap = state.lock().await;
                snap.consecutive_failures = 0;
                snap.connected = true;
                snap.last_error = None;
                if snap.probe_state != ProbeState::Healthy {
                    let from = snap.probe_state;
                    snap.probe_state = ProbeState::Healthy;
                    snap.last_transition_unix_ms = now_unix_ms();
                    events.emit(SupervisorEvent::HealthChanged {
                        from,
                        to: ProbeState::Healthy,
                        consecutive_failures: 0,
                        error: None,
                    });
                }
            }
            Err(err) => {
                let failures = {
                    let mut snap = state.lock().await;
                    snap.consecutive_failures = snap.consecutive_failures.saturating_add(1);
                    snap.connected = false;
                    snap.last_error = Some(err.clone());
                    if snap.probe_state != ProbeState::Unhealthy {
                        let from = snap.probe_state;
                        snap.probe_state = ProbeState::Unhealthy;
                        snap.last_transition_unix_ms = now_unix_ms();
                        events.emit(SupervisorEvent::HealthChanged {
                            from,
                            to: ProbeState::Unhealthy,
                            consecutive_failures: snap.consecutive_failures,
                            error: Some(err.clone()),
                        });
                    }
                    snap.consecutive_failures
                };

                // Only restart a service that still claims to be running;
                // crashes are the exit watcher's business.
                if failures > config.probe_failure_threshold
                    && *service_rx.borrow() == ServiceState::Running
                {
                    tracing::warn!(failures, error = %err, "health probes failing, requesting restart");
                    if !manager.restart().await {
                        tracing::debug!("restart request skipped: another restart in flight");
                    }
                }
            }
        }
    }
}
