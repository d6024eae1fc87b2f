use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use sidecache_types::ServiceState;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::SupervisorConfig;
use crate::process::ServiceProcessManager;

/// Reference counts of checked-out connections, keyed by the caller-supplied
/// connection id. Plain mutex: lease release happens in Drop, which cannot
/// await.
#[derive(Debug, Default)]
struct LeaseTable {
    by_connection: StdMutex<HashMap<String, u32>>,
}

impl LeaseTable {
    fn acquire(self: &Arc<Self>, connection_id: &str) -> Lease {
        let mut map = self.by_connection.lock().expect("lease table poisoned");
        *map.entry(connection_id.to_string()).or_insert(0) += 1;
        Lease {
            table: self.clone(),
            connection_id: connection_id.to_string(),
        }
    }

    fn outstanding(&self) -> usize {
        let map = self.by_connection.lock().expect("lease table poisoned");
        map.values().map(|n| *n as usize).sum()
    }

    fn release(&self, connection_id: &str) {
        let mut map = self.by_connection.lock().expect("lease table poisoned");
        if let Some(count) = map.get_mut(connection_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                map.remove(connection_id);
            }
        }
    }
}

/// A checked-out connection handle. While any lease is alive the idle timer
/// will not stop the service. Released on drop, on every exit path.
#[derive(Debug)]
pub struct Lease {
    table: Arc<LeaseTable>,
    connection_id: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.table.release(&self.connection_id);
    }
}

#[derive(Debug)]
struct IdleTimer {
    deadline: StdMutex<Option<Instant>>,
    changed: Notify,
}

/// Wraps the process manager with on-demand start and idle-timeout stop.
///
/// The timer is a deadline plus a notified watchdog rather than a sleep loop,
/// so every `touch` re-arms it without polling and shutdown cancels it
/// cleanly.
#[derive(Debug)]
pub struct IdleLifecycleController {
    manager: ServiceProcessManager,
    config: Arc<SupervisorConfig>,
    leases: Arc<LeaseTable>,
    timer: Arc<IdleTimer>,
    watchdog: JoinHandle<()>,
}

impl IdleLifecycleController {
    pub fn new(manager: ServiceProcessManager, config: Arc<SupervisorConfig>) -> Self {
        let timer = Arc::new(IdleTimer {
            deadline: StdMutex::new(None),
            changed: Notify::new(),
        });
        let leases = Arc::new(LeaseTable::default());

        let watchdog = tokio::spawn(idle_watchdog(
            manager.clone(),
            config.clone(),
            leases.clone(),
            timer.clone(),
        ));

        Self {
            manager,
            config,
            leases,
            timer,
            watchdog,
        }
    }

    /// Make the service available, lazily starting it if needed.
    ///
    /// Returns false when on-demand activation is disabled, the service is
    /// Disabled, or the start did not reach Running within its bounds; the
    /// caller should skip caching for this operation.
    pub async fn ensure_ready(&self) -> bool {
        if !self.config.on_demand {
            return false;
        }
        // start() is idempotent and already makes concurrent callers await a
        // single in-flight spawn.
        let ready = self.manager.start().await;
        if ready {
            self.touch();
        }
        ready
    }

    /// Reset the idle timer; called on ensure_ready and after every
    /// successful cache operation.
    pub fn touch(&self) {
        let mut deadline = self.timer.deadline.lock().expect("idle timer poisoned");
        *deadline = Some(Instant::now() + self.config.idle_timeout());
        drop(deadline);
        self.timer.changed.notify_one();
    }

    pub fn acquire_lease(&self, connection_id: &str) -> Lease {
        self.leases.acquire(connection_id)
    }

    pub fn outstanding_leases(&self) -> usize {
        self.leases.outstanding()
    }

    pub fn manager(&self) -> &ServiceProcessManager {
        &self.manager
    }

    /// Stops the watchdog; the managed process is left to the caller's
    /// shutdown sequence.
    pub fn shutdown(&self) {
        self.watchdog.abort();
    }
}

async fn idle_watchdog(
    manager: ServiceProcessManager,
    config: Arc<SupervisorConfig>,
    leases: Arc<LeaseTable>,
    timer: Arc<IdleTimer>,
) {
    loop {
        let armed = *timer.deadline.lock().expect("idle timer poisoned");
        let Some(deadline) = armed else {
            timer.changed.notified().await;
            continue;
        };

        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => {}
            _ = timer.changed.notified() => continue,
        }

        {
            let mut current = timer.deadline.lock().expect("idle timer poisoned");
            // Re-armed while we slept: go around.
            if *current != Some(deadline) {
                continue;
            }
            if leases.outstanding() > 0 {
                // In use; give it another full window.
                *current = Some(Instant::now() + config.idle_timeout());
                continue;
            }
            *current = None;
        }

        let mut state_rx = manager.state_watch();
        if matches!(
            *state_rx.borrow_and_update(),
            ServiceState::Running | ServiceState::Starting
        ) {
            tracing::info!(
                idle_ms = config.idle_timeout_ms,
                "cache service idle, stopping"
            );
            manager.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_count_per_connection_and_release_on_drop() {
        let table = Arc::new(LeaseTable::default());
        let a1 = table.acquire("a");
        let a2 = table.acquire("a");
        let b = table.acquire("b");
        assert_eq!(table.outstanding(), 3);

        drop(a1);
        assert_eq!(table.outstanding(), 2);
        drop(a2);
        drop(b);
        assert_eq!(table.outstanding(), 0);
        assert!(table.by_connection.lock().unwrap().is_empty());
    }

    #[test]
    fn releasing_an_unknown_connection_is_harmless() {
        let table = LeaseTable::default();
        table.release("never-acquired");
        assert_eq!(table.outstanding(), 0);
    }
}
