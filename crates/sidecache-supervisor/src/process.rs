use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sidecache_types::{RunId, ServiceState, ServiceStatus};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::{Mutex, oneshot, watch};

use crate::config::SupervisorConfig;
use crate::console::{ConsoleBuffer, strip_ansi};
use crate::events::{EventSink, SupervisorEvent};

#[derive(Debug)]
struct ServiceEntry {
    state: ServiceState,
    run_id: Option<RunId>,
    pid: Option<u32>,
    pgid: Option<i32>,
    exit_code: Option<i32>,
    restart_attempts: u32,
    restart_in_flight: bool,
    message: Option<String>,
    /// Bumped on every spawn so stale watcher tasks can tell they lost.
    generation: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RestartDecision {
    Retry { attempt: u32, delay: Duration },
    Disable,
}

/// Exponential backoff ladder: attempt is 1-based, delay = base * 2^(attempt-1)
/// capped at the configured maximum. Exhausted attempts disable the service.
pub(crate) fn restart_decision(cfg: &SupervisorConfig, attempts_so_far: u32) -> RestartDecision {
    if attempts_so_far >= cfg.restart_max_attempts {
        return RestartDecision::Disable;
    }
    let attempt = attempts_so_far + 1;
    let pow = attempt.saturating_sub(1).min(30);
    let mult = 1u64.checked_shl(pow).unwrap_or(u64::MAX);
    let delay_ms = cfg
        .restart_backoff_ms
        .saturating_mul(mult)
        .min(cfg.restart_backoff_max_ms);
    RestartDecision::Retry {
        attempt,
        delay: Duration::from_millis(delay_ms),
    }
}

#[cfg(target_os = "linux")]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    // If the supervisor dies, make sure the cache server goes with it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, libc::SIGTERM) };
    if rc == -1 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
unsafe fn set_parent_death_signal() -> std::io::Result<()> {
    Ok(())
}

#[cfg(unix)]
use libc::{SIGKILL, SIGTERM};
#[cfg(not(unix))]
const SIGTERM: i32 = 15;
#[cfg(not(unix))]
const SIGKILL: i32 = 9;

#[cfg(unix)]
fn kill_group(pgid: Option<i32>, signal: i32) {
    if let Some(pgid) = pgid {
        unsafe {
            libc::kill(-pgid, signal);
        }
    }
}

#[cfg(not(unix))]
fn kill_group(_pgid: Option<i32>, _signal: i32) {}

/// Owns the one supervised cache-server process: spawn, readiness, stop,
/// crash-triggered restarts. All state mutation is serialized behind one
/// mutex and published on a watch channel so callers can await transitions
/// instead of polling.
#[derive(Debug, Clone)]
pub struct ServiceProcessManager {
    config: Arc<SupervisorConfig>,
    events: EventSink,
    inner: Arc<Mutex<ServiceEntry>>,
    state_tx: Arc<watch::Sender<ServiceState>>,
    console: Arc<Mutex<ConsoleBuffer>>,
}

impl ServiceProcessManager {
    pub fn new(config: Arc<SupervisorConfig>, events: EventSink) -> Self {
        let (state_tx, _) = watch::channel(ServiceState::NotStarted);
        let console = ConsoleBuffer::new(config.console_max_lines);
        Self {
            config,
            events,
            inner: Arc::new(Mutex::new(ServiceEntry {
                state: ServiceState::NotStarted,
                run_id: None,
                pid: None,
                pgid: None,
                exit_code: None,
                restart_attempts: 0,
                restart_in_flight: false,
                message: None,
                generation: 0,
            })),
            state_tx: Arc::new(state_tx),
            console: Arc::new(Mutex::new(console)),
        }
    }

    pub fn state_watch(&self) -> watch::Receiver<ServiceState> {
        self.state_tx.subscribe()
    }

    pub async fn status(&self) -> ServiceStatus {
        let entry = self.inner.lock().await;
        ServiceStatus {
            state: entry.state,
            run_id: entry.run_id,
            pid: entry.pid,
            exit_code: entry.exit_code,
            restart_attempts: entry.restart_attempts,
            message: entry.message.clone(),
        }
    }

    /// Recent console output of the managed service, for operator debugging.
    pub async fn tail_console(&self, cursor: u64, limit: usize) -> (Vec<String>, u64) {
        self.console.lock().await.tail_after(cursor, limit)
    }

    fn transition(&self, entry: &mut ServiceEntry, to: ServiceState) {
        if entry.state == to {
            return;
        }
        let from = entry.state;
        entry.state = to;
        let _ = self.state_tx.send(to);
        self.events.emit(SupervisorEvent::StateChanged {
            from,
            to,
            run_id: entry.run_id,
        });
    }

    /// Idempotent start. Returns true once the service is Running.
    ///
    /// A concurrent caller that finds a start already in flight awaits its
    /// outcome rather than spawning a second process.
    pub async fn start(&self) -> bool {
        loop {
            let observed;
            {
                let mut entry = self.inner.lock().await;
                match entry.state {
                    ServiceState::Running => return true,
                    ServiceState::Disabled => return false,
                    ServiceState::Starting | ServiceState::Stopping => {
                        observed = entry.state;
                    }
                    ServiceState::NotStarted | ServiceState::Stopped | ServiceState::Crashed => {
                        entry.generation += 1;
                        let generation = entry.generation;
                        self.transition(&mut entry, ServiceState::Starting);
                        drop(entry);
                        return self.spawn_child(generation).await;
                    }
                }
            }

            let mut rx = self.state_tx.subscribe();
            match observed {
                ServiceState::Starting => {
                    let bound = self.config.startup_timeout() + Duration::from_secs(1);
                    let res = tokio::time::timeout(
                        bound,
                        rx.wait_for(|s| !matches!(s, ServiceState::Starting)),
                    )
                    .await;
                    return matches!(res, Ok(Ok(s)) if *s == ServiceState::Running);
                }
                _ => {
                    // A stop is in flight; wait for it to land, then retry.
                    let bound = self.config.stop_grace() + Duration::from_secs(3);
                    let res = tokio::time::timeout(
                        bound,
                        rx.wait_for(|s| !matches!(s, ServiceState::Stopping)),
                    )
                    .await;
                    if res.is_err() {
                        return false;
                    }
                }
            }
        }
    }

    // Boxed to break the async recursion cycle (watch_exit's restart task
    // re-enters start) so the spawned futures stay `Send`.
    fn spawn_child(
        &self,
        generation: u64,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = bool> + Send + '_>> {
        Box::pin(async move {
            match self.try_spawn(generation).await {
                Ok(()) => true,
                Err(err) => {
                    tracing::warn!(error = %format!("{err:#}"), "cache service start failed");
                    let mut entry = self.inner.lock().await;
                    if entry.generation == generation && entry.state == ServiceState::Starting {
                        entry.message = Some(format!("start failed: {err:#}"));
                        self.transition(&mut entry, ServiceState::Crashed);
                    }
                    false
                }
            }
        })
    }

    async fn try_spawn(&self, generation: u64) -> anyhow::Result<()> {
        let cfg = self.config.as_ref();

        let mut cmd = Command::new(&cfg.command);
        cmd.args(&cfg.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        #[cfg(unix)]
        {
            unsafe {
                cmd.pre_exec(|| {
                    // New session so the whole process tree can be signalled.
                    set_parent_death_signal()?;
                    if libc::setsid() == -1 {
                        return Err(std::io::Error::last_os_error());
                    }
                    Ok(())
                });
            }
        }

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawn cache service: exec={}", cfg.command))?;
        let started = tokio::time::Instant::now();
        let pid = child.id();
        let pgid = pid.map(|p| p as i32);
        let run_id = RunId::new();

        // The service reads nothing from stdin; close it so it sees EOF.
        drop(child.stdin.take());
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        if let Some(out) = stdout {
            let console = self.console.clone();
            let marker = cfg.ready_marker.clone();
            let mut ready_tx = Some(ready_tx);
            tokio::spawn(async move {
                let mut lines = BufReader::new(out).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let clean = strip_ansi(&line);
                    if ready_tx.is_some() && clean.contains(&marker) {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                    console.lock().await.push_line(format!("[stdout] {clean}"));
                }
            });
        }
        if let Some(err) = stderr {
            let console = self.console.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(err).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let clean = strip_ansi(&line);
                    tracing::warn!(line = %clean, "cache service stderr");
                    console.lock().await.push_line(format!("[stderr] {clean}"));
                }
            });
        }

        {
            let mut entry = self.inner.lock().await;
            if entry.generation != generation {
                drop(entry);
                kill_group(pgid, SIGKILL);
                anyhow::bail!("start superseded by a newer spawn");
            }
            entry.pid = pid;
            entry.pgid = pgid;
            entry.run_id = Some(run_id);
            entry.exit_code = None;
            entry.message = Some("waiting for readiness marker".to_string());
        }

        let manager = self.clone();
        tokio::spawn(async move {
            manager.watch_exit(child, generation, started).await;
        });

        let mut rx = self.state_tx.subscribe();
        tokio::select! {
            res = ready_rx => {
                if res.is_err() {
                    // stdout closed without the marker; the exit watcher
                    // records the exit itself.
                    anyhow::bail!("service exited before printing readiness marker");
                }
                let mut entry = self.inner.lock().await;
                if entry.generation != generation || entry.state != ServiceState::Starting {
                    anyhow::bail!("start aborted: state changed during readiness wait");
                }
                entry.message = None;
                self.transition(&mut entry, ServiceState::Running);
                Ok(())
            }
            _ = async {
                // The watch ref holds a lock guard; drop it in here so it
                // never lives across the other arms' awaits.
                let _ = rx.wait_for(|s| !matches!(s, ServiceState::Starting)).await;
            } => {
                anyhow::bail!("start aborted: state changed during readiness wait")
            }
            _ = tokio::time::sleep(cfg.startup_timeout()) => {
                // No orphans: take the whole group down before giving up.
                kill_group(pgid, SIGKILL);
                anyhow::bail!(
                    "readiness marker not seen within {}ms",
                    cfg.startup_timeout_ms
                )
            }
        }
    }

    async fn watch_exit(
        &self,
        mut child: tokio::process::Child,
        generation: u64,
        started: tokio::time::Instant,
    ) {
        let res = child.wait().await;
        let uptime = started.elapsed();

        let mut entry = self.inner.lock().await;
        if entry.generation != generation {
            return;
        }
        entry.exit_code = res.as_ref().ok().and_then(|s| s.code());
        entry.pid = None;
        entry.pgid = None;

        let prev = entry.state;
        match prev {
            ServiceState::Stopping => {
                entry.message = Some("stopped".to_string());
                self.transition(&mut entry, ServiceState::Stopped);
                return;
            }
            ServiceState::Starting => {
                entry.message = Some("exited before becoming ready".to_string());
                self.transition(&mut entry, ServiceState::Crashed);
                return;
            }
            ServiceState::Running => {
                entry.message = Some(match &res {
                    Ok(status) => format!(
                        "exited unexpectedly (code {:?}) after {}ms",
                        status.code(),
                        uptime.as_millis()
                    ),
                    Err(err) => format!("wait failed: {err}"),
                });
                self.transition(&mut entry, ServiceState::Crashed);
            }
            _ => return,
        }

        // Abnormal exit while Running: bounded, backed-off auto-restart.
        if uptime >= self.config.stable_uptime() {
            entry.restart_attempts = 0;
        }
        match restart_decision(&self.config, entry.restart_attempts) {
            RestartDecision::Retry { attempt, delay } => {
                entry.restart_attempts = attempt;
                entry.restart_in_flight = true;
                self.events.emit(SupervisorEvent::RestartScheduled {
                    attempt,
                    max_attempts: self.config.restart_max_attempts,
                    delay_ms: delay.as_millis() as u64,
                });
                drop(entry);

                let manager = self.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    {
                        let mut entry = manager.inner.lock().await;
                        // A manual stop in the meantime cancels the restart.
                        if entry.generation != generation
                            || entry.state != ServiceState::Crashed
                        {
                            entry.restart_in_flight = false;
                            return;
                        }
                    }
                    let ok = manager.start().await;
                    manager.inner.lock().await.restart_in_flight = false;
                    if !ok {
                        tracing::warn!(attempt, "auto-restart did not reach running state");
                    }
                });
            }
            RestartDecision::Disable => {
                let attempts = entry.restart_attempts;
                entry.message = Some("restart attempts exhausted".to_string());
                self.transition(&mut entry, ServiceState::Disabled);
                self.events.emit(SupervisorEvent::ServiceDisabled {
                    attempts,
                    reason: "max consecutive restart attempts reached".to_string(),
                });
            }
        }
    }

    /// Terminate-then-kill stop. Always lands in Stopped and resets the
    /// restart attempt counter.
    pub async fn stop(&self) {
        let pgid;
        {
            let mut entry = self.inner.lock().await;
            entry.restart_attempts = 0;
            match entry.state {
                ServiceState::Stopped => return,
                ServiceState::NotStarted
                | ServiceState::Crashed
                | ServiceState::Disabled => {
                    entry.message = Some("stopped".to_string());
                    self.transition(&mut entry, ServiceState::Stopped);
                    return;
                }
                _ => {}
            }
            pgid = entry.pgid;
            self.transition(&mut entry, ServiceState::Stopping);
        }

        kill_group(pgid, SIGTERM);

        let mut rx = self.state_tx.subscribe();
        let graceful = tokio::time::timeout(
            self.config.stop_grace(),
            rx.wait_for(|s| matches!(s, ServiceState::Stopped)),
        )
        .await
        .is_ok();
        if graceful {
            return;
        }

        kill_group(pgid, SIGKILL);
        let killed = tokio::time::timeout(
            Duration::from_secs(2),
            rx.wait_for(|s| matches!(s, ServiceState::Stopped)),
        )
        .await
        .is_ok();
        if !killed {
            // Exit watcher never reported; record the stop ourselves.
            let mut entry = self.inner.lock().await;
            entry.message = Some("killed after timeout".to_string());
            self.transition(&mut entry, ServiceState::Stopped);
        }
    }

    /// Stop-then-start on behalf of the health monitor. Guarded so at most
    /// one restart is ever in flight; a losing caller returns false without
    /// touching the process.
    pub async fn restart(&self) -> bool {
        {
            let mut entry = self.inner.lock().await;
            if entry.restart_in_flight || entry.state == ServiceState::Disabled {
                return false;
            }
            entry.restart_in_flight = true;
        }

        self.stop().await;
        let ok = self.start().await;

        self.inner.lock().await.restart_in_flight = false;
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(base_ms: u64, max_ms: u64, attempts: u32) -> SupervisorConfig {
        SupervisorConfig {
            restart_backoff_ms: base_ms,
            restart_backoff_max_ms: max_ms,
            restart_max_attempts: attempts,
            ..SupervisorConfig::default()
        }
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let cfg = cfg(1000, 60_000, 10);
        let mut last = Duration::ZERO;
        for attempts_so_far in 0..5 {
            match restart_decision(&cfg, attempts_so_far) {
                RestartDecision::Retry { attempt, delay } => {
                    assert_eq!(attempt, attempts_so_far + 1);
                    assert_eq!(delay.as_millis() as u64, 1000u64 << attempts_so_far);
                    assert!(delay >= last);
                    last = delay;
                }
                RestartDecision::Disable => panic!("disabled too early"),
            }
        }
    }

    #[test]
    fn backoff_caps_at_maximum() {
        let cfg = cfg(1000, 4000, 20);
        match restart_decision(&cfg, 10) {
            RestartDecision::Retry { delay, .. } => {
                assert_eq!(delay, Duration::from_millis(4000));
            }
            RestartDecision::Disable => panic!("should retry"),
        }
    }

    #[test]
    fn exhausted_attempts_disable() {
        let cfg = cfg(1000, 30_000, 3);
        assert!(matches!(
            restart_decision(&cfg, 3),
            RestartDecision::Disable
        ));
        assert!(matches!(
            restart_decision(&cfg, 2),
            RestartDecision::Retry { attempt: 3, .. }
        ));
    }

    #[test]
    fn zero_max_attempts_disables_immediately() {
        let cfg = cfg(1000, 30_000, 0);
        assert!(matches!(
            restart_decision(&cfg, 0),
            RestartDecision::Disable
        ));
    }

    #[test]
    fn manager_futures_are_send() {
        fn assert_send<T: Send>(_: &T) {}
        let manager = ServiceProcessManager::new(
            Arc::new(SupervisorConfig::default()),
            EventSink::log_only(),
        );
        // start/stop/restart get handed to tokio::spawn by the auto-restart
        // scheduler and the health monitor.
        assert_send(&manager.start());
        assert_send(&manager.stop());
        assert_send(&manager.restart());
    }

    #[test]
    fn huge_attempt_counts_do_not_overflow() {
        let cfg = cfg(1000, u64::MAX, u32::MAX);
        match restart_decision(&cfg, 40) {
            RestartDecision::Retry { delay, .. } => {
                assert!(delay.as_millis() > 0);
            }
            RestartDecision::Disable => panic!("should retry"),
        }
    }
}
