use std::time::Duration;

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|v| v.parse::<u64>().ok())
}

fn env_u16(name: &str) -> Option<u16> {
    std::env::var(name).ok().and_then(|v| v.parse::<u16>().ok())
}

fn env_bool(name: &str) -> Option<bool> {
    match std::env::var(name).ok()?.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Everything the supervisor needs to run one managed cache service.
///
/// The earlier drafts of this subsystem disagreed on ports, idle windows and
/// restart limits; those values are consolidated here as overridable defaults
/// and nothing downstream hardcodes them.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct SupervisorConfig {
    /// Executable that runs the cache server.
    pub command: String,
    pub args: Vec<String>,
    /// Substring the service prints on stdout once it accepts connections.
    /// Matched after ANSI escape sequences are stripped.
    pub ready_marker: String,

    /// Loopback port the proxy listens on for ordinary clients.
    /// 0 asks the OS for an ephemeral port.
    pub public_port: u16,
    /// Loopback port the managed service itself binds.
    pub backend_port: u16,

    pub startup_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub dial_timeout_ms: u64,
    /// Bound on one client round trip once a connection is established.
    pub operation_timeout_ms: u64,

    /// Window of disuse after which the service is stopped.
    pub idle_timeout_ms: u64,
    /// `false` means the service is externally managed: `ensure_ready` never
    /// activates it and callers skip caching.
    pub on_demand: bool,

    pub restart_backoff_ms: u64,
    pub restart_backoff_max_ms: u64,
    pub restart_max_attempts: u32,
    /// Uptime after which the restart attempt counter resets.
    pub stable_uptime_ms: u64,

    pub keepalive_interval_ms: u64,
    pub health_interval_ms: u64,
    pub probe_timeout_ms: u64,
    /// Probe failures tolerated before a restart is requested.
    pub probe_failure_threshold: u32,

    pub console_max_lines: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            command: "sidecache-server".to_string(),
            args: Vec::new(),
            ready_marker: "Ready to accept connections".to_string(),
            public_port: 6379,
            backend_port: 6380,
            startup_timeout_ms: 8_000,
            stop_grace_ms: 5_000,
            dial_timeout_ms: 2_000,
            operation_timeout_ms: 2_000,
            idle_timeout_ms: 5 * 60 * 1000,
            on_demand: true,
            restart_backoff_ms: 1_000,
            restart_backoff_max_ms: 30_000,
            restart_max_attempts: 5,
            stable_uptime_ms: 60_000,
            keepalive_interval_ms: 45_000,
            health_interval_ms: 90_000,
            probe_timeout_ms: 2_000,
            probe_failure_threshold: 1,
            console_max_lines: 1000,
        }
    }
}

impl SupervisorConfig {
    /// Defaults with `SIDECACHE_*` environment overrides applied. Values are
    /// clamped to sane ranges rather than rejected.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        if let Ok(v) = std::env::var("SIDECACHE_COMMAND")
            && !v.trim().is_empty()
        {
            cfg.command = v;
        }
        if let Ok(v) = std::env::var("SIDECACHE_ARGS") {
            cfg.args = v.split_whitespace().map(|s| s.to_string()).collect();
        }
        if let Ok(v) = std::env::var("SIDECACHE_READY_MARKER")
            && !v.trim().is_empty()
        {
            cfg.ready_marker = v;
        }

        if let Some(p) = env_u16("SIDECACHE_PUBLIC_PORT") {
            cfg.public_port = p;
        }
        if let Some(p) = env_u16("SIDECACHE_BACKEND_PORT") {
            cfg.backend_port = p;
        }

        if let Some(v) = env_u64("SIDECACHE_STARTUP_TIMEOUT_MS") {
            cfg.startup_timeout_ms = v.clamp(1_000, 10 * 60 * 1000);
        }
        if let Some(v) = env_u64("SIDECACHE_STOP_GRACE_MS") {
            cfg.stop_grace_ms = v.clamp(100, 60_000);
        }
        if let Some(v) = env_u64("SIDECACHE_DIAL_TIMEOUT_MS") {
            cfg.dial_timeout_ms = v.clamp(100, 30_000);
        }
        if let Some(v) = env_u64("SIDECACHE_OPERATION_TIMEOUT_MS") {
            cfg.operation_timeout_ms = v.clamp(100, 60_000);
        }
        if let Some(v) = env_u64("SIDECACHE_IDLE_TIMEOUT_MS") {
            cfg.idle_timeout_ms = v.clamp(1_000, 24 * 60 * 60 * 1000);
        }
        if let Some(v) = env_bool("SIDECACHE_ON_DEMAND") {
            cfg.on_demand = v;
        }

        if let Some(v) = env_u64("SIDECACHE_RESTART_BACKOFF_MS") {
            cfg.restart_backoff_ms = v.clamp(100, 10 * 60 * 1000);
        }
        if let Some(v) = env_u64("SIDECACHE_RESTART_BACKOFF_MAX_MS") {
            cfg.restart_backoff_max_ms = v.clamp(cfg.restart_backoff_ms, 60 * 60 * 1000);
        }
        if let Some(v) = env_u64("SIDECACHE_RESTART_MAX_ATTEMPTS") {
            cfg.restart_max_attempts = (v as u32).clamp(0, 1000);
        }
        if let Some(v) = env_u64("SIDECACHE_STABLE_UPTIME_MS") {
            cfg.stable_uptime_ms = v.clamp(1_000, 60 * 60 * 1000);
        }

        if let Some(v) = env_u64("SIDECACHE_KEEPALIVE_INTERVAL_MS") {
            cfg.keepalive_interval_ms = v.clamp(1_000, 60 * 60 * 1000);
        }
        if let Some(v) = env_u64("SIDECACHE_HEALTH_INTERVAL_MS") {
            cfg.health_interval_ms = v.clamp(1_000, 60 * 60 * 1000);
        }
        if let Some(v) = env_u64("SIDECACHE_PROBE_TIMEOUT_MS") {
            cfg.probe_timeout_ms = v.clamp(100, 30_000);
        }
        if let Some(v) = env_u64("SIDECACHE_PROBE_FAILURE_THRESHOLD") {
            cfg.probe_failure_threshold = (v as u32).clamp(0, 100);
        }
        if let Some(v) = env_u64("SIDECACHE_CONSOLE_MAX_LINES") {
            cfg.console_max_lines = (v as usize).clamp(100, 50_000);
        }

        cfg
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_millis(self.dial_timeout_ms)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_millis(self.keepalive_interval_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn stable_uptime(&self) -> Duration {
        Duration::from_millis(self.stable_uptime_ms)
    }
}
