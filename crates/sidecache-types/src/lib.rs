use uuid::Uuid;

/// Identifier for one spawn of the managed service. A fresh id is minted on
/// every (re)start so status consumers can tell restarts apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct RunId(pub Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of the supervised cache-server process.
///
/// `Disabled` is terminal: restart attempts were exhausted and the supervisor
/// will not spawn again without an explicit manual start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ServiceState {
    NotStarted,
    Starting,
    Running,
    Stopping,
    Stopped,
    Crashed,
    Disabled,
}

impl ServiceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ServiceState::Disabled)
    }
}

/// Point-in-time snapshot of the supervised process.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ServiceStatus {
    pub state: ServiceState,
    pub run_id: Option<RunId>,
    pub pid: Option<u32>,
    pub exit_code: Option<i32>,
    pub restart_attempts: u32,
    pub message: Option<String>,
}

/// Where the health prober currently stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ProbeState {
    Unknown,
    Probing,
    Healthy,
    Unhealthy,
}

/// Snapshot of monitor state, mutated only by the health monitor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct HealthSnapshot {
    pub probe_state: ProbeState,
    pub connected: bool,
    pub last_transition_unix_ms: u64,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl Default for HealthSnapshot {
    fn default() -> Self {
        Self {
            probe_state: ProbeState::Unknown,
            connected: false,
            last_transition_unix_ms: 0,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_ids_are_unique() {
        assert_ne!(RunId::new(), RunId::new());
    }

    #[test]
    fn only_disabled_is_terminal() {
        assert!(ServiceState::Disabled.is_terminal());
        assert!(!ServiceState::Crashed.is_terminal());
        assert!(!ServiceState::Stopped.is_terminal());
    }
}
