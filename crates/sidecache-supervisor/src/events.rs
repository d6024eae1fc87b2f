use sidecache_types::{ProbeState, RunId, ServiceState};
use tokio::sync::mpsc;

/// Observability output of the subsystem. The surrounding application can
/// subscribe to these; they are also written to the tracing sink as JSON.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SupervisorEvent {
    StateChanged {
        from: ServiceState,
        to: ServiceState,
        run_id: Option<RunId>,
    },
    RestartScheduled {
        attempt: u32,
        max_attempts: u32,
        delay_ms: u64,
    },
    /// Terminal: restart attempts exhausted, no further automatic spawns.
    ServiceDisabled {
        attempts: u32,
        reason: String,
    },
    HealthChanged {
        from: ProbeState,
        to: ProbeState,
        consecutive_failures: u32,
        error: Option<String>,
    },
    /// A cache operation failed and was converted into a miss/no-op.
    Degraded {
        operation: String,
        error: String,
    },
}

impl SupervisorEvent {
    fn is_alert(&self) -> bool {
        matches!(self, SupervisorEvent::ServiceDisabled { .. })
    }
}

/// Fans events out to tracing and, if the application subscribed, to an
/// unbounded channel. Cloneable and cheap; dropped subscribers are ignored.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<SupervisorEvent>>,
}

impl EventSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SupervisorEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink that only logs, for callers that do not consume events.
    pub fn log_only() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: SupervisorEvent) {
        let json = serde_json::to_string(&event).unwrap_or_else(|_| format!("{event:?}"));
        if event.is_alert() {
            tracing::error!(event = %json, "sidecache alert");
        } else {
            tracing::info!(event = %json, "sidecache event");
        }
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_with_type_tag() {
        let ev = SupervisorEvent::RestartScheduled {
            attempt: 2,
            max_attempts: 5,
            delay_ms: 2000,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"type\":\"restart_scheduled\""));
        assert!(json.contains("\"delay_ms\":2000"));
    }

    #[test]
    fn subscribed_sink_delivers() {
        let (sink, mut rx) = EventSink::new();
        sink.emit(SupervisorEvent::Degraded {
            operation: "get".to_string(),
            error: "connection reset".to_string(),
        });
        let ev = rx.try_recv().unwrap();
        assert!(matches!(ev, SupervisorEvent::Degraded { .. }));
    }

    #[test]
    fn log_only_sink_does_not_panic() {
        EventSink::log_only().emit(SupervisorEvent::ServiceDisabled {
            attempts: 5,
            reason: "exhausted".to_string(),
        });
    }
}
