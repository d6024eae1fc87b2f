use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::config::SupervisorConfig;
use crate::events::{EventSink, SupervisorEvent};
use crate::lifecycle::IdleLifecycleController;
use crate::resp::{RespConnection, RespError};

/// Connection id used by the single-key convenience methods.
const DEFAULT_CONNECTION: &str = "default";

/// One step of a batch; applied in order, no rollback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BatchOp {
    Set {
        key: String,
        value: Vec<u8>,
        ttl_seconds: Option<u64>,
    },
    Delete {
        key: String,
    },
}

/// Pre-computed state pushed into the cache before it is first read, so the
/// first real lookup hits.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WarmupBundle {
    pub session: Option<Vec<u8>>,
    pub messages: Vec<Vec<u8>>,
    pub profile: Option<Vec<u8>>,
    pub ttl_seconds: Option<u64>,
}

type ConnectionOp<'c, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'c>>;

/// Cache access that never surfaces an error: any failure anywhere in the
/// chain (service down, dial refused, protocol error) resolves as a miss or
/// a no-op. The caller always has its authoritative store to fall back on.
#[derive(Clone)]
pub struct CacheClient {
    lifecycle: Arc<IdleLifecycleController>,
    config: Arc<SupervisorConfig>,
    events: EventSink,
    pool: Arc<Mutex<HashMap<String, RespConnection>>>,
}

impl CacheClient {
    pub fn new(
        lifecycle: Arc<IdleLifecycleController>,
        config: Arc<SupervisorConfig>,
        events: EventSink,
    ) -> Self {
        Self {
            lifecycle,
            config,
            events,
            pool: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Run `op` against a pooled connection. Returns None without running
    /// `op` when the service cannot be made ready; returns None and evicts
    /// the connection when `op` fails. A lease is held for the duration so
    /// the idle timer cannot stop the service mid-operation.
    pub async fn with_connection<T, F>(&self, connection_id: &str, op: F) -> Option<T>
    where
        F: for<'c> FnOnce(&'c mut RespConnection) -> ConnectionOp<'c, T>,
    {
        if !self.lifecycle.ensure_ready().await {
            return None;
        }
        let _lease = self.lifecycle.acquire_lease(connection_id);

        let mut conn = self.checkout(connection_id).await?;
        match tokio::time::timeout(self.config.operation_timeout(), op(&mut conn)).await {
            Ok(Ok(value)) => {
                self.checkin(connection_id, conn).await;
                self.lifecycle.touch();
                Some(value)
            }
            Ok(Err(err)) => {
                // Connection state is unknown after a failure; drop it and
                // let the next operation dial fresh.
                self.degraded("with_connection", &err);
                None
            }
            Err(_) => {
                self.degraded(
                    "with_connection",
                    &anyhow::anyhow!(
                        "operation timed out after {}ms",
                        self.config.operation_timeout_ms
                    ),
                );
                None
            }
        }
    }

    /// Fetch a cached value. None means miss or degradation; the caller
    /// cannot and should not distinguish the two.
    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let key = key.to_string();
        self.with_connection(DEFAULT_CONNECTION, move |conn| {
            Box::pin(async move { Ok(conn.get(&key).await?) })
        })
        .await
        .flatten()
    }

    pub async fn set(&self, key: &str, value: &[u8], ttl_seconds: Option<u64>) {
        let key = key.to_string();
        let value = value.to_vec();
        let _ = self
            .with_connection(DEFAULT_CONNECTION, move |conn| {
                Box::pin(async move {
                    conn.set(&key, &value, ttl_seconds).await?;
                    Ok(())
                })
            })
            .await;
    }

    pub async fn delete(&self, key: &str) {
        let key = key.to_string();
        let _ = self
            .with_connection(DEFAULT_CONNECTION, move |conn| {
                Box::pin(async move {
                    conn.del(&key).await?;
                    Ok(())
                })
            })
            .await;
    }

    /// Apply a sequence of ops on one connection, stopping at the first
    /// failure. Returns how many were applied; partial application is fine,
    /// cached state is advisory.
    pub async fn with_batch(&self, ops: Vec<BatchOp>) -> usize {
        let applied = Arc::new(AtomicUsize::new(0));
        let counter = applied.clone();
        let _ = self
            .with_connection(DEFAULT_CONNECTION, move |conn| {
                Box::pin(async move {
                    for op in &ops {
                        let result = match op {
                            BatchOp::Set {
                                key,
                                value,
                                ttl_seconds,
                            } => conn.set(key, value, *ttl_seconds).await,
                            BatchOp::Delete { key } => conn.del(key).await.map(|_| ()),
                        };
                        match result {
                            Ok(()) => {
                                counter.fetch_add(1, Ordering::Relaxed);
                            }
                            // A server reply means the connection is still in
                            // sync; stop the batch but keep the connection.
                            Err(RespError::Server(msg)) => {
                                tracing::debug!(error = %msg, "batch stopped by server error");
                                break;
                            }
                            // Anything else leaves the connection desynced;
                            // propagate so it gets evicted.
                            Err(err) => return Err(err.into()),
                        }
                    }
                    Ok(())
                })
            })
            .await;
        applied.load(Ordering::Relaxed)
    }

    /// Push an entity's session, message history, and profile into the cache
    /// in one batch. Returns how many entries landed.
    pub async fn warmup(&self, entity_id: &str, bundle: WarmupBundle) -> usize {
        let ops = warmup_ops(entity_id, &bundle);
        if ops.is_empty() {
            return 0;
        }
        self.with_batch(ops).await
    }

    async fn checkout(&self, connection_id: &str) -> Option<RespConnection> {
        if let Some(conn) = self.pool.lock().await.remove(connection_id) {
            return Some(conn);
        }
        let backend = SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.backend_port));
        match RespConnection::connect(backend, self.config.dial_timeout()).await {
            Ok(conn) => Some(conn),
            Err(err) => {
                self.degraded("connect", &anyhow::Error::new(err));
                None
            }
        }
    }

    async fn checkin(&self, connection_id: &str, conn: RespConnection) {
        self.pool
            .lock()
            .await
            .insert(connection_id.to_string(), conn);
    }

    fn degraded(&self, operation: &str, err: &anyhow::Error) {
        tracing::debug!(operation, error = %format!("{err:#}"), "cache degraded, falling back");
        self.events.emit(SupervisorEvent::Degraded {
            operation: operation.to_string(),
            error: format!("{err:#}"),
        });
    }
}

fn warmup_ops(entity_id: &str, bundle: &WarmupBundle) -> Vec<BatchOp> {
    let mut ops = Vec::new();
    if let Some(session) = &bundle.session {
        ops.push(BatchOp::Set {
            key: format!("{entity_id}:session"),
            value: session.clone(),
            ttl_seconds: bundle.ttl_seconds,
        });
    }
    for (i, message) in bundle.messages.iter().enumerate() {
        ops.push(BatchOp::Set {
            key: format!("{entity_id}:messages:{i}"),
            value: message.clone(),
            ttl_seconds: bundle.ttl_seconds,
        });
    }
    if let Some(profile) = &bundle.profile {
        ops.push(BatchOp::Set {
            key: format!("{entity_id}:profile"),
            value: profile.clone(),
            ttl_seconds: bundle.ttl_seconds,
        });
    }
    ops
}
