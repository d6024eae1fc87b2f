use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use sidecache_types::ServiceState;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Republishes the managed service's private backend port on the
/// conventional public port. The service itself binds an alternate port to
/// avoid collisions; ordinary clients connect here.
#[derive(Debug)]
pub struct NetworkProxy {
    public_port: u16,
    backend_port: u16,
    dial_timeout: Duration,
    state_rx: watch::Receiver<ServiceState>,
}

/// Running proxy listener. Dropping the handle leaves the listener running;
/// call `shutdown` to close it.
#[derive(Debug)]
pub struct ProxyHandle {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
}

impl ProxyHandle {
    /// Actual listen address (useful when the public port was 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn shutdown(self) {
        self.accept_task.abort();
    }
}

impl NetworkProxy {
    pub fn new(
        public_port: u16,
        backend_port: u16,
        dial_timeout: Duration,
        state_rx: watch::Receiver<ServiceState>,
    ) -> Self {
        Self {
            public_port,
            backend_port,
            dial_timeout,
            state_rx,
        }
    }

    pub async fn listen(&self) -> anyhow::Result<ProxyHandle> {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, self.public_port))
            .await
            .with_context(|| format!("bind proxy port {}", self.public_port))?;
        let local_addr = listener.local_addr().context("proxy local addr")?;
        let backend = SocketAddr::from((Ipv4Addr::LOCALHOST, self.backend_port));
        let dial_timeout = self.dial_timeout;
        let state_rx = self.state_rx.clone();

        tracing::info!(%local_addr, backend_port = self.backend_port, "cache proxy listening");

        let accept_task = tokio::spawn(async move {
            loop {
                let (inbound, peer) = match listener.accept().await {
                    Ok(v) => v,
                    Err(err) => {
                        tracing::warn!(error = %err, "proxy accept failed");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                };

                // Fail fast while the service is not running: no queueing,
                // the client sees an immediate close and falls back.
                if *state_rx.borrow() != ServiceState::Running {
                    tracing::debug!(%peer, "proxy refused connection: service not running");
                    continue;
                }

                tokio::spawn(forward(inbound, backend, dial_timeout));
            }
        });

        Ok(ProxyHandle {
            local_addr,
            accept_task,
        })
    }
}

/// One proxied connection pair. The inbound and backend sockets share a
/// lifetime: the first EOF or error on either side drops both.
async fn forward(mut inbound: TcpStream, backend: SocketAddr, dial_timeout: Duration) {
    let mut outbound =
        match tokio::time::timeout(dial_timeout, TcpStream::connect(backend)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                tracing::debug!(error = %err, %backend, "proxy dial failed, closing inbound");
                return;
            }
            Err(_) => {
                tracing::debug!(%backend, "proxy dial timed out, closing inbound");
                return;
            }
        };

    inbound.set_nodelay(true).ok();
    outbound.set_nodelay(true).ok();

    let (mut inbound_rd, mut inbound_wr) = inbound.split();
    let (mut outbound_rd, mut outbound_wr) = outbound.split();

    tokio::select! {
        _ = tokio::io::copy(&mut inbound_rd, &mut outbound_wr) => {}
        _ = tokio::io::copy(&mut outbound_rd, &mut inbound_wr) => {}
    }
    // Both sockets drop here, tearing down whichever side was still open.
}
