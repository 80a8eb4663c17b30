use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{self, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, trace, warn};

use crate::error::{BeesError, Result};
use crate::graceful_shutdown::{GracefulShutdown, ShutdownListener};

use super::connection_manager::{ConnectionManager, ConnectionStats};
use super::handler::{QueryHandler, Transport};
use super::session::{CloseReason, ConnectionSession};

pub const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Owns the server's TCP listening socket and every session it accepts.
pub struct TcpListener {
    listener: Mutex<Option<net::TcpListener>>,
    local_addr: SocketAddr,
    shutdown: GracefulShutdown,
    sessions: Arc<ConnectionManager>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    drain_timeout: Duration,
    idle_timeout: Option<Duration>,
}

/// Everything the accept loop needs, moved into its task
struct AcceptLoop {
    listener: net::TcpListener,
    local_addr: SocketAddr,
    handler: Arc<dyn QueryHandler>,
    sessions: Arc<ConnectionManager>,
    shutdown: ShutdownListener,
    drain_timeout: Duration,
    idle_timeout: Option<Duration>,
}

impl TcpListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = net::TcpListener::bind(addr)
            .await
            .map_err(|e| BeesError::bind(Transport::Tcp, addr, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BeesError::bind(Transport::Tcp, addr, e))?;

        info!("TCP listener bound on {}", local_addr);

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            shutdown: GracefulShutdown::new("TCP"),
            sessions: Arc::new(ConnectionManager::new(0)),
            accept_task: Mutex::new(None),
            drain_timeout: DEFAULT_DRAIN_TIMEOUT,
            idle_timeout: None,
        })
    }

    pub fn with_drain_timeout(mut self, drain_timeout: Duration) -> Self {
        self.drain_timeout = drain_timeout;
        self
    }

    /// Cap concurrent sessions (0 = unlimited)
    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.sessions = Arc::new(ConnectionManager::new(max_sessions));
        self
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.active_sessions()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.sessions.stats()
    }

    /// Start accepting connections, one `ConnectionSession` per client
    pub fn start(&self, handler: Arc<dyn QueryHandler>) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(BeesError::ServerStopped);
        }

        let listener = self
            .listener
            .lock()
            .take()
            .ok_or(BeesError::AlreadyRunning)?;

        let accept_loop = AcceptLoop {
            listener,
            local_addr: self.local_addr,
            handler,
            sessions: self.sessions.clone(),
            shutdown: self.shutdown.subscribe(),
            drain_timeout: self.drain_timeout,
            idle_timeout: self.idle_timeout,
        };
        *self.accept_task.lock() = Some(tokio::spawn(accept_loop.run()));

        debug!("TCP listener on {} started", self.local_addr);
        Ok(())
    }

    /// Stop accepting, ask every session to close, and wait for them to
    /// release their sockets. Sessions still alive after the drain timeout
    /// are aborted. Safe to call repeatedly.
    pub async fn close(&self) {
        if !self.shutdown.trigger() {
            debug!("TCP listener on {} already closed", self.local_addr);
            return;
        }

        // Never started: just release the listening socket
        self.listener.lock().take();

        let accept_task = self.accept_task.lock().take();
        if let Some(task) = accept_task {
            if let Err(e) = task.await {
                error!("TCP accept task failed: {}", e);
            }
        }

        info!("TCP listener on {} closed", self.local_addr);
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_triggered() && self.accept_task.lock().is_none()
    }
}

impl AcceptLoop {
    async fn run(mut self) {
        let mut sessions = JoinSet::new();

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.wait() => {
                    debug!("TCP accept loop received shutdown signal");
                    break;
                }

                Some(joined) = sessions.join_next(), if !sessions.is_empty() => {
                    if let Err(e) = joined {
                        error!("TCP session task failed: {}", e);
                    }
                }

                accepted = self.listener.accept() => match accepted {
                    Ok((stream, remote)) => self.spawn_session(&mut sessions, stream, remote),
                    Err(e) => {
                        error!("TCP accept error on {}: {}", self.local_addr, e);
                        self.handler.on_socket_error(Transport::Tcp, None, &e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
            }
        }

        let AcceptLoop {
            listener,
            local_addr,
            sessions: manager,
            drain_timeout,
            ..
        } = self;

        // Stop accepting before draining
        drop(listener);
        debug!("TCP listener on {} stopped accepting", local_addr);

        drain(sessions, &manager, drain_timeout).await;
    }

    fn spawn_session(&self, sessions: &mut JoinSet<()>, stream: TcpStream, remote: SocketAddr) {
        if !self.handler.accept_connection(remote) {
            debug!("Connection from {} refused by handler", remote);
            self.sessions.reject();
            return;
        }

        let Some(guard) = self.sessions.register(remote) else {
            return;
        };

        if let Err(e) = stream.set_nodelay(true) {
            trace!("Failed to set TCP_NODELAY for {}: {}", remote, e);
        }

        let session = ConnectionSession::new(
            guard.id(),
            remote,
            self.local_addr,
            stream,
            self.handler.clone(),
            self.shutdown.clone(),
        )
        .with_idle_timeout(self.idle_timeout);

        let id = session.id();
        sessions.spawn(async move {
            let _guard = guard;
            if let CloseReason::SocketError(e) = session.run().await {
                debug!("TCP session {} for {} ended with error: {}", id, remote, e);
            }
        });
    }
}

async fn drain(mut sessions: JoinSet<()>, manager: &ConnectionManager, drain_timeout: Duration) {
    if sessions.is_empty() {
        return;
    }

    info!("Draining {} TCP sessions", sessions.len());

    let drained = tokio::time::timeout(drain_timeout, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            "TCP drain timed out after {:?}, aborting {} sessions",
            drain_timeout,
            sessions.len()
        );
        for info in manager.snapshot() {
            debug!("Forcibly closing session {} ({})", info.id, info.remote);
        }
        sessions.shutdown().await;
    }
}
