use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::config::ServerConfig;
use crate::error::{BeesError, Result};
use crate::protocol::{QueryHandler, TcpListener, UdpListener};

/// Externally visible lifecycle of a `Server`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Created,
    Running,
    Stopped,
}

struct Listeners {
    udp: UdpListener,
    tcp: TcpListener,
}

enum Lifecycle {
    Created,
    Running(Listeners),
    Stopped,
}

/// The DNS front-end: one UDP socket and one TCP listener on the same port.
///
/// Configuration is fixed at construction. A stopped server cannot be
/// started again; build a new one instead.
pub struct Server {
    config: ServerConfig,
    handler: Arc<dyn QueryHandler>,
    lifecycle: Mutex<Lifecycle>,
}

impl Server {
    pub fn new<H: QueryHandler>(config: ServerConfig, handler: H) -> Self {
        Self::with_shared_handler(config, Arc::new(handler))
    }

    pub fn with_shared_handler(config: ServerConfig, handler: Arc<dyn QueryHandler>) -> Self {
        Self {
            config,
            handler,
            lifecycle: Mutex::new(Lifecycle::Created),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind UDP then TCP and start serving. Returns the shared local address.
    ///
    /// Fails atomically: if either transport cannot bind, nothing stays bound
    /// and the server remains `Created`.
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Created => {}
            Lifecycle::Running(_) => return Err(BeesError::AlreadyRunning),
            Lifecycle::Stopped => return Err(BeesError::ServerStopped),
        }

        self.config.validate()?;

        let listeners = self.bind_all().await?;
        if let Err(e) = self.start_all(&listeners) {
            error!("Failed to start listeners: {}", e);
            listeners.tcp.close().await;
            listeners.udp.close().await;
            return Err(e);
        }

        let local_addr = listeners.udp.local_addr();
        info!("DNS server listening on {} (UDP and TCP)", local_addr);

        *lifecycle = Lifecycle::Running(listeners);
        Ok(local_addr)
    }

    async fn bind_all(&self) -> Result<Listeners> {
        let udp = UdpListener::bind(self.config.bind_addr()).await?;

        // TCP takes the port UDP actually got, so port 0 yields one shared port
        let tcp = match TcpListener::bind(udp.local_addr()).await {
            Ok(tcp) => tcp
                .with_drain_timeout(self.config.drain_timeout)
                .with_max_sessions(self.config.max_tcp_sessions)
                .with_idle_timeout(self.config.tcp_idle_timeout),
            Err(e) => {
                error!("{}; releasing UDP socket", e);
                udp.close().await;
                return Err(e);
            }
        };

        Ok(Listeners { udp, tcp })
    }

    fn start_all(&self, listeners: &Listeners) -> Result<()> {
        listeners.udp.start(self.handler.clone())?;
        listeners.tcp.start(self.handler.clone())
    }

    /// Close TCP (draining sessions) and then UDP.
    ///
    /// Idempotent, and always leaves the server `Stopped`. Once this returns
    /// no handler invocation is in progress or will happen.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running(listeners) => {
                info!("Stopping DNS server on {}", listeners.udp.local_addr());
                listeners.tcp.close().await;
                listeners.udp.close().await;
                info!("DNS server stopped");
            }
            Lifecycle::Created => debug!("Server stopped before it was started"),
            Lifecycle::Stopped => debug!("Server already stopped"),
        }
    }

    pub async fn state(&self) -> ServerState {
        match *self.lifecycle.lock().await {
            Lifecycle::Created => ServerState::Created,
            Lifecycle::Running(_) => ServerState::Running,
            Lifecycle::Stopped => ServerState::Stopped,
        }
    }

    /// Address both transports are bound to, while running
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running(listeners) => Some(listeners.udp.local_addr()),
            _ => None,
        }
    }

    pub async fn active_sessions(&self) -> usize {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running(listeners) => listeners.tcp.active_sessions(),
            _ => 0,
        }
    }
}
