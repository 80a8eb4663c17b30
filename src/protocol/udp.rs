use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::{BeesError, Result};
use crate::graceful_shutdown::{GracefulShutdown, ShutdownListener};

use super::handler::{OutboundDatagram, QueryContext, QueryHandler, ReplySink, Transport};

/// Largest UDP payload; receiving into anything smaller truncates silently
pub const MAX_DATAGRAM_LEN: usize = 65535;

/// Owns the server's single datagram socket.
///
/// Each datagram is one complete query. Replies queued through a `ReplySink`
/// are written by a dedicated send task so the receive loop never waits on
/// the network or on the handler.
pub struct UdpListener {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    shutdown: GracefulShutdown,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl UdpListener {
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|e| BeesError::bind(Transport::Udp, addr, e))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| BeesError::bind(Transport::Udp, addr, e))?;

        info!("UDP listener bound on {}", local_addr);

        Ok(Self {
            socket: Mutex::new(Some(Arc::new(socket))),
            local_addr,
            shutdown: GracefulShutdown::new("UDP"),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Start receiving datagrams and dispatching them to `handler`
    pub fn start(&self, handler: Arc<dyn QueryHandler>) -> Result<()> {
        if self.shutdown.is_triggered() {
            return Err(BeesError::ServerStopped);
        }

        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return Err(BeesError::AlreadyRunning);
        }

        let socket = match self.socket.lock().as_ref() {
            Some(socket) => socket.clone(),
            None => return Err(BeesError::ServerStopped),
        };

        let (reply_tx, reply_rx) = mpsc::unbounded_channel();

        tasks.push(tokio::spawn(recv_loop(
            socket.clone(),
            handler.clone(),
            reply_tx,
            self.local_addr,
            self.shutdown.subscribe(),
        )));
        tasks.push(tokio::spawn(send_loop(
            socket,
            reply_rx,
            handler,
            self.shutdown.subscribe(),
        )));

        debug!("UDP listener on {} started", self.local_addr);
        Ok(())
    }

    /// Stop both loops and release the socket. Safe to call repeatedly.
    pub async fn close(&self) {
        if !self.shutdown.trigger() {
            debug!("UDP listener on {} already closed", self.local_addr);
            return;
        }

        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            match task.await {
                Ok(()) => {}
                Err(e) if e.is_panic() => {
                    warn!(
                        "UDP listener task on {} had panicked; the query handler must not panic",
                        self.local_addr
                    );
                }
                Err(e) => error!("UDP listener task failed: {}", e),
            }
        }

        self.socket.lock().take();
        info!("UDP listener on {} closed", self.local_addr);
    }

    pub fn is_closed(&self) -> bool {
        self.socket.lock().is_none()
    }
}

async fn recv_loop(
    socket: Arc<UdpSocket>,
    handler: Arc<dyn QueryHandler>,
    reply_tx: mpsc::UnboundedSender<OutboundDatagram>,
    local_addr: SocketAddr,
    mut shutdown: ShutdownListener,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_LEN];

    loop {
        tokio::select! {
            biased;

            _ = shutdown.wait() => {
                debug!("UDP receive loop received shutdown signal");
                break;
            }

            result = socket.recv_from(&mut buf) => match result {
                Ok((len, remote)) => {
                    trace!("UDP datagram of {} bytes from {}", len, remote);
                    handler.handle(QueryContext {
                        transport: Transport::Udp,
                        remote,
                        local: local_addr,
                        session_id: None,
                        payload: Bytes::copy_from_slice(&buf[..len]),
                        reply: ReplySink::udp(reply_tx.clone(), remote),
                    });
                }
                Err(e) => {
                    // One bad datagram must not stop the listener
                    warn!("UDP receive error on {}: {}", local_addr, e);
                    handler.on_socket_error(Transport::Udp, None, &e);
                }
            },
        }
    }
}

async fn send_loop(
    socket: Arc<UdpSocket>,
    mut reply_rx: mpsc::UnboundedReceiver<OutboundDatagram>,
    handler: Arc<dyn QueryHandler>,
    mut shutdown: ShutdownListener,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.wait() => break,

            next = reply_rx.recv() => match next {
                Some(datagram) => send_reply(&socket, &handler, datagram).await,
                None => break,
            },
        }
    }

    reply_rx.close();
    while let Ok(datagram) = reply_rx.try_recv() {
        send_reply(&socket, &handler, datagram).await;
    }
    debug!("UDP send loop stopped");
}

async fn send_reply(socket: &UdpSocket, handler: &Arc<dyn QueryHandler>, datagram: OutboundDatagram) {
    match socket.send_to(&datagram.payload, datagram.remote).await {
        Ok(sent) => trace!("Sent {} bytes to {}", sent, datagram.remote),
        Err(e) => {
            warn!("Failed to send UDP reply to {}: {}", datagram.remote, e);
            handler.on_socket_error(Transport::Udp, Some(datagram.remote), &e);
        }
    }
}
