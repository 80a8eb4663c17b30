use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, trace, warn};

use crate::error::BeesError;
use crate::graceful_shutdown::ShutdownListener;

use super::framer::Framer;
use super::handler::{QueryContext, QueryHandler, ReplySink, Transport};

const READ_CHUNK_SIZE: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closing,
    Closed,
}

/// Why a session ended
#[derive(Debug, Clone)]
pub enum CloseReason {
    /// The peer closed its side of the stream
    Eof,
    /// Read or write failed; the error is kept for diagnostics
    SocketError(BeesError),
    /// The listener is shutting down
    Shutdown,
    /// No traffic within the configured idle timeout
    IdleTimeout,
}

/// One accepted TCP connection: framing, dispatch, and reply writing.
///
/// The session owns its stream exclusively and is consumed by `run`, so it can
/// never outlive the socket. Any `AsyncRead + AsyncWrite` works, which lets
/// tests drive it through an in-memory pipe.
pub struct ConnectionSession<S> {
    id: u64,
    remote: SocketAddr,
    local: SocketAddr,
    stream: S,
    framer: Framer,
    handler: Arc<dyn QueryHandler>,
    shutdown: ShutdownListener,
    idle_timeout: Option<Duration>,
    state_tx: watch::Sender<SessionState>,
    messages: u64,
}

impl<S> ConnectionSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(
        id: u64,
        remote: SocketAddr,
        local: SocketAddr,
        stream: S,
        handler: Arc<dyn QueryHandler>,
        shutdown: ShutdownListener,
    ) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Open);
        Self {
            id,
            remote,
            local,
            stream,
            framer: Framer::new(),
            handler,
            shutdown,
            idle_timeout: None,
            state_tx,
            messages: 0,
        }
    }

    pub fn with_idle_timeout(mut self, idle_timeout: Option<Duration>) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Observe state transitions from outside the session task
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Drive the session until EOF, a socket error, idle timeout, or shutdown.
    pub async fn run(mut self) -> CloseReason {
        let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<Bytes>();
        let mut read_buf = vec![0u8; READ_CHUNK_SIZE];

        debug!("TCP session {} opened for {}", self.id, self.remote);

        let reason = loop {
            tokio::select! {
                biased;

                _ = self.shutdown.wait() => break CloseReason::Shutdown,

                Some(frame) = reply_rx.recv() => {
                    if let Err(e) = self.stream.write_all(&frame).await {
                        break self.socket_error(e);
                    }
                    trace!("TCP session {} wrote {} bytes", self.id, frame.len());
                }

                read = self.stream.read(&mut read_buf) => match read {
                    Ok(0) => break CloseReason::Eof,
                    Ok(n) => self.on_data(&read_buf[..n], &reply_tx),
                    Err(e) => break self.socket_error(e),
                },

                _ = idle(self.idle_timeout) => break CloseReason::IdleTimeout,
            }
        };

        self.transition(SessionState::Closing);

        // From here on every ReplySink handed out by this session reports ReplyDropped
        reply_rx.close();

        if !matches!(reason, CloseReason::SocketError(_)) {
            self.flush_queued(&mut reply_rx).await;
        }

        if !self.framer.is_empty() {
            debug!(
                "TCP session {} discarding {} bytes of incomplete message",
                self.id,
                self.framer.buffered_len()
            );
        }

        let ConnectionSession {
            id,
            remote,
            stream,
            state_tx,
            messages,
            ..
        } = self;
        drop(stream);
        let _ = state_tx.send_replace(SessionState::Closed);

        debug!(
            "TCP session {} for {} closed ({:?}, {} messages)",
            id, remote, reason, messages
        );
        reason
    }

    fn on_data(&mut self, data: &[u8], reply_tx: &mpsc::UnboundedSender<Bytes>) {
        trace!("TCP session {} read {} bytes", self.id, data.len());

        for payload in self.framer.push(data) {
            self.messages += 1;
            self.handler.handle(QueryContext {
                transport: Transport::Tcp,
                remote: self.remote,
                local: self.local,
                session_id: Some(self.id),
                payload,
                reply: ReplySink::tcp(reply_tx.clone()),
            });
        }
    }

    /// Write replies queued before the session started closing
    async fn flush_queued(&mut self, reply_rx: &mut mpsc::UnboundedReceiver<Bytes>) {
        while let Ok(frame) = reply_rx.try_recv() {
            if let Err(e) = self.stream.write_all(&frame).await {
                debug!("TCP session {} failed to flush reply: {}", self.id, e);
                return;
            }
        }
        if let Err(e) = self.stream.shutdown().await {
            trace!("TCP session {} shutdown: {}", self.id, e);
        }
    }

    fn socket_error(&self, err: std::io::Error) -> CloseReason {
        warn!("TCP session {} socket error from {}: {}", self.id, self.remote, err);
        self.handler
            .on_socket_error(Transport::Tcp, Some(self.remote), &err);
        CloseReason::SocketError(BeesError::socket(Transport::Tcp, err))
    }

    fn transition(&self, state: SessionState) {
        trace!("TCP session {} -> {:?}", self.id, state);
        let _ = self.state_tx.send_replace(state);
    }
}

async fn idle(timeout: Option<Duration>) {
    match timeout {
        Some(duration) => tokio::time::sleep(duration).await,
        None => std::future::pending().await,
    }
}
