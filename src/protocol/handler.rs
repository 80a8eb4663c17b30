use bytes::Bytes;
use std::fmt;
use std::net::SocketAddr;
use tokio::sync::mpsc;

use crate::error::{BeesError, Result};

use super::framer::Framer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Udp,
    Tcp,
}

impl Transport {
    /// Get protocol name for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Udp => "UDP",
            Transport::Tcp => "TCP",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A reply addressed to one UDP peer, queued for the listener's send task
#[derive(Debug)]
pub(crate) struct OutboundDatagram {
    pub payload: Bytes,
    pub remote: SocketAddr,
}

#[derive(Debug, Clone)]
enum ReplyRoute {
    Udp {
        tx: mpsc::UnboundedSender<OutboundDatagram>,
        remote: SocketAddr,
    },
    Tcp {
        tx: mpsc::UnboundedSender<Bytes>,
    },
}

/// Routes a reply back over the transport the query arrived on.
///
/// The sink can be cloned and moved into spawned tasks; it stays usable after
/// the dispatch that produced it has returned. Once the socket behind it is
/// gone every reply fails with `ReplyDropped`.
#[derive(Debug, Clone)]
pub struct ReplySink {
    route: ReplyRoute,
}

impl ReplySink {
    pub(crate) fn udp(tx: mpsc::UnboundedSender<OutboundDatagram>, remote: SocketAddr) -> Self {
        Self {
            route: ReplyRoute::Udp { tx, remote },
        }
    }

    pub(crate) fn tcp(tx: mpsc::UnboundedSender<Bytes>) -> Self {
        Self {
            route: ReplyRoute::Tcp { tx },
        }
    }

    /// Queue `payload` for delivery.
    ///
    /// TCP replies are length-prefixed here and fail with `MessageTooLarge`
    /// above 65535 bytes. UDP replies are sent as-is; truncation is the
    /// caller's business.
    pub fn reply(&self, payload: impl Into<Bytes>) -> Result<()> {
        let payload = payload.into();
        match &self.route {
            ReplyRoute::Udp { tx, remote } => tx
                .send(OutboundDatagram {
                    payload,
                    remote: *remote,
                })
                .map_err(|_| BeesError::ReplyDropped),
            ReplyRoute::Tcp { tx } => {
                let framed = Framer::wrap(&payload)?;
                tx.send(framed).map_err(|_| BeesError::ReplyDropped)
            }
        }
    }

    /// True once replies can no longer be delivered
    pub fn is_closed(&self) -> bool {
        match &self.route {
            ReplyRoute::Udp { tx, .. } => tx.is_closed(),
            ReplyRoute::Tcp { tx } => tx.is_closed(),
        }
    }
}

/// Everything the resolution layer needs to answer one inbound message.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub transport: Transport,
    pub remote: SocketAddr,
    pub local: SocketAddr,
    /// Id of the TCP session the message arrived on (None for UDP)
    pub session_id: Option<u64>,
    pub payload: Bytes,
    pub reply: ReplySink,
}

impl QueryContext {
    pub fn reply(&self, payload: impl Into<Bytes>) -> Result<()> {
        self.reply.reply(payload)
    }
}

/// The injection point for the resolution layer.
///
/// `handle` runs on the listener's own task, once per complete message, and
/// must return promptly: spawn any slow work and answer later through the
/// context's `ReplySink`. It must not panic.
pub trait QueryHandler: Send + Sync + 'static {
    fn handle(&self, query: QueryContext);

    /// Called for every accepted TCP connection before a session is created.
    /// Returning false drops the connection.
    fn accept_connection(&self, _remote: SocketAddr) -> bool {
        true
    }

    /// Socket-level failures that were isolated and recovered from
    fn on_socket_error(
        &self,
        _transport: Transport,
        _remote: Option<SocketAddr>,
        _err: &std::io::Error,
    ) {
    }
}

impl<F> QueryHandler for F
where
    F: Fn(QueryContext) + Send + Sync + 'static,
{
    fn handle(&self, query: QueryContext) {
        self(query)
    }
}
