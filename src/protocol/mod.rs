pub mod connection_manager;
pub mod framer;
pub mod handler;
pub mod session;
pub mod tcp;
pub mod udp;

pub use connection_manager::{ConnectionManager, ConnectionStats, SessionGuard, SessionInfo};
pub use framer::{Framer, MAX_MESSAGE_LEN};
pub use handler::{QueryContext, QueryHandler, ReplySink, Transport};
pub use session::{CloseReason, ConnectionSession, SessionState};
pub use tcp::TcpListener;
pub use udp::UdpListener;
