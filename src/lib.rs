pub mod config;
pub mod error;
pub mod graceful_shutdown;
pub mod protocol;
pub mod server;

pub use config::{AddressFamily, ServerConfig};
pub use error::{BeesError, ConfigError, Result};
pub use protocol::{QueryContext, QueryHandler, ReplySink, Transport};
pub use server::{Server, ServerState};
