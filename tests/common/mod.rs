//! Common test utilities for bitnode-bees integration tests

#![allow(dead_code)] // Not every test file uses every helper

use bitnode_bees::{QueryContext, QueryHandler, Server, ServerConfig, Transport};
use bytes::Bytes;
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// One recorded handler invocation
#[derive(Debug, Clone)]
pub struct Seen {
    pub transport: Transport,
    pub remote: SocketAddr,
    pub session_id: Option<u64>,
    pub payload: Bytes,
}

/// Handler that records every query and echoes the payload back
#[derive(Default)]
pub struct EchoRecorder {
    seen: Mutex<Vec<Seen>>,
    socket_errors: Mutex<Vec<(Transport, Option<SocketAddr>)>>,
}

impl EchoRecorder {
    pub fn seen(&self) -> Vec<Seen> {
        self.seen.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }

    pub fn socket_errors(&self) -> Vec<(Transport, Option<SocketAddr>)> {
        self.socket_errors.lock().clone()
    }
}

impl QueryHandler for EchoRecorder {
    fn handle(&self, query: QueryContext) {
        self.seen.lock().push(Seen {
            transport: query.transport,
            remote: query.remote,
            session_id: query.session_id,
            payload: query.payload.clone(),
        });
        let _ = query.reply(query.payload.clone());
    }

    fn on_socket_error(&self, transport: Transport, remote: Option<SocketAddr>, _err: &std::io::Error) {
        self.socket_errors.lock().push((transport, remote));
    }
}

pub fn loopback_config() -> ServerConfig {
    ServerConfig::new(0)
        .with_bind_ip("127.0.0.1".parse().expect("loopback is valid"))
        .with_drain_timeout(Duration::from_millis(300))
}

/// Start a server on an ephemeral loopback port
pub async fn start_server(handler: Arc<dyn QueryHandler>) -> (Server, SocketAddr) {
    let server = Server::with_shared_handler(loopback_config(), handler);
    let addr = server.start().await.expect("server failed to start");
    (server, addr)
}

/// Length-prefix a payload for DNS-over-TCP
pub fn frame(payload: &[u8]) -> Vec<u8> {
    let mut out = (payload.len() as u16).to_be_bytes().to_vec();
    out.extend_from_slice(payload);
    out
}

/// Read one length-prefixed message, failing the test after a timeout
pub async fn read_frame(stream: &mut TcpStream) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(2), async {
        let mut len = [0u8; 2];
        stream.read_exact(&mut len).await.expect("read length");
        let mut body = vec![0u8; u16::from_be_bytes(len) as usize];
        stream.read_exact(&mut body).await.expect("read body");
        body
    })
    .await
    .expect("timed out waiting for framed reply")
}

pub async fn tcp_roundtrip(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.expect("connect");
    stream.write_all(&frame(payload)).await.expect("write");
    read_frame(&mut stream).await
}

/// Zero linger, so dropping the stream sends a reset instead of a FIN
#[allow(deprecated)]
pub fn reset_on_drop(stream: &TcpStream) {
    stream
        .set_linger(Some(Duration::ZERO))
        .expect("set zero linger");
}

/// Poll `check` until it holds or a second passes
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..100 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
