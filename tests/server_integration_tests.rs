// Server integration tests
//
// These start real listeners on ephemeral loopback ports.

mod common;

use bitnode_bees::{BeesError, QueryContext, ReplySink, Server, ServerState, Transport};
use common::{EchoRecorder, eventually, frame, loopback_config, read_frame, start_server};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

#[tokio::test]
async fn test_udp_and_tcp_share_port() {
    let recorder = Arc::new(EchoRecorder::default());
    let (server, addr) = start_server(recorder.clone()).await;

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    udp.send_to(b"over-udp", addr).await.unwrap();
    let mut buf = [0u8; 64];
    let (len, _) = timeout(Duration::from_secs(2), udp.recv_from(&mut buf))
        .await
        .expect("no UDP reply")
        .unwrap();
    assert_eq!(&buf[..len], b"over-udp");

    assert_eq!(common::tcp_roundtrip(addr, b"over-tcp").await, b"over-tcp");

    let seen = recorder.seen();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].transport, Transport::Udp);
    assert_eq!(seen[0].session_id, None);
    assert_eq!(seen[1].transport, Transport::Tcp);
    assert!(seen[1].session_id.is_some());

    server.stop().await;
}

#[tokio::test]
async fn test_tcp_two_writes_in_order() {
    let recorder = Arc::new(EchoRecorder::default());
    let (server, addr) = start_server(recorder.clone()).await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&[0x00, 0x03, b'A', b'B', b'C']).await.unwrap();
    stream.write_all(&[0x00, 0x02, b'X', b'Y']).await.unwrap();

    assert_eq!(read_frame(&mut stream).await, b"ABC");
    assert_eq!(read_frame(&mut stream).await, b"XY");

    let payloads: Vec<_> = recorder.seen().into_iter().map(|s| s.payload).collect();
    assert_eq!(payloads, vec![&b"ABC"[..], &b"XY"[..]]);

    server.stop().await;
}

#[tokio::test]
async fn test_interleaved_connections_do_not_mix() {
    let recorder = Arc::new(EchoRecorder::default());
    let (server, addr) = start_server(recorder.clone()).await;

    let mut a = TcpStream::connect(addr).await.unwrap();
    let mut b = TcpStream::connect(addr).await.unwrap();

    let a_wire: Vec<u8> = ["a-one", "a-two", "a-three"]
        .iter()
        .flat_map(|m| frame(m.as_bytes()))
        .collect();
    let b_wire: Vec<u8> = ["b-one", "b-two", "b-three"]
        .iter()
        .flat_map(|m| frame(m.as_bytes()))
        .collect();

    // Alternate odd-sized chunks so frames straddle writes on both sockets
    for (a_chunk, b_chunk) in a_wire.chunks(3).zip(b_wire.chunks(4)) {
        a.write_all(a_chunk).await.unwrap();
        b.write_all(b_chunk).await.unwrap();
        tokio::task::yield_now().await;
    }
    for chunk in a_wire.chunks(3).skip(b_wire.chunks(4).count()) {
        a.write_all(chunk).await.unwrap();
    }
    for chunk in b_wire.chunks(4).skip(a_wire.chunks(3).count()) {
        b.write_all(chunk).await.unwrap();
    }

    for expected in ["a-one", "a-two", "a-three"] {
        assert_eq!(read_frame(&mut a).await, expected.as_bytes());
    }
    for expected in ["b-one", "b-two", "b-three"] {
        assert_eq!(read_frame(&mut b).await, expected.as_bytes());
    }

    // Every message handled on a session came from that session's socket
    let seen = recorder.seen();
    assert_eq!(seen.len(), 6);
    for entry in &seen {
        let same_session: Vec<_> = seen
            .iter()
            .filter(|other| other.session_id == entry.session_id)
            .collect();
        let prefix = &entry.payload[..2];
        assert!(same_session.iter().all(|other| &other.payload[..2] == prefix));
        assert_eq!(same_session.len(), 3);
    }

    server.stop().await;
}

#[tokio::test]
async fn test_no_handler_calls_after_stop() {
    let recorder = Arc::new(EchoRecorder::default());
    let (server, addr) = start_server(recorder.clone()).await;

    assert_eq!(common::tcp_roundtrip(addr, b"before").await, b"before");
    let mut idle_client = TcpStream::connect(addr).await.unwrap();
    assert!(eventually(|| recorder.count() == 1).await);

    server.stop().await;
    assert_eq!(server.state().await, ServerState::Stopped);
    let count = recorder.count();

    // Existing connection is closed, new ones are refused, datagrams ignored
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(1), idle_client.read(&mut buf))
        .await
        .expect("session still open after stop")
        .unwrap_or(0);
    assert_eq!(n, 0);
    assert!(TcpStream::connect(addr).await.is_err());

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let _ = udp.send_to(b"after", addr).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.count(), count);

    // Both sockets were released
    let _udp = UdpSocket::bind(addr).await.expect("UDP port still held");
    let _tcp = TcpListener::bind(addr).await.expect("TCP port still held");
}

#[tokio::test]
async fn test_tcp_bind_failure_releases_udp() {
    let squatter = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = squatter.local_addr().unwrap().port();

    let mut config = loopback_config();
    config.port = port;
    let server = Server::with_shared_handler(config, Arc::new(EchoRecorder::default()));

    match server.start().await {
        Err(BeesError::Bind { transport, .. }) => assert_eq!(transport, Transport::Tcp),
        other => panic!("expected TCP bind error, got {:?}", other),
    }
    assert_eq!(server.state().await, ServerState::Created);

    UdpSocket::bind(("127.0.0.1", port))
        .await
        .expect("UDP socket left bound after failed start");

    server.stop().await;
}

#[tokio::test]
async fn test_udp_bind_failure_reported() {
    let squatter = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let port = squatter.local_addr().unwrap().port();

    let mut config = loopback_config();
    config.port = port;
    let server = Server::new(config, |_query: QueryContext| {});

    let err = server.start().await.unwrap_err();
    assert!(err.is_bind_error());
    assert!(server.local_addr().await.is_none());
}

#[tokio::test]
async fn test_reply_after_disconnect_is_dropped() {
    let sinks: Arc<Mutex<Vec<ReplySink>>> = Arc::new(Mutex::new(Vec::new()));
    let stash = sinks.clone();
    let (server, addr) = start_server(Arc::new(move |query: QueryContext| {
        stash.lock().push(query.reply.clone());
    }))
    .await;

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(&frame(b"question")).await.unwrap();
    assert!(eventually(|| !sinks.lock().is_empty()).await);
    drop(stream);

    let sink = sinks.lock()[0].clone();
    assert!(eventually(|| sink.is_closed()).await);
    assert!(matches!(
        sink.reply(&b"too late"[..]),
        Err(BeesError::ReplyDropped)
    ));

    server.stop().await;
}

#[tokio::test]
async fn test_faulty_client_does_not_affect_others() {
    let recorder = Arc::new(EchoRecorder::default());
    let (server, addr) = start_server(recorder.clone()).await;

    // Half a frame, then the client vanishes
    let mut bad = TcpStream::connect(addr).await.unwrap();
    bad.write_all(&[0x00, 0x10, 0x01]).await.unwrap();
    drop(bad);

    // Garbage datagrams are still just messages to the core
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    udp.send_to(&[], addr).await.unwrap();

    assert_eq!(common::tcp_roundtrip(addr, b"still-up").await, b"still-up");

    server.stop().await;
}

#[tokio::test]
async fn test_connection_reset_is_isolated() {
    let recorder = Arc::new(EchoRecorder::default());
    let (server, addr) = start_server(recorder.clone()).await;

    let mut doomed = TcpStream::connect(addr).await.unwrap();
    let doomed_addr = doomed.local_addr().unwrap();
    doomed.write_all(&frame(b"first")).await.unwrap();
    assert_eq!(read_frame(&mut doomed).await, b"first");
    assert_eq!(server.active_sessions().await, 1);

    common::reset_on_drop(&doomed);
    drop(doomed);

    assert!(eventually(|| !recorder.socket_errors().is_empty()).await);
    assert_eq!(
        recorder.socket_errors(),
        vec![(Transport::Tcp, Some(doomed_addr))]
    );

    let mut unregistered = false;
    for _ in 0..100 {
        if server.active_sessions().await == 0 {
            unregistered = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(unregistered, "reset session still registered");

    assert_eq!(common::tcp_roundtrip(addr, b"ok").await, b"ok");

    server.stop().await;
}

#[tokio::test]
async fn test_drain_timeout_forces_stuck_session_closed() {
    // Floods a client that never reads so the session blocks on write
    let flood = |query: QueryContext| {
        let chunk = vec![0xEE; 60_000];
        for _ in 0..500 {
            if query.reply(chunk.clone()).is_err() {
                break;
            }
        }
    };

    let server = Server::new(loopback_config(), flood);
    let addr = server.start().await.unwrap();

    let mut stuck = TcpStream::connect(addr).await.unwrap();
    stuck.write_all(&frame(b"go")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    timeout(Duration::from_secs(5), server.stop())
        .await
        .expect("stop() did not finish despite drain timeout");
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(server.active_sessions().await, 0);
}

#[tokio::test]
async fn test_async_handler_replies_later() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let handler = move |query: QueryContext| {
        counter.fetch_add(1, Ordering::SeqCst);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(25)).await;
            let mut answer = b"late:".to_vec();
            answer.extend_from_slice(&query.payload);
            let _ = query.reply(answer);
        });
    };

    let server = Server::new(loopback_config(), handler);
    let addr = server.start().await.unwrap();

    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    udp.send_to(b"u", addr).await.unwrap();
    let mut buf = [0u8; 16];
    let (len, _) = timeout(Duration::from_secs(2), udp.recv_from(&mut buf))
        .await
        .expect("no delayed UDP reply")
        .unwrap();
    assert_eq!(&buf[..len], b"late:u");

    assert_eq!(common::tcp_roundtrip(addr, b"t").await, b"late:t");
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    server.stop().await;
}
