//! Session integration tests.
//!
//! Tests verify end-to-end behavior over a fully upgraded channel:
//! - Negotiation, handshake and multiplexer setup
//! - Bidirectional stream exchange and half-close
//! - Stream-level protocol negotiation
//! - Window updates on large transfers
//! - Many concurrent streams
//! - Ping, graceful close and TCP transport


use knit_core::{CloseReason, Error, GoAwayCode, Role, SessionConfig};
use knit_crypto::Keypair;
use knit_session::{negotiate, upgrade, Stream, UpgradeConfig};
use std::sync::Arc;
use test_helpers::{plain_pair, upgraded_pair, validate_stream_ids, with_timeout, TEST_TIMEOUT};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_to_end(stream: &mut Stream) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = stream.read(4096).await.expect("Stream read failed") {
        out.extend_from_slice(&chunk);
    }
    out
}

/// Test: upgrade, open a stream, send "hello-test", close the write side.
#[tokio::test]
async fn test_hello_over_upgraded_session() -> knit_core::Result<()> {
    let pair = upgraded_pair(UpgradeConfig::default()).await;

    assert_eq!(
        pair.initiator.remote_peer(),
        Some(pair.responder_identity.peer_id())
    );
    assert_eq!(
        pair.responder.remote_peer(),
        Some(pair.initiator_identity.peer_id())
    );

    let mut outbound = pair.initiator.open_stream()?;
    assert_eq!(outbound.id(), 1);
    outbound.write(b"hello-test").await?;
    outbound.close_write()?;

    let mut inbound = with_timeout("accept", pair.responder.accept_stream())
        .await
        .expect("Accept timed out")?;
    assert_eq!(inbound.id(), 1);
    assert_eq!(read_to_end(&mut inbound).await, b"hello-test");

    // The reverse direction is still open.
    inbound.write(b"ack").await?;
    inbound.close_write()?;
    assert_eq!(read_to_end(&mut outbound).await, b"ack");
    Ok(())
}

/// Test: streams opened by each side use their own parity.
#[tokio::test]
async fn test_stream_id_parity() -> knit_core::Result<()> {
    let (initiator, responder) = plain_pair(SessionConfig::default());

    let mut initiator_ids = Vec::new();
    let mut responder_ids = Vec::new();
    let mut keep = Vec::new();
    for _ in 0..5 {
        let a = initiator.open_stream()?;
        let b = responder.open_stream()?;
        initiator_ids.push(a.id());
        responder_ids.push(b.id());
        keep.push((a, b));
    }

    validate_stream_ids(&initiator_ids, Role::Initiator);
    validate_stream_ids(&responder_ids, Role::Responder);
    assert_eq!(initiator_ids, [1, 3, 5, 7, 9]);
    assert_eq!(responder_ids, [2, 4, 6, 8, 10]);
    Ok(())
}

/// Test: application protocol negotiated on a stream, then used on it.
#[tokio::test]
async fn test_negotiate_on_stream() -> knit_core::Result<()> {
    let pair = upgraded_pair(UpgradeConfig::default()).await;
    let responder = pair.responder;

    let server = tokio::spawn(async move {
        let mut stream = responder.accept_stream().await?;
        let protocol = negotiate::listener_select(&mut stream, &["echo/1.0"]).await?;
        assert_eq!(protocol, "echo/1.0");

        while let Some(chunk) = stream.read(1024).await? {
            stream.write(&chunk).await?;
        }
        stream.close_write()?;
        knit_core::Result::Ok(())
    });

    let mut stream = pair.initiator.open_stream()?;
    let protocol = negotiate::dialer_select(&mut stream, &["chat/2.0", "echo/1.0"]).await?;
    assert_eq!(protocol, "echo/1.0");

    stream.write_all(b"ping over echo").await?;
    stream.shutdown().await?;
    let mut echoed = Vec::new();
    stream.read_to_end(&mut echoed).await?;
    assert_eq!(echoed, b"ping over echo");

    tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .expect("Server timeout")
        .expect("Server task failed")?;
    Ok(())
}

/// Test: a transfer many times the window completes intact in both directions.
#[tokio::test]
async fn test_large_transfer_with_window_updates() -> knit_core::Result<()> {
    let config = UpgradeConfig {
        session: SessionConfig::with_initial_window(16 * 1024),
        ..UpgradeConfig::default()
    };
    let pair = upgraded_pair(config).await;
    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();

    let responder = pair.responder;
    let expected = payload.clone();
    let server = tokio::spawn(async move {
        let mut stream = responder.accept_stream().await?;
        let received = read_to_end(&mut stream).await;
        assert_eq!(received.len(), expected.len());
        assert!(received == expected, "Payload corrupted in transit");

        stream.write(&received).await?;
        stream.close_write()?;
        knit_core::Result::Ok(responder)
    });

    let mut stream = pair.initiator.open_stream()?;
    let writer = {
        let payload = payload.clone();
        async move {
            stream.write(&payload).await?;
            stream.close_write()?;
            knit_core::Result::Ok(stream)
        }
    };
    let mut stream = with_timeout("upload", writer).await.expect("Upload timed out")?;
    let echoed = with_timeout("download", read_to_end(&mut stream))
        .await
        .expect("Download timed out");
    assert!(echoed == payload, "Echo corrupted in transit");

    let _responder = tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .expect("Server timeout")
        .expect("Server task failed")?;
    Ok(())
}

/// Test: 32 concurrent streams each carry their own payload.
#[tokio::test]
async fn test_concurrent_streams() -> knit_core::Result<()> {
    let pair = upgraded_pair(UpgradeConfig::default()).await;
    let responder = Arc::new(pair.responder);
    let initiator = Arc::new(pair.initiator);
    const STREAMS: usize = 32;

    let server = {
        let responder = Arc::clone(&responder);
        tokio::spawn(async move {
            let mut tasks = Vec::new();
            for _ in 0..STREAMS {
                let mut stream = responder.accept_stream().await?;
                tasks.push(tokio::spawn(async move {
                    let data = read_to_end(&mut stream).await;
                    stream.write(&data).await?;
                    stream.close_write()?;
                    knit_core::Result::Ok(())
                }));
            }
            for task in tasks {
                task.await.expect("Echo task panicked")?;
            }
            knit_core::Result::Ok(())
        })
    };

    let mut clients = Vec::new();
    for i in 0..STREAMS {
        let mut stream = initiator.open_stream()?;
        clients.push(tokio::spawn(async move {
            let message = format!("stream {i} says hello").repeat(i + 1);
            stream.write(message.as_bytes()).await?;
            stream.close_write()?;
            let echoed = read_to_end(&mut stream).await;
            assert_eq!(echoed, message.as_bytes());
            knit_core::Result::Ok(stream.id())
        }));
    }

    let mut ids = Vec::new();
    for client in clients {
        ids.push(
            tokio::time::timeout(TEST_TIMEOUT, client)
                .await
                .expect("Client timeout")
                .expect("Client task failed")?,
        );
    }
    validate_stream_ids(&ids, Role::Initiator);

    tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .expect("Server timeout")
        .expect("Server task failed")?;
    Ok(())
}

/// Test: ping round trip is answered by the peer's reader.
#[tokio::test]
async fn test_ping_round_trip() -> knit_core::Result<()> {
    let pair = upgraded_pair(UpgradeConfig::default()).await;

    let rtt = with_timeout("ping", pair.initiator.ping())
        .await
        .expect("Ping timed out")?;
    assert!(rtt < TEST_TIMEOUT);

    let rtt = with_timeout("ping", pair.responder.ping())
        .await
        .expect("Ping timed out")?;
    assert!(rtt < TEST_TIMEOUT);
    Ok(())
}

/// Test: early data rides in the handshake payload.
#[tokio::test]
async fn test_upgrade_with_early_data() {
    test_helpers::init_tracing();
    let (a, b) = tokio::io::duplex(64 * 1024);
    let config = UpgradeConfig {
        early_data: Some(bytes::Bytes::from_static(b"resume-token")),
        ..UpgradeConfig::default()
    };

    let server = tokio::spawn(async move {
        upgrade(
            b,
            Role::Responder,
            &Keypair::generate(),
            &UpgradeConfig::default(),
            None,
        )
        .await
    });
    let client = upgrade(a, Role::Initiator, &Keypair::generate(), &config, None).await;

    assert!(client.is_ok());
    assert!(server.await.expect("Server task failed").is_ok());
}

/// Test: graceful close waits for open streams, then the peer sees the end.
#[tokio::test]
async fn test_graceful_close_drains_streams() -> knit_core::Result<()> {
    let pair = upgraded_pair(UpgradeConfig::default()).await;
    let initiator = Arc::new(pair.initiator);
    let responder = pair.responder;

    let mut stream = initiator.open_stream()?;
    stream.write(b"last words").await?;
    stream.close_write()?;

    let closer = {
        let initiator = Arc::clone(&initiator);
        tokio::spawn(async move { initiator.close(GoAwayCode::Normal).await })
    };

    // GoAway stops new streams but the open one finishes normally.
    let mut inbound = responder.accept_stream().await?;
    assert_eq!(read_to_end(&mut inbound).await, b"last words");
    assert!(!closer.is_finished());

    inbound.write(b"bye").await?;
    inbound.close_write()?;
    assert_eq!(read_to_end(&mut stream).await, b"bye");

    tokio::time::timeout(TEST_TIMEOUT, closer)
        .await
        .expect("Close timeout")
        .expect("Close task failed")?;
    assert!(matches!(
        initiator.close_reason(),
        Some(CloseReason::Local(GoAwayCode::Normal))
    ));

    // The responder sees the GoAway, then the channel closing.
    let err = with_timeout("accept after close", responder.accept_stream())
        .await
        .expect("Accept did not notice the GoAway")
        .unwrap_err();
    assert!(matches!(err, Error::GoneAway | Error::SessionClosed(_)));
    assert!(matches!(
        responder.open_stream(),
        Err(Error::GoneAway | Error::SessionClosed(_))
    ));
    Ok(())
}

/// Test: full upgrade over a real TCP connection.
#[tokio::test]
async fn test_upgrade_over_tcp() -> knit_core::Result<()> {
    test_helpers::init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let server_identity = Keypair::generate();
    let server_peer = server_identity.peer_id();

    let server = tokio::spawn(async move {
        let (tcp, _) = listener.accept().await?;
        let session = upgrade(
            tcp,
            Role::Responder,
            &server_identity,
            &UpgradeConfig::default(),
            None,
        )
        .await?;
        let mut stream = session.accept_stream().await?;
        let data = read_to_end(&mut stream).await;
        stream.write(&data).await?;
        stream.close_write()?;
        session.close(GoAwayCode::Normal).await?;
        knit_core::Result::Ok(())
    });

    let tcp = TcpStream::connect(addr).await?;
    let session = upgrade(
        tcp,
        Role::Initiator,
        &Keypair::generate(),
        &UpgradeConfig::default(),
        Some(server_peer),
    )
    .await?;
    assert_eq!(session.remote_peer(), Some(server_peer));

    let mut stream = session.open_stream()?;
    stream.write(b"over tcp").await?;
    stream.close_write()?;
    assert_eq!(read_to_end(&mut stream).await, b"over tcp");

    tokio::time::timeout(TEST_TIMEOUT, server)
        .await
        .expect("Server timeout")
        .expect("Server task failed")?;
    Ok(())
}
