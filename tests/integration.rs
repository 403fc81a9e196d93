use fmux::{Config, FrameConn, TunnelError};
use std::time::Duration;

/// Helper macro to add timeout to tests
macro_rules! test_with_timeout {
    ($test_name:ident, $timeout_secs:expr, $test_body:block) => {
        #[tokio::test]
        async fn $test_name() {
            let result = tokio::time::timeout(
                Duration::from_secs($timeout_secs),
                async move $test_body
            ).await;

            match result {
                Ok(Ok(())) => {},
                Ok(Err(e)) => panic!("Test failed: {:?}", e),
                Err(_) => panic!("Test timed out after {} seconds", $timeout_secs),
            }
        }
    };
}

fn pair() -> (FrameConn, FrameConn) {
    let (a, b) = tokio::io::duplex(256 * 1024);
    let dialer = FrameConn::dialer(a, Config::default()).unwrap();
    let acceptor = FrameConn::acceptor(b, Config::default()).unwrap();
    (dialer, acceptor)
}

test_with_timeout!(test_basic_echo, 30, {
    let (dialer, acceptor) = pair();

    let (dialed, accepted) = tokio::join!(dialer.dial_tunnel(), acceptor.accept());
    let dialed = dialed?;
    let accepted = accepted?;

    dialed.write(b"1234567890").await?;

    let mut buf = [0u8; 32];
    let n = accepted.read(&mut buf).await?;
    assert_eq!(&buf[..n], b"1234567890");

    accepted.write(b"987654321").await?;

    let n = dialed.read(&mut buf).await?;
    assert_eq!(&buf[..n], b"987654321");

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_thousand_writes_preserve_chunking, 60, {
    let (dialer, acceptor) = pair();

    let (dialed, accepted) = tokio::join!(dialer.dial_tunnel(), acceptor.accept());
    let dialed = dialed?;
    let accepted = accepted?;

    let writer = tokio::spawn(async move {
        for i in 0..1000u32 {
            let text = i.to_string();
            dialed.write(text.as_bytes()).await.unwrap();
        }
        dialed.close().await.unwrap();
    });

    // Each write was confirmed before the next went out, so every read
    // yields exactly one decimal of 1 to 3 digits, in order.
    let mut buf = [0u8; 16];
    for expected in 0..1000u32 {
        let n = accepted.read(&mut buf).await?;
        assert!((1..=3).contains(&n), "chunk of unexpected size {n}");
        let text = std::str::from_utf8(&buf[..n])?;
        assert_eq!(text.parse::<u32>()?, expected);
    }

    match accepted.read(&mut buf).await {
        Err(TunnelError::EndOfStream) => {}
        other => panic!("expected end of stream, got {other:?}"),
    }

    writer.await?;
    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_megabyte_round_trip, 60, {
    let (dialer, acceptor) = pair();

    let (dialed, accepted) = tokio::join!(dialer.dial_tunnel(), acceptor.accept());
    let dialed = dialed?;
    let accepted = accepted?;

    let payload: Vec<u8> = (0..1024 * 1024).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();

    let writer = tokio::spawn(async move {
        let n = dialed.write(&payload).await.unwrap();
        assert_eq!(n, payload.len());
        dialed.close().await.unwrap();
    });

    let mut received = Vec::with_capacity(expected.len());
    let mut buf = [0u8; 4096];
    loop {
        match accepted.read(&mut buf).await {
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(TunnelError::EndOfStream) => break,
            Err(e) => panic!("read failed: {e}"),
        }
    }

    assert_eq!(received.len(), expected.len());
    assert_eq!(received, expected);

    writer.await?;
    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_bidirectional_transfer, 30, {
    let (dialer, acceptor) = pair();

    let (dialed, accepted) = tokio::join!(dialer.dial_tunnel(), acceptor.accept());
    let dialed = dialed?;
    let accepted = accepted?;

    let client = tokio::spawn(async move {
        dialed.write(b"client -> server").await.unwrap();
        let mut buf = [0u8; 32];
        let n = dialed.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"server -> client");
    });

    let server = tokio::spawn(async move {
        let mut buf = [0u8; 32];
        let n = accepted.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"client -> server");
        accepted.write(b"server -> client").await.unwrap();
    });

    client.await?;
    server.await?;
    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_many_concurrent_streams, 60, {
    // More streams than the per-stream inbound queue is deep: the bound is
    // on chunks, not on streams.
    const NUM_STREAMS: usize = 150;

    let (dialer, acceptor) = pair();

    let server = tokio::spawn({
        let acceptor = acceptor.clone();
        async move {
            let mut tasks = Vec::new();
            for _ in 0..NUM_STREAMS {
                let stream = acceptor.accept().await.unwrap();
                tasks.push(tokio::spawn(async move {
                    let mut buf = [0u8; 64];
                    let n = stream.read(&mut buf).await.unwrap();
                    let echoed = [b"echo: ".as_slice(), &buf[..n]].concat();
                    stream.write(&echoed).await.unwrap();
                    stream.close().await.unwrap();
                }));
            }
            for task in tasks {
                task.await.unwrap();
            }
        }
    });

    let mut clients = Vec::new();
    for i in 0..NUM_STREAMS {
        let dialer = dialer.clone();
        clients.push(tokio::spawn(async move {
            let stream = dialer.dial_tunnel().await.unwrap();
            let msg = format!("stream {i}");
            stream.write(msg.as_bytes()).await.unwrap();

            let expected = format!("echo: {msg}");
            let mut received = Vec::new();
            let mut buf = [0u8; 64];
            while received.len() < expected.len() {
                let n = stream.read(&mut buf).await.unwrap();
                received.extend_from_slice(&buf[..n]);
            }
            assert_eq!(received, expected.as_bytes());
        }));
    }

    for client in clients {
        client.await?;
    }
    server.await?;
    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_stream_close_is_idempotent, 30, {
    let (dialer, acceptor) = pair();

    let (dialed, accepted) = tokio::join!(dialer.dial_tunnel(), acceptor.accept());
    let dialed = dialed?;
    let accepted = accepted?;

    dialed.close().await?;
    dialed.close().await?;

    let mut buf = [0u8; 8];
    match accepted.read(&mut buf).await {
        Err(TunnelError::EndOfStream) => {}
        other => panic!("expected end of stream, got {other:?}"),
    }

    // Writing on the closed stream fails locally.
    assert!(dialed.write(b"late").await.is_err());

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_frame_conn_termination_unblocks_streams, 30, {
    let (dialer, acceptor) = pair();

    let (dialed, accepted) = tokio::join!(dialer.dial_tunnel(), acceptor.accept());
    let dialed = dialed?;
    let _accepted = accepted?;

    let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        dialed.read(&mut buf).await
    });

    // Abrupt teardown of the whole tunnel must release the pending read.
    dialer.reset().await;

    match reader.await? {
        Err(TunnelError::EndOfStream) => {}
        other => panic!("expected end of stream, got {other:?}"),
    }
    assert!(dialer.is_closed());

    Ok::<(), Box<dyn std::error::Error>>(())
});

test_with_timeout!(test_graceful_close_handshake, 30, {
    let (dialer, acceptor) = pair();

    dialer.close().await?;
    assert!(dialer.is_closed());

    // The peer received TunnelClose, confirmed it and terminated.
    while !acceptor.is_closed() {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // Terminated is sticky on both sides.
    assert!(matches!(
        dialer.dial_tunnel().await,
        Err(TunnelError::EndOfStream)
    ));
    assert!(matches!(
        acceptor.accept().await,
        Err(TunnelError::EndOfStream)
    ));

    Ok::<(), Box<dyn std::error::Error>>(())
});
