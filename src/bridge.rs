use crate::stream::Stream;
use std::io;
use std::time::Duration;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Copy buffer for each bridge direction.
const COPY_BUF: usize = 32 * 1024;

/// Dial the proxy target with a deadline.
pub(crate) async fn connect_target(addr: &str, deadline: Duration) -> io::Result<TcpStream> {
    match tokio::time::timeout(deadline, TcpStream::connect(addr)).await {
        Ok(res) => res,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("dial {addr} timed out"),
        )),
    }
}

/// Bridge a tunnel stream and a TCP target until both directions finish.
///
/// Two copy loops run concurrently. The stream-to-target direction shuts the
/// target's write side down when it ends and stops the opposite loop (the
/// target may ignore our FIN and hold its side open); the target-to-stream
/// direction closes the tunnel stream when it ends, which in turn drains the
/// first loop.
pub(crate) async fn join(stream: &Stream, target: TcpStream, addr: &str) {
    let (mut target_rd, mut target_wr) = target.into_split();
    let stop = CancellationToken::new();

    let outbound = async {
        let mut buf = vec![0u8; COPY_BUF];
        let mut first = true;
        loop {
            let n = match stream.read(&mut buf).await {
                Ok(n) => n,
                Err(_) => break,
            };
            if first {
                first = false;
                log_request_line(&buf[..n], addr);
            }
            if target_wr.write_all(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = target_wr.shutdown().await;
        stop.cancel();
    };

    let inbound = async {
        let mut buf = vec![0u8; COPY_BUF];
        loop {
            let n = tokio::select! {
                _ = stop.cancelled() => break,
                res = target_rd.read(&mut buf) => match res {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                },
            };
            if stream.write(&buf[..n]).await.is_err() {
                break;
            }
        }
        let _ = stream.close().await;
    };

    tokio::join!(outbound, inbound);
    debug!(stream = stream.id(), target = %addr, "bridge finished");
}

/// Trace the first request line when the forwarded bytes look like HTTP.
fn log_request_line(chunk: &[u8], addr: &str) {
    let Some(line) = chunk.split(|&b| b == b'\n').next() else {
        return;
    };
    if line.windows(4).any(|w| w == b"HTTP") {
        debug!(
            target = %addr,
            line = %String::from_utf8_lossy(line).trim_end(),
            "forwarding request"
        );
    }
}
