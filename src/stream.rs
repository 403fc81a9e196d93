use crate::{
    bridge,
    conn::ConnInner,
    error::{Result, TunnelError},
    frame::Frame,
};
use bytes::{Bytes, BytesMut};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex as StdMutex,
};
use tokio::sync::{oneshot, watch, Notify};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Outcome of offering an inbound chunk to a stream's queue.
pub(crate) enum Enqueue {
    /// Chunk stored; `remaining` is the queue capacity left afterwards.
    Stored { remaining: usize },
    /// Queue already full: the peer ignored a closed write gate.
    Full,
    /// Stream already torn down; the chunk is discarded.
    Closed,
}

#[derive(Debug, Default)]
struct ConnectState {
    /// Set once a Connect is in flight (either direction). A second local
    /// `connect` on the same stream is refused.
    armed: bool,
    /// Target address delivered by the peer's Connect frame.
    addr: Option<String>,
}

/// State shared between the user-facing `Stream` handle, the `FrameConn`
/// table, and the dispatcher.
#[derive(Debug)]
pub(crate) struct StreamShared {
    id: u64,
    /// Dropped on teardown so pending reads drain and then see end-of-stream.
    inbound_tx: StdMutex<Option<flume::Sender<Bytes>>>,
    inbound_rx: flume::Receiver<Bytes>,
    /// Partially consumed chunk carried over between reads.
    spill: StdMutex<BytesMut>,
    /// Write gate: `true` admits Data frames, `false` blocks them until the
    /// peer grants capacity again.
    writable: watch::Sender<bool>,
    /// Renewed one-shot completed by each DataConfirm; serialises the
    /// data-confirmed pipeline without a lock the dispatcher could orphan.
    write_done: StdMutex<Option<oneshot::Sender<()>>>,
    pub(crate) dial_accepted: Notify,
    pub(crate) connect_signal: Notify,
    connect: StdMutex<ConnectState>,
    closed: AtomicBool,
    err: StdMutex<Option<TunnelError>>,
    pub(crate) token: CancellationToken,
}

impl StreamShared {
    pub(crate) fn new(id: u64, queue_depth: usize, token: CancellationToken) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = flume::bounded(queue_depth);
        let (writable, _) = watch::channel(true);
        Arc::new(Self {
            id,
            inbound_tx: StdMutex::new(Some(inbound_tx)),
            inbound_rx,
            spill: StdMutex::new(BytesMut::new()),
            writable,
            write_done: StdMutex::new(None),
            dial_accepted: Notify::new(),
            connect_signal: Notify::new(),
            connect: StdMutex::new(ConnectState::default()),
            closed: AtomicBool::new(false),
            err: StdMutex::new(None),
            token,
        })
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn error(&self) -> Option<TunnelError> {
        self.err.lock().unwrap().clone()
    }

    /// The error a user operation on a dead stream observes.
    pub(crate) fn terminal_error(&self) -> TunnelError {
        self.error().unwrap_or(TunnelError::EndOfStream)
    }

    /// Offer an inbound chunk without blocking the caller.
    pub(crate) fn enqueue(&self, chunk: Bytes) -> Enqueue {
        let guard = self.inbound_tx.lock().unwrap();
        let Some(tx) = guard.as_ref() else {
            return Enqueue::Closed;
        };
        match tx.try_send(chunk) {
            Ok(()) => {
                let remaining = tx.capacity().unwrap_or(0).saturating_sub(tx.len());
                Enqueue::Stored { remaining }
            }
            Err(flume::TrySendError::Full(_)) => Enqueue::Full,
            Err(flume::TrySendError::Disconnected(_)) => Enqueue::Closed,
        }
    }

    pub(crate) fn set_writable(&self, writable: bool) {
        self.writable.send_replace(writable);
    }

    fn arm_write_done(&self) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        *self.write_done.lock().unwrap() = Some(tx);
        rx
    }

    fn disarm_write_done(&self) {
        self.write_done.lock().unwrap().take();
    }

    /// Complete the pending write's confirm slot, if any.
    pub(crate) fn complete_write_done(&self) {
        if let Some(tx) = self.write_done.lock().unwrap().take() {
            let _ = tx.send(());
        }
    }

    fn arm_connect(&self) -> Result<()> {
        let mut state = self.connect.lock().unwrap();
        if state.armed {
            return Err(TunnelError::AlreadyConnected);
        }
        state.armed = true;
        Ok(())
    }

    fn arm_proxy(&self) {
        self.connect.lock().unwrap().armed = true;
    }

    pub(crate) fn connect_armed(&self) -> bool {
        self.connect.lock().unwrap().armed
    }

    fn connect_addr(&self) -> Option<String> {
        self.connect.lock().unwrap().addr.clone()
    }

    /// Record the target address from a peer Connect frame and wake the
    /// proxy waiter.
    pub(crate) fn set_remote_connect(&self, addr: String) {
        {
            let mut state = self.connect.lock().unwrap();
            state.armed = true;
            state.addr = Some(addr);
        }
        self.connect_signal.notify_one();
    }

    pub(crate) fn set_error_if_none(&self, err: TunnelError) {
        let mut slot = self.err.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Transition to closed. The first caller wins; it drops the inbound
    /// sender (readers drain, then observe end-of-stream) and cancels the
    /// stream token so every pending operation unblocks.
    pub(crate) fn begin_close(&self, err: Option<TunnelError>) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        if let Some(e) = err {
            self.set_error_if_none(e);
        }
        self.inbound_tx.lock().unwrap().take();
        self.token.cancel();
        true
    }

    /// Peer sent Close: graceful remote teardown.
    pub(crate) fn close_remote(&self) {
        self.begin_close(None);
    }

    /// Peer sent Reset, or the local side discovered an overrun.
    pub(crate) fn reset_remote(&self) {
        self.begin_close(Some(TunnelError::ConnectionReset));
    }

    /// Local teardown caused by the parent `FrameConn` terminating.
    pub(crate) fn abort(&self) {
        self.begin_close(None);
    }
}

/// A logical bidirectional byte pipe multiplexed inside a tunnel.
///
/// Writes are flow-controlled by the peer's credit frames and confirmed
/// end-to-end; reads pull buffered chunks and grant the peer new window as
/// the queue drains. Dropping the handle closes the stream.
#[derive(Debug)]
pub struct Stream {
    shared: Arc<StreamShared>,
    conn: Arc<ConnInner>,
    /// Serialises writes (and Connect) on this stream.
    write_serial: tokio::sync::Mutex<()>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>, conn: Arc<ConnInner>) -> Self {
        Self {
            shared,
            conn,
            write_serial: tokio::sync::Mutex::new(()),
        }
    }

    /// The stream's 64-bit ID.
    pub fn id(&self) -> u64 {
        self.shared.id()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    /// Write `buf` as one Data frame and wait for the peer's DataConfirm.
    ///
    /// Blocks while the write gate is closed (the peer's inbound queue is
    /// full). A zero-length `buf` still emits an empty Data frame and
    /// returns `Ok(0)`.
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let _serial = self.write_serial.lock().await;
        self.wait_writable().await;
        if self.shared.is_closed() || self.shared.token.is_cancelled() {
            return Err(self.shared.terminal_error());
        }

        let confirmed = self.shared.arm_write_done();
        let sent = match self
            .conn
            .send_frame_tracked(Frame::data(self.id(), Bytes::copy_from_slice(buf)))
            .await
        {
            Ok(rx) => rx,
            Err(e) => {
                self.shared.disarm_write_done();
                return Err(e);
            }
        };

        let n = match sent.await {
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(self.shared.terminal_error()),
        };

        // The peer acknowledges once the chunk is queued on its side; stream
        // teardown releases the wait instead.
        tokio::select! {
            _ = confirmed => {}
            _ = self.shared.token.cancelled() => {}
        }
        Ok(n)
    }

    async fn wait_writable(&self) {
        let mut gate = self.shared.writable.subscribe();
        tokio::select! {
            biased;
            _ = gate.wait_for(|writable| *writable) => {}
            _ = self.shared.token.cancelled() => {}
        }
    }

    /// Read into `buf`, pulling from the spill buffer first and then from the
    /// inbound queue. Returns `Ok(0)` only for an empty `buf`; end-of-stream
    /// surfaces as an error.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            {
                let mut spill = self.shared.spill.lock().unwrap();
                if !spill.is_empty() {
                    let n = spill.len().min(buf.len());
                    buf[..n].copy_from_slice(&spill.split_to(n));
                    return Ok(n);
                }
            }
            let chunk = self.next_chunk().await?;
            if chunk.is_empty() {
                continue;
            }
            self.shared.spill.lock().unwrap().extend_from_slice(&chunk);
        }
    }

    /// Await the next inbound chunk. Pulling from a previously-full queue
    /// grants the peer new window.
    async fn next_chunk(&self) -> Result<Bytes> {
        let rx = &self.shared.inbound_rx;
        let was_full = rx.is_full();
        let chunk = tokio::select! {
            biased;
            res = rx.recv_async() => res.map_err(|_| self.shared.terminal_error())?,
            _ = self.shared.token.cancelled() => return Err(self.shared.terminal_error()),
        };
        if was_full {
            let window = rx.capacity().unwrap_or(0).saturating_sub(rx.len());
            let _ = self
                .conn
                .send_frame(Frame::DataWindow {
                    id: self.id(),
                    window: window as u64,
                })
                .await;
        }
        Ok(chunk)
    }

    /// Graceful close: tell the peer, drain local readers with end-of-stream,
    /// drop out of the stream table. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.shared.begin_close(None) {
            let _ = self.conn.send_frame(Frame::Close { id: self.id() }).await;
            self.conn.remove_stream(self.id());
        }
        Ok(())
    }

    /// Abrupt close: as `close` but the peer and any local reader observe a
    /// connection reset. Idempotent.
    pub async fn reset(&self) {
        if self
            .shared
            .begin_close(Some(TunnelError::ConnectionReset))
        {
            let _ = self.conn.send_frame(Frame::Reset { id: self.id() }).await;
            self.conn.remove_stream(self.id());
        }
    }

    /// Ask the peer to open a TCP connection to `addr` and bridge it to this
    /// stream. Returns once the peer confirms; a non-empty error payload
    /// surfaces as `ConnectFailed` and the stream is reset.
    pub async fn connect(&self, addr: &str) -> Result<()> {
        let _serial = self.write_serial.lock().await;
        self.shared.arm_connect()?;
        self.conn
            .send_frame(Frame::connect(self.id(), addr))
            .await?;

        let confirmed = tokio::select! {
            biased;
            _ = self.shared.connect_signal.notified() => true,
            _ = self.shared.token.cancelled() => false,
        };
        if let Some(err) = self.shared.error() {
            return Err(err);
        }
        if !confirmed {
            return Err(self.shared.terminal_error());
        }
        Ok(())
    }

    /// Fulfil the peer's Connect: wait for the target address, dial it, send
    /// the confirm (or the error text followed by a reset), then bridge bytes
    /// both ways until either side finishes.
    pub async fn proxy(&self) -> Result<()> {
        self.shared.arm_proxy();
        let signalled = tokio::select! {
            biased;
            _ = self.shared.connect_signal.notified() => true,
            _ = self.shared.token.cancelled() => false,
        };
        if !signalled {
            return Err(self.shared.terminal_error());
        }
        let addr = self.shared.connect_addr().ok_or_else(|| {
            TunnelError::ProtocolError("connect signal without target address".to_string())
        })?;

        let target =
            match bridge::connect_target(&addr, self.conn.config().connect_timeout).await {
                Ok(target) => target,
                Err(e) => {
                    let text = e.to_string();
                    let _ = self
                        .conn
                        .send_frame(Frame::connect_err(self.id(), &text))
                        .await;
                    self.reset().await;
                    return Err(TunnelError::ConnectFailed(text));
                }
            };

        self.conn.send_frame(Frame::connect_ok(self.id())).await?;
        debug!(stream = self.id(), target = %addr, "bridging");
        bridge::join(self, target, &addr).await;
        Ok(())
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        // Best effort: let the peer know if the user forgot to close.
        if self.shared.begin_close(None) {
            let _ = self.conn.try_send_frame(Frame::Close { id: self.shared.id() });
            self.conn.remove_stream(self.shared.id());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shared(depth: usize) -> Arc<StreamShared> {
        StreamShared::new(128, depth, CancellationToken::new())
    }

    #[test]
    fn test_enqueue_reports_remaining() {
        let s = shared(4);
        match s.enqueue(Bytes::from("a")) {
            Enqueue::Stored { remaining } => assert_eq!(remaining, 3),
            _ => panic!("expected Stored"),
        }
        match s.enqueue(Bytes::from("b")) {
            Enqueue::Stored { remaining } => assert_eq!(remaining, 2),
            _ => panic!("expected Stored"),
        }
    }

    #[test]
    fn test_enqueue_full_queue() {
        let s = shared(2);
        assert!(matches!(s.enqueue(Bytes::from("a")), Enqueue::Stored { .. }));
        assert!(matches!(s.enqueue(Bytes::from("b")), Enqueue::Stored { remaining: 0 }));
        assert!(matches!(s.enqueue(Bytes::from("c")), Enqueue::Full));
    }

    #[test]
    fn test_enqueue_after_close() {
        let s = shared(2);
        assert!(s.begin_close(None));
        assert!(matches!(s.enqueue(Bytes::from("a")), Enqueue::Closed));
    }

    #[test]
    fn test_begin_close_first_caller_wins() {
        let s = shared(2);
        assert!(s.begin_close(Some(TunnelError::ConnectionReset)));
        assert!(!s.begin_close(None));
        assert!(s.is_closed());
        assert!(s.token.is_cancelled());
        assert!(matches!(s.error(), Some(TunnelError::ConnectionReset)));
    }

    #[test]
    fn test_terminal_error_defaults_to_end_of_stream() {
        let s = shared(2);
        s.begin_close(None);
        assert!(matches!(s.terminal_error(), TunnelError::EndOfStream));
    }

    #[test]
    fn test_connect_arming() {
        let s = shared(2);
        assert!(!s.connect_armed());
        s.arm_connect().unwrap();
        assert!(s.connect_armed());
        assert!(matches!(
            s.arm_connect(),
            Err(TunnelError::AlreadyConnected)
        ));
        // Arming for proxy is idempotent.
        s.arm_proxy();
        assert!(s.connect_armed());
    }

    #[test]
    fn test_remote_connect_records_address() {
        let s = shared(2);
        s.set_remote_connect("example.com:80".to_string());
        assert!(s.connect_armed());
        assert_eq!(s.connect_addr().as_deref(), Some("example.com:80"));
    }

    #[tokio::test]
    async fn test_write_done_chain() {
        let s = shared(2);
        let rx = s.arm_write_done();
        s.complete_write_done();
        rx.await.unwrap();

        // Completing again with no armed slot is a no-op.
        s.complete_write_done();

        // A re-armed slot fires independently.
        let rx = s.arm_write_done();
        s.complete_write_done();
        rx.await.unwrap();
    }

    #[tokio::test]
    async fn test_writable_gate_toggles() {
        let s = shared(2);
        let mut gate = s.writable.subscribe();
        assert!(*gate.borrow());

        s.set_writable(false);
        assert!(!*gate.borrow_and_update());

        s.set_writable(true);
        gate.wait_for(|w| *w).await.unwrap();
    }
}
