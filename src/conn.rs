use crate::{
    codec,
    config::Config,
    error::{Result, TunnelError},
    frame::Frame,
    info::Info,
    opcode::{Signal, CONTROL_ID, SIGNAL_IS_MEMBER, SIGNAL_NOT_MEMBER, SIGNAL_RELOAD, USER_ID_START},
    stream::{Enqueue, Stream, StreamShared},
};
use bytes::BytesMut;
use dashmap::DashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc, Mutex as StdMutex,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf},
    sync::{oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Process-wide counter used only to name connections in logs.
static CONN_SEQ: AtomicU64 = AtomicU64::new(0);

/// Depth of the writer's request queue.
const WRITE_QUEUE: usize = 64;

/// A frame queued for the writer task, optionally carrying a completion slot
/// that reports the flushed payload size (or the write error).
#[derive(Debug)]
struct WriteRequest {
    frame: Frame,
    done: Option<oneshot::Sender<Result<usize>>>,
}

impl WriteRequest {
    fn plain(frame: Frame) -> Self {
        Self { frame, done: None }
    }
}

/// One multiplexed tunnel over one byte transport.
///
/// Construction spawns the connection's reader, writer and supervisor tasks;
/// the handle is cheap to clone and share. Termination is sticky: once the
/// tunnel has failed or been closed, every operation reports the terminal
/// error (end-of-stream when there is no other recorded cause).
#[derive(Debug, Clone)]
pub struct FrameConn {
    inner: Arc<ConnInner>,
}

#[derive(Debug)]
pub(crate) struct ConnInner {
    name: String,
    config: Config,
    next_id: AtomicU64,
    streams: DashMap<u64, Arc<StreamShared>>,
    write_tx: flume::Sender<WriteRequest>,
    accept_tx: flume::Sender<u64>,
    accept_rx: flume::Receiver<u64>,
    peer_info: watch::Sender<Option<Info>>,
    local_info: StdMutex<Option<Info>>,
    last_ping: StdMutex<Instant>,
    last_pong: StdMutex<Instant>,
    err: StdMutex<Option<TunnelError>>,
    token: CancellationToken,
    close_waiter: StdMutex<Option<oneshot::Sender<()>>>,
    closing: AtomicBool,
    peer_addr: Option<SocketAddr>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
}

impl FrameConn {
    /// Build the dialer side over an established transport. The dialer
    /// allocates even user stream IDs starting at 128.
    pub fn dialer<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(transport, true, None, config)
    }

    /// Build the acceptor side; odd user stream IDs starting at 129.
    pub fn acceptor<T>(transport: T, config: Config) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::spawn(transport, false, None, config)
    }

    pub(crate) fn spawn<T>(
        transport: T,
        dialer: bool,
        peer_addr: Option<SocketAddr>,
        config: Config,
    ) -> Result<Self>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let seq = CONN_SEQ.fetch_add(1, Ordering::Relaxed) + 1;
        let name = format!("{}:{}", if dialer { "client" } else { "server" }, seq);
        let first_id = if dialer { USER_ID_START } else { USER_ID_START + 1 };

        let (read_half, write_half) = tokio::io::split(transport);
        let (write_tx, write_rx) = flume::bounded(WRITE_QUEUE);
        let (accept_tx, accept_rx) = flume::bounded(config.accept_backlog);
        let (peer_info, _) = watch::channel(None);
        let now = Instant::now();

        let inner = Arc::new(ConnInner {
            name,
            config,
            next_id: AtomicU64::new(first_id),
            streams: DashMap::new(),
            write_tx,
            accept_tx,
            accept_rx,
            peer_info,
            local_info: StdMutex::new(None),
            last_ping: StdMutex::new(now),
            last_pong: StdMutex::new(now),
            err: StdMutex::new(None),
            token: CancellationToken::new(),
            close_waiter: StdMutex::new(None),
            closing: AtomicBool::new(false),
            peer_addr,
            tasks: StdMutex::new(Vec::new()),
        });

        debug!(conn = %inner.name, "starting reader, writer and supervisor");
        let reader = tokio::spawn(reader_loop(BufReader::new(read_half), Arc::clone(&inner)));
        let writer = tokio::spawn(writer_loop(
            BufWriter::new(write_half),
            write_rx,
            Arc::clone(&inner),
        ));
        let supervisor = tokio::spawn(supervisor_loop(Arc::clone(&inner)));
        inner
            .tasks
            .lock()
            .unwrap()
            .extend([reader, writer, supervisor]);

        Ok(Self { inner })
    }

    /// Open a new stream: allocate the next local ID, announce it with a Dial
    /// frame and wait for the peer's Accept.
    pub async fn dial_tunnel(&self) -> Result<Stream> {
        if self.inner.is_terminated() {
            return Err(self.inner.terminal_error());
        }
        let id = self.inner.next_id.fetch_add(2, Ordering::Relaxed);
        let shared = self.inner.insert_stream(id);

        if let Err(e) = self.inner.send_frame(Frame::Dial { id }).await {
            self.inner.streams.remove(&id);
            return Err(e);
        }
        tokio::select! {
            biased;
            _ = shared.dial_accepted.notified() => {
                Ok(Stream::new(shared, Arc::clone(&self.inner)))
            }
            _ = self.inner.token.cancelled() => {
                self.inner.streams.remove(&id);
                Err(self.inner.terminal_error())
            }
        }
    }

    /// Open a stream and ask the peer to bridge it to `addr`.
    pub async fn dial(&self, addr: &str) -> Result<Stream> {
        let stream = self.dial_tunnel().await?;
        if let Err(e) = stream.connect(addr).await {
            let _ = stream.close().await;
            return Err(e);
        }
        Ok(stream)
    }

    /// Take the next peer-opened stream, acknowledging it with an Accept
    /// frame.
    ///
    /// Sideband values on the accept queue are handled here: `NotMember`
    /// tears the tunnel down and surfaces as an error, `Reload` closes the
    /// tunnel gracefully and asks the caller to reconnect, and `IsMember`
    /// is informational.
    pub async fn accept(&self) -> Result<Stream> {
        loop {
            let id = tokio::select! {
                biased;
                res = self.inner.accept_rx.recv_async() => {
                    res.map_err(|_| self.inner.terminal_error())?
                }
                _ = self.inner.token.cancelled() => {
                    return Err(self.inner.terminal_error());
                }
            };
            match id {
                SIGNAL_NOT_MEMBER => {
                    self.inner.occur_error(TunnelError::NotMember);
                    self.inner.clean_streams();
                    return Err(TunnelError::NotMember);
                }
                SIGNAL_RELOAD => {
                    let _ = self.close().await;
                    return Err(TunnelError::Reload);
                }
                SIGNAL_IS_MEMBER => {
                    info!(conn = %self.inner.name, "peer confirmed membership");
                    continue;
                }
                id => {
                    let shared = self.inner.insert_stream(id);
                    if let Err(e) = self.inner.send_frame(Frame::Accept { id }).await {
                        self.inner.streams.remove(&id);
                        return Err(e);
                    }
                    debug!(conn = %self.inner.name, stream = id, "accepted stream");
                    return Ok(Stream::new(shared, Arc::clone(&self.inner)));
                }
            }
        }
    }

    /// Deliver a sideband signal to the peer's accept queue. This is the
    /// broker-side hook for membership and reload notifications.
    pub async fn send_signal(&self, signal: Signal) -> Result<()> {
        self.inner.send_frame(Frame::Dial { id: signal.id() }).await
    }

    /// Record our registration payload and announce it to the peer.
    pub async fn set_info(&self, info: Info) -> Result<()> {
        *self.inner.local_info.lock().unwrap() = Some(info.clone());
        self.inner
            .send_frame(Frame::Info {
                payload: info.to_wire(),
            })
            .await
    }

    /// The info this side registered with `set_info`, if any.
    pub fn local_info(&self) -> Option<Info> {
        self.inner.local_info.lock().unwrap().clone()
    }

    /// The peer's registration payload; blocks until it has arrived or the
    /// tunnel terminates. Stable once readable.
    pub async fn info(&self) -> Result<Info> {
        let mut rx = self.inner.peer_info.subscribe();
        tokio::select! {
            biased;
            res = rx.wait_for(|i| i.is_some()) => match res {
                Ok(guard) => Ok(guard.clone().expect("guarded by wait_for")),
                Err(_) => Err(self.inner.terminal_error()),
            },
            _ = self.inner.token.cancelled() => Err(self.inner.terminal_error()),
        }
    }

    /// Graceful shutdown: reset local streams, send TunnelClose, wait for the
    /// peer's confirm, then stop the tasks and drop the transport.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            // Another closer is driving the handshake; wait it out.
            self.inner.token.cancelled().await;
            return Ok(());
        }
        debug!(conn = %self.inner.name, "closing");
        self.inner.set_error_if_none(TunnelError::EndOfStream);

        let (tx, rx) = oneshot::channel();
        *self.inner.close_waiter.lock().unwrap() = Some(tx);
        let sent = self.inner.send_frame(Frame::TunnelClose).await.is_ok();
        self.inner.clean_streams();
        if sent {
            // The supervisor's liveness window bounds this wait if the peer
            // never answers.
            tokio::select! {
                _ = rx => {}
                _ = self.inner.token.cancelled() => {}
            }
        }
        self.inner.token.cancel();
        self.inner.join_tasks().await;
        debug!(conn = %self.inner.name, "closed");
        Ok(())
    }

    /// Abrupt shutdown: no negotiation with the peer.
    pub async fn reset(&self) {
        debug!(conn = %self.inner.name, "resetting");
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.set_error_if_none(TunnelError::EndOfStream);
        self.inner.clean_streams();
        self.inner.token.cancel();
        self.inner.join_tasks().await;
    }

    /// Whether the tunnel has reached its sticky terminal state.
    pub fn is_closed(&self) -> bool {
        self.inner.is_terminated()
    }

    /// The terminal error, once one has been recorded.
    pub fn last_error(&self) -> Option<TunnelError> {
        self.inner.err.lock().unwrap().clone()
    }

    /// Remote address of the transport, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.peer_addr
    }

    /// Log name of this connection (`client:N` / `server:N`).
    pub fn name(&self) -> &str {
        &self.inner.name
    }
}

impl ConnInner {
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    fn is_terminated(&self) -> bool {
        self.token.is_cancelled() || self.err.lock().unwrap().is_some()
    }

    pub(crate) fn terminal_error(&self) -> TunnelError {
        self.err
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(TunnelError::EndOfStream)
    }

    fn set_error_if_none(&self, err: TunnelError) {
        let mut slot = self.err.lock().unwrap();
        if slot.is_none() {
            *slot = Some(err);
        }
    }

    /// Record the terminal error and cancel everything attached to this
    /// connection. The reader and writer drop their transport halves on the
    /// way out, which closes the socket.
    fn occur_error(&self, err: TunnelError) {
        {
            let mut slot = self.err.lock().unwrap();
            if slot.is_none() {
                match &err {
                    TunnelError::EndOfStream => {
                        debug!(conn = %self.name, "terminated: end of stream")
                    }
                    other => warn!(conn = %self.name, error = %other, "terminated"),
                }
                *slot = Some(err);
            }
        }
        self.token.cancel();
    }

    fn insert_stream(&self, id: u64) -> Arc<StreamShared> {
        let shared = StreamShared::new(id, self.config.inbound_queue_chunks, self.token.child_token());
        self.streams.insert(id, Arc::clone(&shared));
        shared
    }

    pub(crate) fn remove_stream(&self, id: u64) {
        self.streams.remove(&id);
    }

    fn get_stream(&self, id: u64) -> Option<Arc<StreamShared>> {
        self.streams.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Reset every live stream locally. Waiters observe end-of-stream.
    fn clean_streams(&self) {
        let ids: Vec<u64> = self.streams.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, shared)) = self.streams.remove(&id) {
                shared.abort();
            }
        }
    }

    /// Mark a stream dead, tell the peer with a Reset frame and drop it from
    /// the table.
    async fn reset_stream(&self, shared: &Arc<StreamShared>, err: TunnelError) {
        if shared.begin_close(Some(err)) {
            let _ = self.send_frame(Frame::Reset { id: shared.id() }).await;
            self.streams.remove(&shared.id());
        }
    }

    /// Queue a frame for the writer; completes when the writer has taken it.
    pub(crate) async fn send_frame(&self, frame: Frame) -> Result<()> {
        tokio::select! {
            res = self.write_tx.send_async(WriteRequest::plain(frame)) => {
                res.map_err(|_| self.terminal_error())
            }
            _ = self.token.cancelled() => Err(self.terminal_error()),
        }
    }

    /// As `send_frame`, but hands back a slot that resolves once the frame
    /// has been flushed to the transport (with the payload size) or failed.
    pub(crate) async fn send_frame_tracked(
        &self,
        frame: Frame,
    ) -> Result<oneshot::Receiver<Result<usize>>> {
        let (tx, rx) = oneshot::channel();
        let request = WriteRequest {
            frame,
            done: Some(tx),
        };
        tokio::select! {
            res = self.write_tx.send_async(request) => {
                res.map_err(|_| self.terminal_error())?;
                Ok(rx)
            }
            _ = self.token.cancelled() => Err(self.terminal_error()),
        }
    }

    /// Non-blocking best-effort enqueue, for drop paths.
    pub(crate) fn try_send_frame(&self, frame: Frame) -> bool {
        self.write_tx.try_send(WriteRequest::plain(frame)).is_ok()
    }

    async fn join_tasks(&self) {
        let handles: Vec<JoinHandle<()>> = {
            let mut tasks = self.tasks.lock().unwrap();
            tasks.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
    }
}

/// EOF while waiting for the next frame's leading varint means the peer went
/// away cleanly; anywhere else it is a transport fault.
fn boundary_error(err: TunnelError) -> TunnelError {
    match &err {
        TunnelError::TransportFailure(io_err)
            if io_err.kind() == io::ErrorKind::UnexpectedEof =>
        {
            TunnelError::EndOfStream
        }
        _ => err,
    }
}

async fn reader_loop<R>(mut reader: BufReader<ReadHalf<R>>, inner: Arc<ConnInner>)
where
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            res = read_one_frame(&mut reader, &inner) => {
                if let Err(e) = res {
                    inner.occur_error(e);
                    break;
                }
            }
        }
    }
    debug!(conn = %inner.name, "reader exited");
}

/// Read and dispatch one frame. The idle watchdog covers only the leading
/// varint; a frame that has started arriving may take as long as it needs.
async fn read_one_frame<R>(
    reader: &mut BufReader<ReadHalf<R>>,
    inner: &Arc<ConnInner>,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let id = match tokio::time::timeout(
        inner.config.read_idle_timeout,
        codec::read_uvarint(reader),
    )
    .await
    {
        Err(_) => {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "read idle timeout").into());
        }
        Ok(Err(e)) => return Err(boundary_error(e)),
        Ok(Ok(id)) => id,
    };

    match id {
        CONTROL_ID => {
            let frame = codec::read_control(reader).await?;
            dispatch_control(frame, inner).await
        }
        id if id >= USER_ID_START => handle_data(id, reader, inner).await,
        other => Err(TunnelError::ProtocolError(format!(
            "unexpected stream id {other}"
        ))),
    }
}

async fn handle_data<R>(
    id: u64,
    reader: &mut BufReader<ReadHalf<R>>,
    inner: &Arc<ConnInner>,
) -> Result<()>
where
    R: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    // The payload must leave the wire even when the stream is already gone.
    let payload = codec::read_data_payload(reader).await?;
    let Some(shared) = inner.get_stream(id) else {
        return Ok(());
    };
    match shared.enqueue(payload) {
        Enqueue::Stored { remaining } => {
            let _ = inner
                .send_frame(Frame::DataConfirm {
                    id,
                    window: remaining as u64,
                })
                .await;
        }
        Enqueue::Full => {
            // The peer kept sending past a closed write gate.
            warn!(conn = %inner.name, stream = id, "inbound queue overrun, resetting stream");
            inner
                .reset_stream(&shared, TunnelError::ConnectionReset)
                .await;
        }
        Enqueue::Closed => {}
    }
    Ok(())
}

async fn dispatch_control(frame: Frame, inner: &Arc<ConnInner>) -> Result<()> {
    match frame {
        Frame::Dial { id } => {
            // Deferred so a slow accept() never stalls the reader.
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                tokio::select! {
                    _ = inner.token.cancelled() => {}
                    res = inner.accept_tx.send_async(id) => { let _ = res; }
                }
            });
        }
        Frame::Accept { id } => {
            if let Some(shared) = inner.get_stream(id) {
                shared.dial_accepted.notify_one();
            }
        }
        Frame::Close { id } => {
            if let Some((_, shared)) = inner.streams.remove(&id) {
                shared.close_remote();
            }
        }
        Frame::Reset { id } => {
            if let Some((_, shared)) = inner.streams.remove(&id) {
                shared.reset_remote();
            }
        }
        Frame::DataConfirm { id, window } => {
            if let Some(shared) = inner.get_stream(id) {
                shared.set_writable(window > 0);
                shared.complete_write_done();
            }
        }
        Frame::DataWindow { id, window } => {
            if let Some(shared) = inner.get_stream(id) {
                shared.set_writable(window > 0);
            }
        }
        Frame::Ping => {
            let inner = Arc::clone(inner);
            tokio::spawn(async move {
                let _ = inner.send_frame(Frame::Pong).await;
            });
        }
        Frame::Pong => {
            *inner.last_pong.lock().unwrap() = Instant::now();
        }
        Frame::TunnelClose => {
            debug!(conn = %inner.name, "peer closed the tunnel");
            inner.clean_streams();
            let (tx, rx) = oneshot::channel();
            let confirm = WriteRequest {
                frame: Frame::TunnelCloseConfirm,
                done: Some(tx),
            };
            // Hold the reader until the confirm has actually been flushed:
            // the peer drops the transport right after it arrives.
            if inner.write_tx.send_async(confirm).await.is_ok() {
                let _ = rx.await;
            }
            inner.occur_error(TunnelError::EndOfStream);
        }
        Frame::TunnelCloseConfirm => {
            if let Some(tx) = inner.close_waiter.lock().unwrap().take() {
                let _ = tx.send(());
            }
        }
        Frame::Connect { id, addr } => {
            if let Some(shared) = inner.get_stream(id) {
                let addr = String::from_utf8_lossy(&addr).into_owned();
                shared.set_remote_connect(addr);
            }
        }
        Frame::ConnectConfirm { id, error } => {
            if let Some(shared) = inner.get_stream(id) {
                if !shared.connect_armed() {
                    return Ok(());
                }
                if !error.is_empty() {
                    let text = String::from_utf8_lossy(&error).into_owned();
                    inner
                        .reset_stream(&shared, TunnelError::ConnectFailed(text))
                        .await;
                }
                shared.connect_signal.notify_one();
            }
        }
        Frame::Info { payload } => match Info::from_wire(&payload) {
            Ok(peer) => {
                debug!(conn = %inner.name, id = %peer.id, "peer info received");
                inner.peer_info.send_replace(Some(peer));
            }
            Err(e) => warn!(conn = %inner.name, error = %e, "discarding bad info frame"),
        },
        Frame::Data { .. } => {
            // Data frames never reach the control dispatcher.
            return Err(TunnelError::ProtocolError(
                "data frame on control stream".to_string(),
            ));
        }
    }
    Ok(())
}

async fn writer_loop<W>(
    mut writer: BufWriter<WriteHalf<W>>,
    write_rx: flume::Receiver<WriteRequest>,
    inner: Arc<ConnInner>,
) where
    W: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let mut keep_alive = tokio::time::interval(inner.config.keep_alive_interval);
    let mut buf = BytesMut::with_capacity(8 * 1024);
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            req = write_rx.recv_async() => {
                let Ok(req) = req else { break };
                if !write_request(&mut writer, &mut buf, req, &inner).await {
                    break;
                }
            }
            _ = keep_alive.tick() => {
                *inner.last_ping.lock().unwrap() = Instant::now();
                if !write_request(&mut writer, &mut buf, WriteRequest::plain(Frame::Ping), &inner).await {
                    break;
                }
            }
        }
    }
    debug!(conn = %inner.name, "writer exited");
}

async fn write_request<W>(
    writer: &mut BufWriter<WriteHalf<W>>,
    buf: &mut BytesMut,
    req: WriteRequest,
    inner: &Arc<ConnInner>,
) -> bool
where
    W: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    buf.clear();
    let payload_len = req.frame.payload_len();
    codec::encode_frame(&req.frame, buf);

    let result = async {
        writer.write_all(buf).await?;
        writer.flush().await
    }
    .await;

    match result {
        Ok(()) => {
            if let Some(done) = req.done {
                let _ = done.send(Ok(payload_len));
            }
            true
        }
        Err(e) => {
            let err = TunnelError::from(e);
            if let Some(done) = req.done {
                let _ = done.send(Err(err.clone()));
            }
            inner.occur_error(err);
            false
        }
    }
}

/// Liveness detector: both the last sent ping and the last received pong must
/// stay inside the liveness window.
async fn supervisor_loop(inner: Arc<ConnInner>) {
    let mut ticker = tokio::time::interval(inner.config.keep_alive_interval);
    loop {
        tokio::select! {
            _ = inner.token.cancelled() => break,
            _ = ticker.tick() => {
                let now = Instant::now();
                let ping_age = now.duration_since(*inner.last_ping.lock().unwrap());
                let pong_age = now.duration_since(*inner.last_pong.lock().unwrap());
                if ping_age > inner.config.liveness_timeout {
                    inner.occur_error(TunnelError::LivenessTimeout("ping".to_string()));
                    break;
                }
                if pong_age > inner.config.liveness_timeout {
                    inner.occur_error(TunnelError::LivenessTimeout("pong".to_string()));
                    break;
                }
            }
        }
    }
    debug!(conn = %inner.name, "supervisor exited");
}
