//! Shared test fixtures: a scripted transport, counting handlers and small
//! fake servers speaking the proto framing.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::cluster::Node;
use crate::command::ResponseHandler;
use crate::connection::{IoStatus, Transport};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{
    frame, MessageType, ProtoHeader, AUTH_RESULT_CODE_OFFSET, MSG_HEADER_SIZE, PROTO_HEADER_SIZE,
};

/// Installs a test subscriber once; `RUST_LOG` selects the level.
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub(crate) fn test_node() -> Arc<Node> {
    Arc::new(Node::new("A1", vec!["127.0.0.1:3000".parse().unwrap()]).unwrap())
}

/// A data-message header declaring `size` body bytes.
pub(crate) fn header_bytes(size: u64) -> Bytes {
    Bytes::copy_from_slice(&ProtoHeader::new(MessageType::Message, size).encode())
}

/// Deterministic body bytes: `body_bytes(0, 5)` followed by
/// `body_bytes(5, 15)` equals `body_bytes(0, 20)`.
pub(crate) fn body_bytes(start: usize, len: usize) -> Bytes {
    (start..start + len).map(|i| (i % 251) as u8).collect()
}

/// Increments a shared counter when dropped.
#[derive(Debug)]
pub(crate) struct DropCounter(Arc<AtomicUsize>);

impl DropCounter {
    pub(crate) fn new(counter: &Arc<AtomicUsize>) -> Self {
        Self(Arc::clone(counter))
    }
}

impl Drop for DropCounter {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
enum MockRead {
    Data(Bytes),
    Status(fn() -> IoStatus),
}

/// Scripted write outcomes.
#[derive(Debug, Clone, Copy)]
pub(crate) enum MockWrite {
    Accept,
    Block,
}

/// A transport whose reads, writes and handshake steps are scripted.
///
/// Reads consume the script in order; a data entry larger than the caller's
/// buffer is split. An exhausted read script reports the peer closed.
/// Writes are accepted unless scripted otherwise.
#[derive(Debug, Default)]
pub(crate) struct MockTransport {
    tls: bool,
    buffered: bool,
    reads: VecDeque<MockRead>,
    writes: VecDeque<MockWrite>,
    handshakes: VecDeque<IoStatus>,
    write_limit: Option<usize>,
    written: Vec<u8>,
    read_calls: usize,
}

impl MockTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn tls() -> Self {
        Self {
            tls: true,
            ..Self::default()
        }
    }

    /// While set, `has_pending` reports data whenever the next scripted
    /// read is data, the way a TLS session holds decrypted records.
    pub(crate) fn set_buffered(&mut self, buffered: bool) {
        self.buffered = buffered;
    }

    pub(crate) fn set_write_limit(&mut self, limit: usize) {
        self.write_limit = Some(limit);
    }

    pub(crate) fn push_read(&mut self, data: impl Into<Bytes>) {
        self.reads.push_back(MockRead::Data(data.into()));
    }

    pub(crate) fn push_would_block(&mut self) {
        self.reads.push_back(MockRead::Status(|| IoStatus::NeedRead));
    }

    pub(crate) fn push_need_read(&mut self) {
        self.push_would_block();
    }

    pub(crate) fn push_need_write(&mut self) {
        self.reads.push_back(MockRead::Status(|| IoStatus::NeedWrite));
    }

    pub(crate) fn push_closed(&mut self) {
        self.reads.push_back(MockRead::Status(|| IoStatus::Closed));
    }

    pub(crate) fn push_failure(&mut self) {
        self.reads.push_back(MockRead::Status(|| {
            IoStatus::Failed(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
        }));
    }

    pub(crate) fn push_write(&mut self, write: MockWrite) {
        self.writes.push_back(write);
    }

    pub(crate) fn push_handshake(&mut self, status: IoStatus) {
        self.handshakes.push_back(status);
    }

    pub(crate) fn written(&self) -> Bytes {
        Bytes::copy_from_slice(&self.written)
    }

    pub(crate) fn reads_left(&self) -> usize {
        self.reads.len()
    }

    pub(crate) fn read_calls(&self) -> usize {
        self.read_calls
    }
}

impl Transport for MockTransport {
    fn read_once(&mut self, buf: &mut [u8]) -> IoStatus {
        self.read_calls += 1;
        match self.reads.pop_front() {
            Some(MockRead::Data(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    let rest = data.split_off(n);
                    self.reads.push_front(MockRead::Data(rest));
                }
                IoStatus::Done(n)
            }
            Some(MockRead::Status(status)) => status(),
            None => IoStatus::Closed,
        }
    }

    fn write_once(&mut self, buf: &[u8]) -> IoStatus {
        match self.writes.pop_front().unwrap_or(MockWrite::Accept) {
            MockWrite::Accept => {
                let n = self.write_limit.map_or(buf.len(), |l| l.min(buf.len()));
                self.written.extend_from_slice(&buf[..n]);
                IoStatus::Done(n)
            }
            MockWrite::Block => IoStatus::NeedWrite,
        }
    }

    fn handshake_once(&mut self) -> IoStatus {
        self.handshakes.pop_front().unwrap_or(IoStatus::Done(0))
    }

    fn has_pending(&mut self) -> bool {
        self.buffered && matches!(self.reads.front(), Some(MockRead::Data(_)))
    }

    fn is_tls(&self) -> bool {
        self.tls
    }

    fn is_reusable(&mut self) -> bool {
        self.reads.is_empty()
    }
}

#[derive(Default)]
struct Counts {
    successes: usize,
    errors: usize,
    last_error: Option<ClientError>,
    bodies: Vec<Bytes>,
}

/// A response handler that records every callback. Clones share state.
#[derive(Clone)]
pub(crate) struct CountingHandler {
    blocks: usize,
    counts: Arc<Mutex<Counts>>,
    drops: Arc<AtomicUsize>,
    order: Option<(usize, Arc<Mutex<Vec<usize>>>)>,
}

impl CountingHandler {
    pub(crate) fn new() -> Self {
        Self::with_blocks(1)
    }

    /// Completes after `blocks` bodies.
    pub(crate) fn with_blocks(blocks: usize) -> Self {
        Self {
            blocks,
            counts: Arc::new(Mutex::new(Counts::default())),
            drops: Arc::new(AtomicUsize::new(0)),
            order: None,
        }
    }

    /// Appends `tag` to `log` when the terminal callback runs.
    pub(crate) fn tagged(tag: usize, log: &Arc<Mutex<Vec<usize>>>) -> Self {
        let mut handler = Self::new();
        handler.order = Some((tag, Arc::clone(log)));
        handler
    }

    pub(crate) fn successes(&self) -> usize {
        self.counts.lock().successes
    }

    pub(crate) fn errors(&self) -> usize {
        self.counts.lock().errors
    }

    pub(crate) fn last_error(&self) -> Option<ClientError> {
        self.counts.lock().last_error.clone()
    }

    pub(crate) fn bodies(&self) -> Vec<Bytes> {
        self.counts.lock().bodies.clone()
    }

    /// Concatenated bodies, for responses split across blocks.
    pub(crate) fn body(&self) -> Bytes {
        Bytes::from(self.counts.lock().bodies.concat())
    }

    /// Handler instances dropped so far (the test's own clone excluded
    /// until it goes out of scope).
    pub(crate) fn drops(&self) -> usize {
        self.drops.load(Ordering::SeqCst)
    }

    fn record_order(&self) {
        if let Some((tag, log)) = &self.order {
            log.lock().push(*tag);
        }
    }
}

impl ResponseHandler for CountingHandler {
    fn parse_results(&mut self, body: &[u8]) -> ClientResult<bool> {
        let mut counts = self.counts.lock();
        counts.bodies.push(Bytes::copy_from_slice(body));
        Ok(counts.bodies.len() >= self.blocks)
    }

    fn on_success(self: Box<Self>) {
        self.counts.lock().successes += 1;
        self.record_order();
    }

    fn on_error(self: Box<Self>, err: ClientError) {
        let mut counts = self.counts.lock();
        counts.errors += 1;
        counts.last_error = Some(err);
        drop(counts);
        self.record_order();
    }
}

impl Drop for CountingHandler {
    fn drop(&mut self) {
        self.drops.fetch_add(1, Ordering::SeqCst);
    }
}

/// How a fake server answers.
#[derive(Debug, Clone, Copy)]
pub(crate) enum ServerMode {
    /// Answers each data request with a data message carrying its body.
    Echo,
    /// Answers with `blocks` copies of the request body, then an end block.
    Stream { blocks: usize },
    /// Answers admin requests with `code`, closing on failure; echoes data.
    Auth { code: u8 },
    /// Reads requests and never answers.
    Silent,
    /// Closes the connection after reading a request.
    Close,
    /// Answers one data request like `Echo`, then closes.
    EchoOnce,
}

pub(crate) struct FakeServer {
    pub(crate) addr: SocketAddr,
    pub(crate) accepted: Arc<AtomicUsize>,
    pub(crate) requests: Arc<AtomicUsize>,
}

/// Starts a fake server on localhost, serving every connection in `mode`.
pub(crate) async fn start_server(mode: ServerMode) -> FakeServer {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicUsize::new(0));
    let requests = Arc::new(AtomicUsize::new(0));

    let accepted_clone = Arc::clone(&accepted);
    let requests_clone = Arc::clone(&requests);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            accepted_clone.fetch_add(1, Ordering::SeqCst);
            let requests = Arc::clone(&requests_clone);
            tokio::spawn(async move {
                let _ = serve(stream, mode, requests).await;
            });
        }
    });

    FakeServer {
        addr,
        accepted,
        requests,
    }
}

async fn serve(mut stream: TcpStream, mode: ServerMode, requests: Arc<AtomicUsize>) -> io::Result<()> {
    loop {
        let mut raw = [0u8; PROTO_HEADER_SIZE];
        stream.read_exact(&mut raw).await?;
        let header = ProtoHeader::decode(&raw)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        let mut body = vec![0u8; header.body_len()];
        stream.read_exact(&mut body).await?;

        if header.msg_type == MessageType::Admin {
            let code = match mode {
                ServerMode::Auth { code } => code,
                _ => 0,
            };
            let mut reply = vec![0u8; 16];
            reply[AUTH_RESULT_CODE_OFFSET] = code;
            stream.write_all(&frame(MessageType::Admin, &reply)).await?;
            if code != 0 {
                return Ok(());
            }
            continue;
        }

        requests.fetch_add(1, Ordering::SeqCst);
        match mode {
            ServerMode::Echo | ServerMode::Auth { .. } => {
                stream.write_all(&frame(MessageType::Message, &body)).await?;
            }
            ServerMode::Stream { blocks } => {
                for _ in 0..blocks {
                    stream.write_all(&frame(MessageType::Message, &body)).await?;
                }
                stream
                    .write_all(&frame(MessageType::Message, &[0u8; MSG_HEADER_SIZE]))
                    .await?;
            }
            ServerMode::EchoOnce => {
                stream.write_all(&frame(MessageType::Message, &body)).await?;
                return Ok(());
            }
            ServerMode::Silent => {}
            ServerMode::Close => return Ok(()),
        }
    }
}

/// A localhost address nothing listens on.
pub(crate) async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
