//! Command Handler Module
//!
//! A `Command` is one in-flight request. It owns everything the state
//! machine touches between readiness events: the request bytes, the read
//! buffer and its cursors, the current state, retry count and deadlines, and
//! the handler that receives the terminal callback.
//!
//! ## Ownership
//!
//! A command is boxed when it is submitted and moved, never shared: from the
//! submitting thread into the loop's queue, then into exactly one
//! connection driver. The terminal methods [`Command::complete`] and
//! [`Command::fail`] consume the box, so a second callback cannot be
//! expressed. A command dropped without reaching either still reports a
//! `Closed` error to its handler.
//!
//! ## Timers
//!
//! Each command arms at most one deadline at a time: the earlier of its
//! socket period and its total deadline.
//!
//! ```text
//!   attempt start ──► socket deadline = now + socket_timeout
//!   write complete ─► socket deadline restarted, read flag cleared
//!   bytes read ─────► read flag set
//!   socket deadline passes:
//!       read flag set   ─► forgiven: clear flag, re-arm another period
//!       read flag clear ─► socket timeout
//!   total deadline passes ─► total timeout (never forgiven)
//! ```

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

use crate::cluster::Node;
use crate::command::buffer::ReadBuffer;
use crate::command::state::CommandState;
use crate::config::CommandPolicy;
use crate::connection::{Connection, Transport};
use crate::error::{ClientError, ClientResult, TimeoutKind};
use crate::protocol::{MSG_HEADER_SIZE, PROTO_HEADER_SIZE};

static NEXT_COMMAND_ID: AtomicU64 = AtomicU64::new(1);

/// Receives a command's response blocks and its terminal callback.
///
/// `parse_results` may be called many times on one command (once per
/// response block). Exactly one of `on_success` / `on_error` is called,
/// after which the handler is gone.
pub trait ResponseHandler: Send {
    /// Consumes one response body. Returns true when the response is
    /// complete, false when another block follows on the same connection.
    fn parse_results(&mut self, body: &[u8]) -> ClientResult<bool>;

    fn on_success(self: Box<Self>);

    fn on_error(self: Box<Self>, err: ClientError);
}

/// The blocks of a completed response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Response {
    blocks: Vec<Bytes>,
}

impl Response {
    pub fn blocks(&self) -> &[Bytes] {
        &self.blocks
    }

    pub fn into_blocks(self) -> Vec<Bytes> {
        self.blocks
    }

    /// All block bodies concatenated.
    pub fn body(&self) -> Bytes {
        match self.blocks.as_slice() {
            [single] => single.clone(),
            blocks => Bytes::from(blocks.concat()),
        }
    }
}

type IsLast = Box<dyn FnMut(&[u8]) -> bool + Send>;

/// A handler that collects response bodies and delivers them through a
/// oneshot channel.
///
/// # Example
///
/// ```
/// use flashclient::command::Collector;
///
/// let (collector, rx) = Collector::single();
/// // submit a command with `Box::new(collector)`, then `rx.await`
/// # drop((collector, rx));
/// ```
pub struct Collector {
    blocks: Vec<Bytes>,
    is_last: IsLast,
    tx: oneshot::Sender<ClientResult<Response>>,
}

impl Collector {
    /// Creates a collector whose response ends when `is_last` returns true
    /// for a body.
    pub fn new<F>(is_last: F) -> (Self, oneshot::Receiver<ClientResult<Response>>)
    where
        F: FnMut(&[u8]) -> bool + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let collector = Self {
            blocks: Vec::new(),
            is_last: Box::new(is_last),
            tx,
        };
        (collector, rx)
    }

    /// A single-block response.
    pub fn single() -> (Self, oneshot::Receiver<ClientResult<Response>>) {
        Self::new(|_| true)
    }

    /// A streamed response terminated by an empty end block.
    pub fn until_end_block() -> (Self, oneshot::Receiver<ClientResult<Response>>) {
        Self::new(|body| body.len() == MSG_HEADER_SIZE)
    }
}

impl ResponseHandler for Collector {
    fn parse_results(&mut self, body: &[u8]) -> ClientResult<bool> {
        self.blocks.push(Bytes::copy_from_slice(body));
        Ok((self.is_last)(body))
    }

    fn on_success(self: Box<Self>) {
        // The receiver may have given up waiting.
        let _ = self.tx.send(Ok(Response {
            blocks: self.blocks,
        }));
    }

    fn on_error(self: Box<Self>, err: ClientError) {
        let _ = self.tx.send(Err(err));
    }
}

/// Deadline bookkeeping for one command.
#[derive(Debug, Default)]
struct Timers {
    armed: bool,
    total_deadline: Option<Instant>,
    socket_deadline: Option<Instant>,
}

/// One in-flight request.
pub struct Command {
    id: u64,
    node: Arc<Node>,
    state: CommandState,
    policy: CommandPolicy,
    pub(crate) request: Bytes,
    pub(crate) auth_request: Option<Bytes>,
    pub(crate) read_buf: ReadBuffer,
    pub(crate) pos: usize,
    pub(crate) len: usize,
    iteration: u32,
    sent: bool,
    event_received: bool,
    pipelined: bool,
    timers: Timers,
    cancel: CancellationToken,
    handler: Option<Box<dyn ResponseHandler>>,
}

impl Command {
    /// Creates a command for `node`. `request` is the complete framed
    /// request, written as-is on every attempt.
    pub fn new(node: Arc<Node>, request: Bytes, handler: Box<dyn ResponseHandler>) -> Self {
        Self {
            id: NEXT_COMMAND_ID.fetch_add(1, Ordering::Relaxed),
            node,
            state: CommandState::Queued,
            policy: CommandPolicy::default(),
            request,
            auth_request: None,
            read_buf: ReadBuffer::new(),
            pos: 0,
            len: 0,
            iteration: 0,
            sent: false,
            event_received: false,
            pipelined: false,
            timers: Timers::default(),
            cancel: CancellationToken::new(),
            handler: Some(handler),
        }
    }

    pub fn with_policy(mut self, policy: CommandPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Uses `token` for cancellation, e.g. a child of an application-wide
    /// token.
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// A handle that cancels this command.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub(crate) fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn state(&self) -> CommandState {
        self.state
    }

    pub(crate) fn set_state(&mut self, next: CommandState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "command {} moved backwards: {} -> {}",
            self.id,
            self.state,
            next
        );
        self.state = next;
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    /// Retries already performed.
    pub fn iteration(&self) -> u32 {
        self.iteration
    }

    /// True once any request byte was written on any attempt.
    pub fn is_sent(&self) -> bool {
        self.sent
    }

    pub(crate) fn mark_sent(&mut self) {
        self.sent = true;
    }

    pub fn is_pipelined(&self) -> bool {
        self.pipelined
    }

    pub(crate) fn set_pipelined(&mut self, pipelined: bool) {
        self.pipelined = pipelined;
    }

    pub fn read_buffer(&self) -> &ReadBuffer {
        &self.read_buf
    }

    /// Picks the first state for this attempt from what the connection has
    /// already been through.
    pub fn begin_session<T: Transport>(&mut self, conn: &Connection<T>) {
        self.auth_request = self.node.auth().map(|auth| auth.request.clone());

        if !conn.is_secured() {
            self.pos = 0;
            self.len = 0;
            self.set_state(CommandState::TlsConnect);
        } else if self.auth_request.is_some() && !conn.is_authenticated() {
            self.start_auth_write();
        } else {
            self.start_command_write();
        }
        trace!(command = self.id, conn = conn.id(), state = %self.state, "Command session started");
    }

    pub(crate) fn start_auth_write(&mut self) {
        self.pos = 0;
        self.len = self.auth_request.as_ref().map_or(0, Bytes::len);
        self.set_state(CommandState::AuthWrite);
    }

    pub(crate) fn start_command_write(&mut self) {
        self.pos = 0;
        self.len = self.request.len();
        self.set_state(CommandState::CommandWrite);
    }

    /// Prepares to read the next proto header into the read buffer.
    pub(crate) fn start_header_read(&mut self, state: CommandState) {
        self.pos = 0;
        self.len = PROTO_HEADER_SIZE;
        self.set_state(state);
    }

    /// Hands the current body to the response handler.
    pub(crate) fn parse_results(&mut self) -> ClientResult<bool> {
        let body = self.read_buf.slice(self.len);
        match self.handler.as_mut() {
            Some(handler) => handler.parse_results(body),
            None => Err(ClientError::client("response handler already completed")),
        }
    }

    /// Starts the total deadline. Only the first call has an effect, so
    /// the deadline spans every retry.
    pub(crate) fn arm_total(&mut self, now: Instant) {
        if self.timers.total_deadline.is_none() {
            self.timers.total_deadline = self.policy.total_timeout.map(|t| now + t);
        }
    }

    /// Arms the timers for a new attempt.
    pub(crate) fn start_attempt(&mut self, now: Instant) {
        self.arm_total(now);
        self.timers.armed = true;
        self.event_received = false;
        self.timers.socket_deadline = self.policy.socket_timeout.map(|t| now + t);
    }

    /// A write just completed: the read phase gets a fresh socket period.
    pub(crate) fn on_write_complete(&mut self, now: Instant) {
        self.restart_socket_period(now);
    }

    /// Starts a fresh socket period, leaving the total deadline alone.
    pub(crate) fn restart_socket_period(&mut self, now: Instant) {
        self.event_received = false;
        if self.timers.armed {
            self.timers.socket_deadline = self.policy.socket_timeout.map(|t| now + t);
        }
    }

    pub(crate) fn on_bytes_read(&mut self) {
        self.event_received = true;
    }

    /// The single deadline currently armed, if any.
    pub fn deadline(&self) -> Option<Instant> {
        if !self.timers.armed {
            return self.timers.total_deadline;
        }
        match (self.timers.socket_deadline, self.timers.total_deadline) {
            (Some(s), Some(t)) => Some(s.min(t)),
            (s, t) => s.or(t),
        }
    }

    pub fn total_deadline(&self) -> Option<Instant> {
        self.timers.total_deadline
    }

    pub fn total_expired(&self, now: Instant) -> bool {
        self.timers.total_deadline.is_some_and(|d| now >= d)
    }

    /// Handles the armed deadline firing at `now`. Returns the timeout to
    /// report, or `None` when the socket period was forgiven (or the wake
    /// was early) and the timer re-armed.
    pub(crate) fn check_deadline(&mut self, now: Instant) -> Option<TimeoutKind> {
        if self.total_expired(now) {
            return Some(TimeoutKind::Total);
        }

        match self.timers.socket_deadline {
            Some(deadline) if self.timers.armed && now >= deadline => {
                if self.event_received {
                    self.event_received = false;
                    self.timers.socket_deadline = self.policy.socket_timeout.map(|t| now + t);
                    trace!(command = self.id, "Socket period had reads, re-armed");
                    None
                } else {
                    Some(TimeoutKind::Socket)
                }
            }
            _ => None,
        }
    }

    /// Disarms the per-attempt timer. The total deadline is kept for retry
    /// decisions.
    pub(crate) fn stop_timers(&mut self) {
        self.timers.armed = false;
        self.timers.socket_deadline = None;
    }

    /// Resets the command for another attempt.
    pub(crate) fn prepare_retry(&mut self) {
        self.stop_timers();
        self.iteration += 1;
        self.pos = 0;
        self.len = 0;
        self.event_received = false;
        self.set_state(CommandState::Queued);
    }

    /// Delivers success. Consumes the command and releases its buffers.
    pub fn complete(mut self: Box<Self>) {
        self.stop_timers();
        self.set_state(CommandState::Done);
        if let Some(handler) = self.handler.take() {
            handler.on_success();
        }
    }

    /// Delivers `err`. The error is marked in doubt if any request byte was
    /// written on any attempt.
    pub fn fail(mut self: Box<Self>, err: ClientError) {
        self.stop_timers();
        let in_doubt = err.in_doubt() || self.sent;
        if let Some(handler) = self.handler.take() {
            handler.on_error(err.set_in_doubt(in_doubt));
        }
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        if let Some(handler) = self.handler.take() {
            warn!(command = self.id, state = %self.state, "Command dropped before completion");
            handler.on_error(ClientError::closed("command abandoned").set_in_doubt(self.sent));
        }
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Command")
            .field("id", &self.id)
            .field("node", &self.node.name())
            .field("state", &self.state)
            .field("pos", &self.pos)
            .field("len", &self.len)
            .field("iteration", &self.iteration)
            .field("sent", &self.sent)
            .field("pipelined", &self.pipelined)
            .finish()
    }
}
