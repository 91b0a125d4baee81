//! Pipelined Connection
//!
//! Many commands share one connection. Requests are written one after
//! another and the server answers in the same order, so responses are
//! matched to commands purely by position.
//!
//! ```text
//!                ┌──────────────── Pipeline ─────────────────┐
//!   enqueue ──►  │ queued: [C5, C6]                          │
//!                │    │ (next when writer is done)           │
//!                │    ▼                                      │
//!                │ writer: C4 ──── write complete ──┐        │
//!                │                                  ▼        │
//!                │ readers: [C1, C2, C3] ◄──── push back     │
//!                │           │                               │
//!                └───────────┼───────────────────────────────┘
//!                            ▼
//!                 next response belongs to C1
//! ```
//!
//! A new connection's TLS handshake and authentication are driven by its
//! first writer. While the reader list is empty, read events go to that
//! writer; otherwise they always go to the oldest reader.
//!
//! Any failure or timeout of an in-flight command breaks the connection:
//! the responses still in flight can no longer be matched. The failing
//! command gets its error, the other in-flight commands get a retryable
//! "Pipeline connection aborted" error, and commands that never reached the
//! connection are handed back for another one.

use std::collections::VecDeque;
use tokio::io::Interest;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::command::{dispatch, Command, CommandState, Progress};
use crate::connection::handler::Connection;
use crate::connection::socket::Transport;
use crate::error::{ClientError, TimeoutKind};

/// A command leaving the pipeline.
#[derive(Debug)]
pub enum Finished {
    /// Response complete.
    Done(Box<Command>),
    /// Attempt failed; the loop decides whether to retry.
    Failed(Box<Command>, ClientError),
    /// Never reached the connection; submit it again elsewhere.
    Requeue(Box<Command>),
}

/// Commands multiplexed over one connection.
#[derive(Debug)]
pub struct Pipeline<T> {
    conn: Connection<T>,
    writer: Option<Box<Command>>,
    writer_interest: Option<Interest>,
    queued: VecDeque<Box<Command>>,
    readers: VecDeque<Box<Command>>,
    reader_interest: Interest,
    broken: bool,
}

impl<T: Transport> Pipeline<T> {
    pub fn new(conn: Connection<T>) -> Self {
        Self {
            conn,
            writer: None,
            writer_interest: None,
            queued: VecDeque::new(),
            readers: VecDeque::new(),
            reader_interest: Interest::READABLE,
            broken: false,
        }
    }

    pub fn connection(&self) -> &Connection<T> {
        &self.conn
    }

    /// Adds a command behind any already waiting to be written.
    pub fn enqueue(&mut self, mut cmd: Box<Command>) {
        cmd.set_pipelined(true);
        self.queued.push_back(cmd);
    }

    /// Commands queued, being written or awaiting a response.
    pub fn len(&self) -> usize {
        self.queued.len() + self.readers.len() + usize::from(self.writer.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Commands not yet handed to the writer.
    pub fn queued(&self) -> usize {
        self.queued.len()
    }

    pub fn readers(&self) -> usize {
        self.readers.len()
    }

    pub fn has_writer(&self) -> bool {
        self.writer.is_some()
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Promotes queued commands to writer and writes as far as the socket
    /// allows. Each finished write moves its command to the reader tail.
    pub fn pump_writer(&mut self, out: &mut Vec<Finished>) {
        loop {
            if self.broken {
                return;
            }

            if self.writer.is_none() {
                let Some(mut cmd) = self.queued.pop_front() else {
                    return;
                };
                if cmd.is_cancelled() {
                    out.push(Finished::Failed(cmd, ClientError::cancelled()));
                    continue;
                }
                cmd.begin_session(&self.conn);
                cmd.start_attempt(Instant::now());
                self.writer = Some(cmd);
            }

            let Some(mut cmd) = self.writer.take() else {
                return;
            };

            match dispatch(&mut cmd, &mut self.conn) {
                Progress::Pending if cmd.state() >= CommandState::CommandReadHeader => {
                    trace!(command = cmd.id(), conn = self.conn.id(), "Writer became reader");
                    self.readers.push_back(cmd);
                    self.writer_interest = None;
                }
                Progress::Pending => {
                    self.writer_interest = self.conn.watching();
                    self.writer = Some(cmd);
                    return;
                }
                Progress::Done => out.push(Finished::Done(cmd)),
                Progress::Failed(err) => {
                    self.abort(Some(cmd), err, out);
                    return;
                }
            }
        }
    }

    /// Reads responses for the oldest readers until one must wait.
    fn pump_readers(&mut self, out: &mut Vec<Finished>) {
        while let Some(mut cmd) = self.readers.pop_front() {
            match dispatch(&mut cmd, &mut self.conn) {
                Progress::Pending => {
                    self.reader_interest = self.conn.watching().unwrap_or(Interest::READABLE);
                    self.readers.push_front(cmd);
                    return;
                }
                Progress::Done => {
                    self.reader_interest = Interest::READABLE;
                    out.push(Finished::Done(cmd));
                    // The socket timer only runs for the reader at the head.
                    if let Some(next) = self.readers.front_mut() {
                        next.restart_socket_period(Instant::now());
                    }
                }
                Progress::Failed(err) => {
                    self.abort(Some(cmd), err, out);
                    return;
                }
            }
        }
    }

    /// Handles a read readiness event.
    pub fn on_readable(&mut self, out: &mut Vec<Finished>) {
        if !self.readers.is_empty() {
            self.pump_readers(out);
        } else if self.writer.is_some() {
            if self.writer_interest.is_some_and(|i| i.is_readable()) {
                // Handshake or authentication reply for the first writer.
                self.pump_writer(out);
            } else {
                debug!(conn = self.conn.id(), "Pipeline read event ignored");
            }
        } else if self.conn.transport().is_reusable() {
            debug!(conn = self.conn.id(), "Pipeline read event ignored");
        } else {
            debug!(conn = self.conn.id(), "Idle pipeline closed by peer");
            self.broken = true;
        }
    }

    /// Handles a write readiness event.
    pub fn on_writable(&mut self, out: &mut Vec<Finished>) {
        if self.writer.is_some() {
            self.pump_writer(out);
        }
        if !self.broken && !self.readers.is_empty() && self.reader_interest.is_writable() {
            self.pump_readers(out);
        }
    }

    /// The readiness set the pipeline needs next. An idle pipeline watches
    /// for reads so a server-side close is noticed.
    pub fn desired_watch(&self) -> Option<Interest> {
        if self.broken {
            return None;
        }
        let writer = if self.writer.is_some() {
            self.writer_interest
        } else {
            None
        };
        let readers = (!self.readers.is_empty()).then_some(self.reader_interest);

        match (writer, readers) {
            (Some(w), Some(r)) => Some(w | r),
            (Some(w), None) => Some(w),
            (None, Some(r)) => Some(r),
            (None, None) if self.writer.is_none() => Some(Interest::READABLE),
            (None, None) => None,
        }
    }

    /// Subscribes the connection to [`desired_watch`](Self::desired_watch).
    pub fn rewatch(&mut self) -> Option<Interest> {
        let interest = self.desired_watch();
        match interest {
            Some(interest) => {
                self.conn.watch(interest);
            }
            None => self.conn.unwatch(),
        }
        interest
    }

    /// Earliest deadline among in-flight and queued commands. Readers
    /// behind the head only count their total deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        let waiting = self.readers.iter().skip(1).chain(self.queued.iter());
        self.writer
            .iter()
            .chain(self.readers.front())
            .filter_map(|cmd| cmd.deadline())
            .chain(waiting.filter_map(|cmd| cmd.total_deadline()))
            .min()
    }

    /// Fires expired deadlines. Queued commands past their total deadline
    /// fail on their own; an in-flight timeout aborts the connection.
    ///
    /// Only the head reader is subject to the socket timeout: the others
    /// cannot read until it finishes, however busy the socket is.
    pub fn check_timeouts(&mut self, now: Instant, out: &mut Vec<Finished>) {
        let mut i = 0;
        while i < self.queued.len() {
            if self.queued[i].total_expired(now) {
                if let Some(cmd) = self.queued.remove(i) {
                    out.push(Finished::Failed(cmd, ClientError::timeout(TimeoutKind::Total)));
                }
            } else {
                i += 1;
            }
        }

        if let Some(kind) = self.writer.as_mut().and_then(|cmd| cmd.check_deadline(now)) {
            let cmd = self.writer.take();
            self.abort(cmd, ClientError::timeout(kind), out);
            return;
        }

        let expired = self
            .readers
            .iter_mut()
            .enumerate()
            .find_map(|(i, cmd)| {
                let kind = if i == 0 {
                    cmd.check_deadline(now)
                } else {
                    cmd.total_expired(now).then_some(TimeoutKind::Total)
                };
                kind.map(|kind| (i, kind))
            });
        if let Some((index, kind)) = expired {
            let cmd = self.readers.remove(index);
            self.abort(cmd, ClientError::timeout(kind), out);
        }
    }

    /// Fails queued commands whose cancellation token fired. In-flight
    /// commands cannot be withdrawn without breaking response order.
    pub fn sweep_cancelled(&mut self, out: &mut Vec<Finished>) {
        let mut i = 0;
        while i < self.queued.len() {
            if self.queued[i].is_cancelled() {
                if let Some(cmd) = self.queued.remove(i) {
                    out.push(Finished::Failed(cmd, ClientError::cancelled()));
                }
            } else {
                i += 1;
            }
        }
    }

    /// Breaks the connection and hands every command back.
    pub fn abort(&mut self, culprit: Option<Box<Command>>, err: ClientError, out: &mut Vec<Finished>) {
        warn!(
            conn = self.conn.id(),
            error = %err,
            readers = self.readers.len(),
            queued = self.queued.len(),
            "Pipeline connection aborted"
        );
        self.broken = true;
        self.conn.unwatch();

        if let Some(cmd) = culprit {
            out.push(Finished::Failed(cmd, err));
        }

        let aborted = ClientError::connection("Pipeline connection aborted");
        for cmd in self.readers.drain(..).chain(self.writer.take()) {
            out.push(Finished::Failed(cmd, aborted.clone()));
        }
        for cmd in self.queued.drain(..) {
            out.push(Finished::Requeue(cmd));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{AuthToken, Node};
    use crate::config::CommandPolicy;
    use crate::error::ErrorKind;
    use crate::protocol::{frame, MessageType, AUTH_RESULT_CODE_OFFSET};
    use crate::testing::{body_bytes, header_bytes, test_node, CountingHandler, MockTransport, MockWrite};
    use bytes::Bytes;
    use parking_lot::Mutex;
    use std::sync::Arc;
    use std::time::Duration;

    fn tagged(node: &Arc<Node>, tag: usize, log: &Arc<Mutex<Vec<usize>>>) -> (Box<Command>, CountingHandler) {
        let handler = CountingHandler::tagged(tag, log);
        let request = frame(MessageType::Message, format!("req-{}", tag).as_bytes());
        let cmd = Box::new(Command::new(Arc::clone(node), request, Box::new(handler.clone())));
        (cmd, handler)
    }

    fn settle(out: Vec<Finished>) {
        for finished in out {
            match finished {
                Finished::Done(cmd) => cmd.complete(),
                Finished::Failed(cmd, err) => cmd.fail(err),
                Finished::Requeue(cmd) => cmd.fail(ClientError::closed("requeued")),
            }
        }
    }

    fn response(body: &Bytes) -> Vec<u8> {
        let mut wire = header_bytes(body.len() as u64).to_vec();
        wire.extend_from_slice(body);
        wire
    }

    #[test]
    fn test_responses_match_oldest_reader() {
        let node = test_node();
        let log = Arc::new(Mutex::new(Vec::new()));
        let bodies = [body_bytes(0, 12), body_bytes(100, 30), body_bytes(7, 3)];

        // All three responses in one stream, cut at awkward points with
        // would-blocks in between.
        let mut wire = Vec::new();
        for body in &bodies {
            wire.extend(response(body));
        }
        let mut mock = MockTransport::new();
        for (i, chunk) in wire.chunks(7).enumerate() {
            mock.push_read(Bytes::copy_from_slice(chunk));
            if i % 2 == 1 {
                mock.push_would_block();
            }
        }

        let mut pipe = Pipeline::new(Connection::new(1, mock));
        let mut handlers = Vec::new();
        for tag in 0..3 {
            let (cmd, handler) = tagged(&node, tag, &log);
            pipe.enqueue(cmd);
            handlers.push(handler);
        }

        let mut out = Vec::new();
        pipe.pump_writer(&mut out);
        assert!(out.is_empty());
        assert_eq!(pipe.readers(), 3);
        assert!(!pipe.has_writer());
        assert_eq!(pipe.desired_watch(), Some(Interest::READABLE));

        let mut events = 0;
        while pipe.readers() > 0 {
            pipe.on_readable(&mut out);
            events += 1;
            assert!(events < 100);
        }
        assert!(!pipe.is_broken());
        settle(out);

        assert_eq!(*log.lock(), vec![0, 1, 2]);
        for (handler, body) in handlers.iter().zip(&bodies) {
            assert_eq!(handler.bodies(), vec![body.clone()]);
        }
    }

    #[test]
    fn test_writer_blocks_then_continues() {
        let node = test_node();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mock = MockTransport::new();
        mock.push_write(MockWrite::Accept);
        mock.push_write(MockWrite::Block);

        let mut pipe = Pipeline::new(Connection::new(1, mock));
        let (first, _h1) = tagged(&node, 0, &log);
        let (second, _h2) = tagged(&node, 1, &log);
        pipe.enqueue(first);
        pipe.enqueue(second);

        let mut out = Vec::new();
        pipe.pump_writer(&mut out);
        assert_eq!(pipe.readers(), 1);
        assert!(pipe.has_writer());
        assert_eq!(
            pipe.desired_watch(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );

        pipe.on_writable(&mut out);
        assert_eq!(pipe.readers(), 2);
        assert!(!pipe.has_writer());
        assert!(out.is_empty());
    }

    #[test]
    fn test_auth_reply_routed_to_writer() {
        let node = Arc::new(
            Node::new("A1", vec!["127.0.0.1:3000".parse().unwrap()])
                .unwrap()
                .with_auth(AuthToken::new("admin", frame(MessageType::Admin, b"creds"))),
        );
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut mock = MockTransport::new();
        mock.push_would_block();
        let mut reply = vec![0u8; 16];
        reply[AUTH_RESULT_CODE_OFFSET] = 0;
        mock.push_read(frame(MessageType::Admin, &reply));
        let mut pipe = Pipeline::new(Connection::new(1, mock));

        let (cmd, _h) = tagged(&node, 0, &log);
        pipe.enqueue(cmd);
        let mut out = Vec::new();
        pipe.pump_writer(&mut out);
        // Waiting for the auth reply with no readers yet.
        assert!(pipe.has_writer());
        assert_eq!(pipe.readers(), 0);
        assert_eq!(pipe.desired_watch(), Some(Interest::READABLE));

        pipe.on_readable(&mut out);
        assert!(!pipe.has_writer());
        assert_eq!(pipe.readers(), 1);
        assert!(pipe.connection().is_authenticated());
    }

    #[test]
    fn test_idle_read_event_ignored_or_closes() {
        let mut pipe = Pipeline::new(Connection::new(1, MockTransport::new()));
        let mut out = Vec::new();
        assert_eq!(pipe.desired_watch(), Some(Interest::READABLE));
        pipe.on_readable(&mut out);
        assert!(!pipe.is_broken());

        let mut mock = MockTransport::new();
        mock.push_closed();
        let mut pipe = Pipeline::new(Connection::new(2, mock));
        pipe.on_readable(&mut out);
        assert!(pipe.is_broken());
        assert_eq!(pipe.desired_watch(), None);
        assert!(out.is_empty());
    }

    #[test]
    fn test_reader_failure_aborts_everything() {
        let node = test_node();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mock = MockTransport::new();
        mock.push_write(MockWrite::Accept);
        mock.push_write(MockWrite::Accept);
        mock.push_write(MockWrite::Block);
        mock.push_closed();
        let mut pipe = Pipeline::new(Connection::new(1, mock));

        let mut handlers = Vec::new();
        for tag in 0..4 {
            let (cmd, handler) = tagged(&node, tag, &log);
            pipe.enqueue(cmd);
            handlers.push(handler);
        }
        let mut out = Vec::new();
        pipe.pump_writer(&mut out);
        assert_eq!(pipe.readers(), 2);
        assert!(pipe.has_writer());

        pipe.on_readable(&mut out);
        assert!(pipe.is_broken());
        assert!(pipe.is_empty());

        let kinds: Vec<_> = out
            .iter()
            .map(|f| match f {
                Finished::Done(_) => "done",
                Finished::Failed(..) => "failed",
                Finished::Requeue(_) => "requeue",
            })
            .collect();
        assert_eq!(kinds, vec!["failed", "failed", "failed", "requeue"]);

        match &out[1] {
            Finished::Failed(_, err) => {
                assert_eq!(err.message(), "Pipeline connection aborted");
                assert!(err.is_retryable());
            }
            other => panic!("unexpected {:?}", other),
        }
        settle(out);
        // Readers and writer had bytes on the wire.
        assert!(handlers[0].last_error().unwrap().in_doubt());
        assert!(handlers[1].last_error().unwrap().in_doubt());
        assert!(!handlers[3].last_error().unwrap().in_doubt());
    }

    #[test]
    fn test_reader_timeout_aborts() {
        let node = test_node();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut pipe = Pipeline::new(Connection::new(1, MockTransport::new()));
        let (cmd, handler) = tagged(&node, 0, &log);
        pipe.enqueue(cmd);

        let mut out = Vec::new();
        pipe.pump_writer(&mut out);
        let deadline = pipe.next_deadline().unwrap();

        pipe.check_timeouts(deadline - Duration::from_millis(1), &mut out);
        assert!(out.is_empty());

        pipe.check_timeouts(deadline + Duration::from_millis(1), &mut out);
        assert!(pipe.is_broken());
        settle(out);
        assert_eq!(handler.last_error().unwrap().kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_waiting_reader_not_timed_out_behind_busy_head() {
        let node = test_node();
        let log = Arc::new(Mutex::new(Vec::new()));
        let policy = CommandPolicy {
            socket_timeout: Some(Duration::from_millis(100)),
            total_timeout: None,
            ..CommandPolicy::default()
        };

        let mut mock = MockTransport::new();
        mock.push_read(header_bytes(30));
        mock.push_read(body_bytes(0, 10));
        mock.push_would_block();
        let mut pipe = Pipeline::new(Connection::new(1, mock));

        let mut handlers = Vec::new();
        for tag in 0..2 {
            let (cmd, handler) = tagged(&node, tag, &log);
            pipe.enqueue(Box::new((*cmd).with_policy(policy.clone())));
            handlers.push(handler);
        }

        let start = Instant::now();
        let mut out = Vec::new();
        pipe.pump_writer(&mut out);
        assert_eq!(pipe.readers(), 2);
        pipe.on_readable(&mut out);
        assert_eq!(pipe.readers(), 2);

        // The head read bytes in this period and the second reader cannot
        // read before the head is done.
        pipe.check_timeouts(start + Duration::from_millis(150), &mut out);
        assert!(!pipe.is_broken());
        assert!(out.is_empty());

        pipe.conn.transport().push_read(body_bytes(10, 20));
        pipe.conn.transport().push_would_block();
        let before = Instant::now();
        pipe.on_readable(&mut out);
        assert_eq!(pipe.readers(), 1);
        // The new head gets a full socket period of its own.
        assert!(pipe.next_deadline().unwrap() >= before + Duration::from_millis(100));

        settle(out);
        assert_eq!(*log.lock(), vec![0]);
        assert_eq!(handlers[0].body(), body_bytes(0, 30));
        assert_eq!(handlers[1].errors(), 0);
    }

    #[test]
    fn test_queued_cancelled_and_expired() {
        let node = test_node();
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut mock = MockTransport::new();
        mock.push_write(MockWrite::Block);
        let mut pipe = Pipeline::new(Connection::new(1, mock));

        let (first, _h1) = tagged(&node, 0, &log);
        let (second, h2) = tagged(&node, 1, &log);
        let (third, h3) = tagged(&node, 2, &log);
        let cancel = second.cancel_token();
        let mut third = third;
        // Armed earlier than the writer's own deadline.
        third.arm_total(Instant::now() - Duration::from_millis(500));
        let third_deadline = third.total_deadline().unwrap();

        pipe.enqueue(first);
        pipe.enqueue(second);
        pipe.enqueue(third);

        let mut out = Vec::new();
        pipe.pump_writer(&mut out);
        assert!(pipe.has_writer());

        cancel.cancel();
        pipe.sweep_cancelled(&mut out);
        assert_eq!(out.len(), 1);

        pipe.check_timeouts(third_deadline, &mut out);
        assert_eq!(out.len(), 2);
        // The blocked writer itself is untouched.
        assert!(!pipe.is_broken());
        assert!(pipe.has_writer());

        settle(out);
        assert_eq!(h2.last_error().unwrap().kind(), ErrorKind::Cancelled);
        assert_eq!(h3.last_error().unwrap().kind(), ErrorKind::Timeout);
    }
}
