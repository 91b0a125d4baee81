//! Connection Drivers
//!
//! The glue between readiness and the state machine. A driver waits on the
//! socket for whatever the connection currently watches, on the command's
//! armed deadline and on its cancellation token, then calls back into
//! `dispatch` (plain) or the `Pipeline` (pipelined).
//!
//! ```text
//!   run_plain:     acquire/open ─► dispatch ─┬─ Pending ─► select! ─┐
//!                                   ▲        │   ready │ deadline │ cancel
//!                                   └────────┼─────────┘          │
//!                                            ├─ Done ─► release to pool
//!                                            └─ Failed / timeout / cancel
//!                                                 ─► drop connection
//!
//!   run_pipeline:  open ─► loop { take incoming, pump writer,
//!                                 select! ready │ deadline │ kick }
//!                          ─► exit when broken, closed, or idle past the
//!                             node's idle count or idle time
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;
use std::sync::Arc;
use tokio::io::{Interest, Ready};
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, trace};

use crate::cluster::Node;
use crate::command::{dispatch, Command, CommandState, Progress};
use crate::connection::{connect, Connection, Finished, Pipeline, PoolError, Release, Socket};
use crate::error::{ClientError, ClientResult, TimeoutKind};
use crate::event::event_loop::LoopContext;

enum Wake {
    Ready,
    Io(io::Error),
    Deadline,
    Cancelled,
}

enum PipeWake {
    Kick,
    Deadline,
    Ready(Ready),
    Io(io::Error),
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn ready_opt(conn: &Connection<Socket>, interest: Option<Interest>) -> io::Result<Ready> {
    match interest {
        Some(interest) => conn.ready(interest).await,
        None => std::future::pending().await,
    }
}

/// Runs one attempt of `cmd` on a plain connection and reports the outcome
/// to the loop.
pub(crate) async fn run_plain(ctx: Rc<LoopContext>, mut cmd: Box<Command>) {
    let node = Arc::clone(cmd.node());

    let stats = ctx.stats();
    let acquired = ctx.with_node(&node, |conns| {
        conns.pool.acquire(|stale| {
            debug!(node = %node.name(), conn = stale.id(), "Idle connection closed");
            stats.connection_closed();
        })
    });

    let mut conn = match acquired {
        Ok(Some(conn)) => {
            trace!(command = cmd.id(), conn = conn.id(), "Reusing pooled connection");
            conn
        }
        Ok(None) => match open(&ctx, &mut cmd).await {
            Ok(conn) => conn,
            Err(err) => {
                ctx.with_node(&node, |conns| conns.pool.discard());
                ctx.finish(cmd, Err(err));
                return;
            }
        },
        Err(PoolError::Exhausted { max }) => {
            let err = ClientError::no_more_connections(node.name(), max);
            ctx.finish(cmd, Err(err));
            return;
        }
    };

    if cmd.state() == CommandState::Queued {
        cmd.start_attempt(Instant::now());
    }
    cmd.begin_session(&conn);

    match drive(&mut cmd, &mut conn).await {
        Ok(()) => {
            cmd.stop_timers();
            conn.touch();
            let closing = ctx.is_closing();
            let released = ctx.with_node(&node, |conns| {
                if closing {
                    conns.pool.discard();
                    Release::Closed
                } else {
                    conns.pool.release(conn)
                }
            });
            if released == Release::Closed {
                ctx.stats().connection_closed();
                debug!(node = %node.name(), "Connection closed instead of pooled");
            }
            ctx.finish(cmd, Ok(()));
        }
        Err(err) => {
            cmd.stop_timers();
            drop(conn);
            ctx.with_node(&node, |conns| conns.pool.discard());
            ctx.stats().connection_closed();
            ctx.finish(cmd, Err(err));
        }
    }
}

/// Opens a connection for `cmd`, bounded by its deadline and cancellation.
async fn open(ctx: &LoopContext, cmd: &mut Command) -> ClientResult<Connection<Socket>> {
    cmd.set_state(CommandState::Connecting);
    cmd.start_attempt(Instant::now());

    let node = Arc::clone(cmd.node());
    let deadline = cmd.deadline();
    let opened = tokio::select! {
        biased;
        _ = cmd.cancellation().cancelled() => Err(Wake::Cancelled),
        _ = sleep_until_opt(deadline) => Err(Wake::Deadline),
        result = connect::open(&node, ctx.config()) => Ok(result),
    };

    match opened {
        Ok(Ok(socket)) => {
            ctx.stats().connection_opened();
            node.reset_failures();
            let conn = Connection::new(ctx.next_conn_id(), socket);
            debug!(node = %node.name(), conn = conn.id(), "Connection opened");
            Ok(conn)
        }
        Ok(Err(err)) => {
            ctx.stats().connect_failed();
            node.record_failure();
            Err(err)
        }
        Err(Wake::Cancelled) => Err(ClientError::cancelled()),
        Err(_) => {
            let kind = cmd
                .check_deadline(Instant::now())
                .unwrap_or(TimeoutKind::Socket);
            Err(ClientError::timeout(kind))
        }
    }
}

/// Dispatches `cmd` on `conn` until it completes, waiting for readiness in
/// between.
async fn drive(cmd: &mut Command, conn: &mut Connection<Socket>) -> ClientResult<()> {
    loop {
        match dispatch(cmd, conn) {
            Progress::Done => return Ok(()),
            Progress::Failed(err) => return Err(err),
            Progress::Pending => {}
        }

        let interest = conn.watching().unwrap_or(Interest::READABLE);
        loop {
            let deadline = cmd.deadline();
            let wake = tokio::select! {
                biased;
                _ = cmd.cancellation().cancelled() => Wake::Cancelled,
                _ = sleep_until_opt(deadline) => Wake::Deadline,
                ready = conn.ready(interest) => match ready {
                    Ok(_) => Wake::Ready,
                    Err(e) => Wake::Io(e),
                },
            };

            match wake {
                Wake::Ready => break,
                Wake::Io(e) => return Err(ClientError::io("Socket wait failed", &e)),
                Wake::Cancelled => {
                    debug!(command = cmd.id(), conn = conn.id(), "Command cancelled, closing connection");
                    return Err(ClientError::cancelled());
                }
                Wake::Deadline => {
                    if let Some(kind) = cmd.check_deadline(Instant::now()) {
                        debug!(command = cmd.id(), conn = conn.id(), ?kind, "Command timed out");
                        return Err(ClientError::timeout(kind));
                    }
                }
            }
        }
    }
}

/// The loop's side of one pipelined connection.
#[derive(Debug, Default)]
pub(crate) struct PipeHandle {
    incoming: RefCell<VecDeque<Box<Command>>>,
    kick: Notify,
    load: Cell<usize>,
    closed: Cell<bool>,
    connected: Cell<bool>,
    writing: Cell<bool>,
}

impl PipeHandle {
    fn push(&self, cmd: Box<Command>) {
        self.load.set(self.load.get() + 1);
        self.incoming.borrow_mut().push_back(cmd);
        self.kick.notify_one();
    }

    fn take_incoming(&self) -> Vec<Box<Command>> {
        self.incoming.borrow_mut().drain(..).collect()
    }

    fn finished(&self) {
        self.load.set(self.load.get().saturating_sub(1));
    }

    /// Commands handed to the pipeline that have not left it.
    pub(crate) fn load(&self) -> usize {
        self.load.get()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.load.get() == 0
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.get()
    }

    /// Connected, open and with nothing being written or waiting to be.
    fn accepts_writer(&self) -> bool {
        self.connected.get()
            && !self.closed.get()
            && !self.writing.get()
            && self.incoming.borrow().is_empty()
    }

    /// Asks the pipeline to exit once it has no more work.
    pub(crate) fn close(&self) {
        self.closed.set(true);
        self.kick.notify_one();
    }
}

/// Hands `cmd` to a pipeline for its node: one with no writer if there is
/// one, a new one while below the connection limit, else the least loaded.
pub(crate) fn route_pipelined(ctx: &LoopContext, cmd: Box<Command>) {
    let node = Arc::clone(cmd.node());
    let max = ctx.config().max_conns_per_node;

    let (pipe, created) = ctx.with_node(&node, |conns| {
        conns.pipes.retain(|pipe| !pipe.is_closed());

        if let Some(pipe) = conns.pipes.iter().find(|pipe| pipe.accepts_writer()) {
            return (Rc::clone(pipe), false);
        }
        if conns.pipes.len() < max {
            let pipe = Rc::new(PipeHandle::default());
            conns.pipes.push(Rc::clone(&pipe));
            return (pipe, true);
        }
        match conns.pipes.iter().min_by_key(|pipe| pipe.load()) {
            Some(pipe) => (Rc::clone(pipe), false),
            None => {
                let pipe = Rc::new(PipeHandle::default());
                conns.pipes.push(Rc::clone(&pipe));
                (pipe, true)
            }
        }
    });

    trace!(command = cmd.id(), created, load = pipe.load(), "Command routed to pipeline");
    pipe.push(cmd);
    if created {
        tokio::task::spawn_local(run_pipeline(ctx.rc(), node, pipe));
    }
}

/// Opens a pipelined connection and runs it until it breaks or is closed.
async fn run_pipeline(ctx: Rc<LoopContext>, node: Arc<Node>, handle: Rc<PipeHandle>) {
    // The connect is bounded by the earliest total deadline waiting on it.
    let deadline = handle
        .incoming
        .borrow()
        .iter()
        .filter_map(|cmd| cmd.total_deadline())
        .min();

    let opened = tokio::select! {
        _ = sleep_until_opt(deadline) => Err(ClientError::timeout(TimeoutKind::Total)),
        result = connect::open(&node, ctx.config()) => result,
    };

    let socket = match opened {
        Ok(socket) => {
            ctx.stats().connection_opened();
            node.reset_failures();
            socket
        }
        Err(err) => {
            if !err.is_timeout() {
                ctx.stats().connect_failed();
                node.record_failure();
            }
            handle.closed.set(true);
            retire(&ctx, &node, &handle);
            for cmd in handle.take_incoming() {
                handle.finished();
                ctx.finish(cmd, Err(err.clone()));
            }
            return;
        }
    };

    let mut pipe = Pipeline::new(Connection::new(ctx.next_conn_id(), socket));
    handle.connected.set(true);
    debug!(node = %node.name(), conn = pipe.connection().id(), "Pipeline opened");
    let max_idle = ctx.config().max_idle_per_node;
    let idle_limit = ctx.config().max_socket_idle;
    let mut idle_since: Option<Instant> = None;
    let mut out = Vec::new();

    loop {
        for cmd in handle.take_incoming() {
            pipe.enqueue(cmd);
        }
        pipe.sweep_cancelled(&mut out);
        pipe.pump_writer(&mut out);
        settle(&ctx, &handle, &pipe, &mut out);

        if pipe.is_broken() || (handle.is_closed() && pipe.is_empty()) {
            break;
        }

        if pipe.is_empty() && handle.is_idle() {
            let since = *idle_since.get_or_insert_with(Instant::now);
            if idle_pipes(&ctx, &node) > max_idle {
                debug!(node = %node.name(), conn = pipe.connection().id(), max_idle, "Idle pipelines over limit");
                break;
            }
            if idle_limit.is_some_and(|limit| since.elapsed() >= limit) {
                debug!(node = %node.name(), conn = pipe.connection().id(), "Pipeline idle too long");
                break;
            }
        } else {
            idle_since = None;
        }

        handle.writing.set(pipe.has_writer() || pipe.queued() > 0);
        let interest = pipe.rewatch();
        let idle_deadline = idle_since.zip(idle_limit).map(|(since, limit)| since + limit);
        let deadline = pipe.next_deadline().or(idle_deadline);
        let wake = tokio::select! {
            biased;
            _ = handle.kick.notified() => PipeWake::Kick,
            _ = sleep_until_opt(deadline) => PipeWake::Deadline,
            ready = ready_opt(pipe.connection(), interest) => match ready {
                Ok(ready) => PipeWake::Ready(ready),
                Err(e) => PipeWake::Io(e),
            },
        };

        match wake {
            PipeWake::Kick => {}
            PipeWake::Deadline => pipe.check_timeouts(Instant::now(), &mut out),
            PipeWake::Ready(ready) => {
                if ready.is_readable() || ready.is_read_closed() {
                    pipe.on_readable(&mut out);
                }
                if ready.is_writable() && !pipe.is_broken() {
                    pipe.on_writable(&mut out);
                }
            }
            PipeWake::Io(e) => pipe.abort(None, ClientError::io("Socket wait failed", &e), &mut out),
        }
        settle(&ctx, &handle, &pipe, &mut out);
    }

    handle.closed.set(true);
    retire(&ctx, &node, &handle);
    ctx.stats().connection_closed();
    debug!(node = %node.name(), conn = pipe.connection().id(), broken = pipe.is_broken(), "Pipeline closed");

    // Anything that arrived after the last pass goes to another pipeline.
    for cmd in handle.take_incoming() {
        handle.finished();
        ctx.attempt(cmd);
    }
}

/// Reports finished commands to the loop. A broken pipeline is retired
/// first so retries land on another connection.
fn settle(ctx: &LoopContext, handle: &PipeHandle, pipe: &Pipeline<Socket>, out: &mut Vec<Finished>) {
    if out.is_empty() {
        return;
    }
    if pipe.is_broken() {
        handle.closed.set(true);
    }
    for finished in out.drain(..) {
        handle.finished();
        match finished {
            Finished::Done(cmd) => ctx.finish(cmd, Ok(())),
            Finished::Failed(cmd, err) => ctx.finish(cmd, Err(err)),
            Finished::Requeue(cmd) => ctx.attempt(cmd),
        }
    }
}

/// Open pipelines of `node` with nothing to do.
fn idle_pipes(ctx: &LoopContext, node: &Node) -> usize {
    ctx.with_node(node, |conns| {
        conns
            .pipes
            .iter()
            .filter(|pipe| pipe.is_idle() && !pipe.is_closed())
            .count()
    })
}

fn retire(ctx: &LoopContext, node: &Node, handle: &Rc<PipeHandle>) {
    ctx.with_node(node, |conns| conns.pipes.retain(|pipe| !Rc::ptr_eq(pipe, handle)));
    ctx.pipe_retired();
}
