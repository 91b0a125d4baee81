//! Event Loop
//!
//! One OS thread running a current-thread tokio runtime inside a `LocalSet`.
//! Everything a loop owns (pools, pipelines, in-flight commands) lives on
//! that thread in a [`LoopContext`] and is reached through `Rc`/`RefCell`,
//! never shared with another thread.
//!
//! ## Thread Model
//!
//! ```text
//!   application threads                    loop thread "event-loop-N"
//!   ───────────────────                    ──────────────────────────
//!   submit(cmd) ─┐                         ┌─► wakeup
//!   execute(f) ──┼──► SubmissionQueue ─────┤   drain `len` jobs:
//!   close() ─────┘    (mutex + notify)     │     Command  → LoopContext::begin
//!                                          │     Execute  → f(&LoopContext)
//!                                          │     Stop     → shutdown
//!                                          └── spawn_local drivers per
//!                                              connection / pipeline
//! ```
//!
//! ## Shutdown
//!
//! `close()` stops intake, then the loop closes its idle connections and
//! keeps running until every in-flight command has reached its callback.
//! Nothing in flight is cancelled. Pipeline drivers are waited for so every
//! socket they opened is counted closed.
//!
//! ## Idle Sweeper
//!
//! With `max_socket_idle` set, a task on the loop closes pooled connections
//! idle past the limit every half period. Idle pipelines time themselves
//! out in their own driver.

use parking_lot::Mutex;
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tokio::runtime::Builder;
use tokio::sync::Notify;
use tokio::task::LocalSet;
use tokio::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::Node;
use crate::command::{Command, RetryPolicy};
use crate::config::EngineConfig;
use crate::connection::{Connection, ConnectionPool, LoopStats, Socket};
use crate::error::{ClientError, ClientResult};
use crate::event::driver::{self, PipeHandle};
use crate::event::queue::{Job, SubmissionQueue};

/// Handle to one event loop thread.
pub struct EventLoop {
    index: usize,
    queue: Arc<SubmissionQueue>,
    stats: Arc<LoopStats>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl EventLoop {
    /// Starts loop `index` on a new thread.
    pub fn start(
        index: usize,
        config: Arc<EngineConfig>,
        retry: Arc<dyn RetryPolicy>,
    ) -> ClientResult<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| ClientError::io("Failed to build event loop runtime", &e))?;

        let queue = Arc::new(SubmissionQueue::new(config.max_queue_size));
        let stats = Arc::new(LoopStats::new());

        let thread = {
            let queue = Arc::clone(&queue);
            let stats = Arc::clone(&stats);
            thread::Builder::new()
                .name(format!("event-loop-{}", index))
                .spawn(move || {
                    let local = LocalSet::new();
                    local.block_on(&runtime, run(index, queue, stats, config, retry));
                })
                .map_err(|e| ClientError::io("Failed to spawn event loop thread", &e))?
        };

        info!(index, "Event loop started");

        Ok(Self {
            index,
            queue,
            stats,
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn stats(&self) -> &Arc<LoopStats> {
        &self.stats
    }

    /// Jobs waiting for the next wakeup.
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Runs `f` exactly once on the loop thread. Returns false if the loop
    /// refused it (closed or queue full), in which case `f` never runs.
    pub fn execute<F>(&self, f: F) -> bool
    where
        F: FnOnce(&LoopContext) + Send + 'static,
    {
        match self.queue.push(Job::Execute(Box::new(f))) {
            Ok(()) => true,
            Err(rejected) => {
                warn!(index = self.index, error = %rejected.error, "Executable rejected");
                false
            }
        }
    }

    /// Hands `cmd` to the loop. On rejection the command's handler receives
    /// the error on the calling thread and false is returned.
    pub fn submit(&self, cmd: Command) -> bool {
        match self.queue.push(Job::Command(Box::new(cmd))) {
            Ok(()) => true,
            Err(rejected) => {
                debug!(index = self.index, error = %rejected.error, "Command rejected");
                if let Job::Command(cmd) = rejected.job {
                    cmd.fail(rejected.error);
                }
                false
            }
        }
    }

    /// Stops intake, waits for in-flight commands to finish and joins the
    /// thread. Safe to call more than once.
    pub fn close(&self) {
        self.queue.push_stop();

        let Some(handle) = self.thread.lock().take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            warn!(index = self.index, "Event loop cannot join itself");
            return;
        }
        if handle.join().is_err() {
            error!(index = self.index, "Event loop thread panicked");
        }
        info!(index = self.index, "Event loop closed");
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoop")
            .field("index", &self.index)
            .field("queued", &self.queue.len())
            .finish()
    }
}

/// The loop thread's main task.
async fn run(
    index: usize,
    queue: Arc<SubmissionQueue>,
    stats: Arc<LoopStats>,
    config: Arc<EngineConfig>,
    retry: Arc<dyn RetryPolicy>,
) {
    let ctx = LoopContext::new(index, config, retry, stats);
    ctx.start_sweeper();
    let mut stopping = false;

    while !stopping {
        queue.notified().await;

        // Only what was queued at wakeup time; later jobs get the next one.
        let n = queue.len();
        for _ in 0..n {
            match queue.pop() {
                Some(Job::Command(cmd)) => ctx.begin(cmd),
                Some(Job::Execute(f)) => f(ctx.as_ref()),
                Some(Job::Stop) => stopping = true,
                None => break,
            }
        }
    }

    ctx.shutdown().await;
    info!(index, "Event loop stopped");
}

/// Connections a loop holds for one node.
pub(crate) struct NodeConnections {
    pub(crate) pool: ConnectionPool<Connection<Socket>>,
    pub(crate) pipes: Vec<Rc<PipeHandle>>,
}

/// State owned by one loop thread.
pub struct LoopContext {
    me: Weak<LoopContext>,
    index: usize,
    config: Arc<EngineConfig>,
    retry: Arc<dyn RetryPolicy>,
    stats: Arc<LoopStats>,
    nodes: RefCell<HashMap<String, NodeConnections>>,
    in_flight: Cell<usize>,
    closing: Cell<bool>,
    drained: Notify,
    retired: Notify,
    sweeper: CancellationToken,
    next_conn_id: Cell<u64>,
}

impl LoopContext {
    fn new(
        index: usize,
        config: Arc<EngineConfig>,
        retry: Arc<dyn RetryPolicy>,
        stats: Arc<LoopStats>,
    ) -> Rc<Self> {
        Rc::new_cyclic(|me| Self {
            me: me.clone(),
            index,
            config,
            retry,
            stats,
            nodes: RefCell::new(HashMap::new()),
            in_flight: Cell::new(0),
            closing: Cell::new(false),
            drained: Notify::new(),
            retired: Notify::new(),
            sweeper: CancellationToken::new(),
            next_conn_id: Cell::new(1),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &LoopStats {
        &self.stats
    }

    /// Commands accepted by this loop that have not reached their callback.
    pub fn in_flight(&self) -> usize {
        self.in_flight.get()
    }

    pub fn is_closing(&self) -> bool {
        self.closing.get()
    }

    /// Starts a command from code already running on the loop thread.
    pub fn submit(&self, cmd: Command) {
        self.begin(Box::new(cmd));
    }

    /// Idle pooled connections held for `node`.
    pub fn idle_connections(&self, node: &str) -> usize {
        self.nodes
            .borrow()
            .get(node)
            .map_or(0, |conns| conns.pool.idle())
    }

    /// Closes the idle connections this loop holds for a node that left the
    /// cluster. In-use connections close as their commands finish.
    pub fn remove_node(&self, name: &str) -> usize {
        let (pooled, pipes) = {
            let mut nodes = self.nodes.borrow_mut();
            let Some(conns) = nodes.get_mut(name) else {
                return 0;
            };
            let pooled = conns.pool.close_idle();
            let mut pipes = 0;
            for pipe in conns.pipes.iter().filter(|p| p.is_idle()) {
                // The pipeline's driver counts the close when it exits.
                pipe.close();
                pipes += 1;
            }
            (pooled, pipes)
        };
        for _ in 0..pooled {
            self.stats.connection_closed();
        }
        debug!(loop_index = self.index, node = name, pooled, pipes, "Node connections closed");
        pooled + pipes
    }

    /// Open pipelined connections held for `node`.
    pub fn pipelines(&self, node: &str) -> usize {
        self.nodes.borrow().get(node).map_or(0, |conns| {
            conns.pipes.iter().filter(|pipe| !pipe.is_closed()).count()
        })
    }

    /// Closes every idle connection on the loop.
    pub fn close_idle(&self) -> usize {
        let names: Vec<String> = self.nodes.borrow().keys().cloned().collect();
        names.iter().map(|name| self.remove_node(name)).sum()
    }

    /// Closes pooled connections idle longer than `max_socket_idle`.
    pub fn close_expired(&self) -> usize {
        let closed: usize = self
            .nodes
            .borrow_mut()
            .values_mut()
            .map(|conns| conns.pool.close_expired())
            .sum();
        for _ in 0..closed {
            self.stats.connection_closed();
        }
        if closed > 0 {
            debug!(loop_index = self.index, closed, "Expired idle connections closed");
        }
        closed
    }

    fn start_sweeper(&self) {
        let Some(limit) = self.config.max_socket_idle else {
            return;
        };
        let period = (limit / 2).max(Duration::from_millis(10));
        let ctx = self.rc();

        tokio::task::spawn_local(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(period) => {}
                    _ = ctx.sweeper.cancelled() => {
                        debug!(loop_index = ctx.index, "Idle sweeper stopped");
                        return;
                    }
                }
                ctx.close_expired();
            }
        });
    }

    pub(crate) fn rc(&self) -> Rc<LoopContext> {
        // The context is always owned by the `Rc` built in `new`.
        match self.me.upgrade() {
            Some(ctx) => ctx,
            None => unreachable!("loop context used after drop"),
        }
    }

    /// Called by a pipeline driver once it left the node table.
    pub(crate) fn pipe_retired(&self) {
        self.retired.notify_one();
    }

    pub(crate) fn next_conn_id(&self) -> u64 {
        let id = self.next_conn_id.get();
        self.next_conn_id.set(id + 1);
        id
    }

    /// Runs `f` on the connections held for `node`. `f` must not call back
    /// into the context's node table.
    pub(crate) fn with_node<R>(&self, node: &Node, f: impl FnOnce(&mut NodeConnections) -> R) -> R {
        let mut nodes = self.nodes.borrow_mut();
        let conns = nodes
            .entry(node.name().to_string())
            .or_insert_with(|| NodeConnections {
                pool: ConnectionPool::new(
                    self.config.max_conns_per_node,
                    self.config.max_idle_per_node,
                    self.config.max_socket_idle,
                ),
                pipes: Vec::new(),
            });
        f(conns)
    }

    /// First contact with a submitted command on the loop thread: the total
    /// deadline starts here.
    pub(crate) fn begin(&self, mut cmd: Box<Command>) {
        cmd.arm_total(Instant::now());
        self.stats.command_submitted();
        self.in_flight.set(self.in_flight.get() + 1);
        self.attempt(cmd);
    }

    /// Starts one attempt: on a pipeline when pipelining is on, otherwise
    /// on a pooled or new plain connection.
    pub(crate) fn attempt(&self, cmd: Box<Command>) {
        if cmd.is_cancelled() {
            self.finish(cmd, Err(ClientError::cancelled()));
            return;
        }
        if self.config.pipelining {
            driver::route_pipelined(self, cmd);
        } else {
            tokio::task::spawn_local(driver::run_plain(self.rc(), cmd));
        }
    }

    /// Ends an attempt. Failures go through the retry policy; anything not
    /// retried reaches the command's callback.
    pub(crate) fn finish(&self, mut cmd: Box<Command>, result: ClientResult<()>) {
        let err = match result {
            Ok(()) => {
                self.stats.command_completed();
                cmd.complete();
                self.command_done();
                return;
            }
            Err(err) => err,
        };

        if self.retry.should_retry(&cmd, &err) {
            cmd.prepare_retry();
            self.stats.command_retried();
            debug!(
                command = cmd.id(),
                node = %cmd.node().name(),
                iteration = cmd.iteration(),
                error = %err,
                "Retrying command"
            );

            let pause = cmd.policy().sleep_between_retries;
            if pause.is_zero() {
                self.attempt(cmd);
            } else {
                let ctx = self.rc();
                tokio::task::spawn_local(async move {
                    tokio::time::sleep(pause).await;
                    ctx.attempt(cmd);
                });
            }
            return;
        }

        self.stats.command_failed(err.is_timeout());
        cmd.fail(err);
        self.command_done();
    }

    fn command_done(&self) {
        let left = self.in_flight.get().saturating_sub(1);
        self.in_flight.set(left);
        if left == 0 {
            self.drained.notify_one();
        }
    }

    async fn shutdown(&self) {
        self.closing.set(true);
        self.sweeper.cancel();
        let closed = self.close_idle();
        debug!(loop_index = self.index, closed, in_flight = self.in_flight(), "Event loop draining");

        while self.in_flight.get() > 0 {
            self.drained.notified().await;
        }

        // Pipelines opened by retries during the drain.
        for conns in self.nodes.borrow_mut().values_mut() {
            for _ in 0..conns.pool.close_idle() {
                self.stats.connection_closed();
            }
            for pipe in &conns.pipes {
                pipe.close();
            }
        }

        loop {
            let open: usize = self.nodes.borrow().values().map(|conns| conns.pipes.len()).sum();
            if open == 0 {
                break;
            }
            self.retired.notified().await;
        }
        self.nodes.borrow_mut().clear();
    }
}

impl std::fmt::Debug for LoopContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoopContext")
            .field("index", &self.index)
            .field("in_flight", &self.in_flight.get())
            .field("closing", &self.closing.get())
            .finish()
    }
}
