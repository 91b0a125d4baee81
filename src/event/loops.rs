//! Event Loop Set
//!
//! Owns the engine's loop threads. Commands are spread over the loops
//! round-robin; a command stays on the loop it was submitted to for every
//! retry.

use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::info;

use crate::cluster::Node;
use crate::command::{Command, DefaultRetryPolicy, ResponseHandler, RetryPolicy};
use crate::config::EngineConfig;
use crate::error::ClientResult;
use crate::event::event_loop::EventLoop;

/// A fixed set of event loops.
#[derive(Debug)]
pub struct EventLoops {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
    config: Arc<EngineConfig>,
}

impl EventLoops {
    /// Validates `config` and starts `config.event_loops` loop threads.
    pub fn new(config: EngineConfig, retry: Arc<dyn RetryPolicy>) -> ClientResult<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let loops = (0..config.event_loops)
            .map(|index| EventLoop::start(index, Arc::clone(&config), Arc::clone(&retry)))
            .collect::<ClientResult<Vec<_>>>()?;

        info!(
            loops = loops.len(),
            pipelining = config.pipelining,
            tls = config.tls.is_some(),
            "Event loops started"
        );

        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
            config,
        })
    }

    /// Starts the loops with [`DefaultRetryPolicy`].
    pub fn with_config(config: EngineConfig) -> ClientResult<Self> {
        Self::new(config, Arc::new(DefaultRetryPolicy))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// The next loop in round-robin order.
    pub fn next(&self) -> &EventLoop {
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[index]
    }

    pub fn get(&self, index: usize) -> Option<&EventLoop> {
        self.loops.get(index)
    }

    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &EventLoop> {
        self.loops.iter()
    }

    /// Builds a command carrying the configured default policy.
    pub fn command(
        &self,
        node: Arc<Node>,
        request: Bytes,
        handler: Box<dyn ResponseHandler>,
    ) -> Command {
        Command::new(node, request, handler).with_policy(self.config.policy.clone())
    }

    /// Submits `cmd` to the next loop.
    pub fn submit(&self, cmd: Command) -> bool {
        self.next().submit(cmd)
    }

    /// Closes every loop, waiting for in-flight commands.
    pub fn close(&self) {
        for event_loop in &self.loops {
            event_loop.close();
        }
    }
}
