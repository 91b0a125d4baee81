//! Event Module
//!
//! The loop adapter: threads that own connections, the queue that feeds
//! them commands from other threads, and the drivers that turn socket
//! readiness and timer expiry into state machine steps.
//!
//! ## Modules
//!
//! - `queue`: the mutex-guarded submission queue and its wakeup
//! - `event_loop`: one loop thread and the `LoopContext` it owns
//! - `driver`: per-connection tasks for plain and pipelined connections
//! - `loops`: the set of loops and round-robin selection
//!
//! ## Example
//!
//! ```no_run
//! use flashclient::cluster::Node;
//! use flashclient::command::Collector;
//! use flashclient::config::EngineConfig;
//! use flashclient::event::EventLoops;
//! use flashclient::protocol::{frame, MessageType};
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let loops = EventLoops::with_config(EngineConfig::default())?;
//! let node = Arc::new(Node::new("A1", vec!["127.0.0.1:3000".parse()?])?);
//!
//! let (collector, rx) = Collector::single();
//! loops.submit(loops.command(node, frame(MessageType::Message, b"get"), Box::new(collector)));
//! let response = rx.await??;
//! println!("{} bytes", response.body().len());
//! # Ok(())
//! # }
//! ```

mod driver;
pub mod event_loop;
pub mod loops;
pub mod queue;

pub use event_loop::{EventLoop, LoopContext};
pub use loops::EventLoops;
pub use queue::{Executable, Job, Rejected, SubmissionQueue};
