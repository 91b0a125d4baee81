//! Command Module
//!
//! A command is one request on its way through the engine. This module holds
//! the command itself, its state machine and the step functions that move it
//! forward over a connection.
//!
//! ## Modules
//!
//! - `state`: the `CommandState` enum and its transition rules
//! - `buffer`: the inline-then-heap read buffer
//! - `handler`: `Command`, the `ResponseHandler` trait and `Collector`
//! - `exec`: non-blocking write/read steps and `dispatch`
//! - `retry`: the `RetryPolicy` trait
//!
//! ## Example
//!
//! ```
//! use bytes::Bytes;
//! use flashclient::cluster::Node;
//! use flashclient::command::{Collector, Command};
//! use flashclient::protocol::{frame, MessageType};
//! use std::sync::Arc;
//!
//! let node = Arc::new(Node::new("A1", vec!["127.0.0.1:3000".parse().unwrap()]).unwrap());
//! let (collector, _rx) = Collector::single();
//! let cmd = Command::new(node, frame(MessageType::Message, b"request"), Box::new(collector));
//! assert_eq!(cmd.iteration(), 0);
//! ```

pub mod buffer;
pub mod exec;
pub mod handler;
pub mod retry;
pub mod state;

pub use buffer::{ReadBuffer, INLINE_READ_CAPACITY};
pub use exec::{dispatch, Progress, Step};
pub use handler::{Collector, Command, Response, ResponseHandler};
pub use retry::{DefaultRetryPolicy, NoRetry, RetryPolicy};
pub use state::CommandState;
