//! Retry Policy
//!
//! Consulted on every failure of an attempt. Only transport, TLS and
//! timeout errors are candidates; protocol, authentication and resource
//! errors describe problems another attempt would hit again.

use tokio::time::Instant;

use crate::command::handler::Command;
use crate::error::ClientError;

/// Decides whether a failed attempt is retried.
pub trait RetryPolicy: Send + Sync {
    fn should_retry(&self, cmd: &Command, err: &ClientError) -> bool;
}

/// Retries retryable errors while the command's retry budget and total
/// deadline allow.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, cmd: &Command, err: &ClientError) -> bool {
        err.is_retryable()
            && !cmd.is_cancelled()
            && cmd.iteration() < cmd.policy().max_retries
            && !cmd.total_expired(Instant::now())
    }
}

/// Never retries.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoRetry;

impl RetryPolicy for NoRetry {
    fn should_retry(&self, _cmd: &Command, _err: &ClientError) -> bool {
        false
    }
}
