//! Command execution with retries
//!
//! A [`Command`] knows how to talk to one node over one connection. The cluster
//! drives it: it selects a node through the command's [`Partition`], leases a
//! connection, runs the command and on failure decides whether another attempt is
//! allowed. Every failed attempt is kept in the error chain returned to the caller;
//! consecutive pool-full failures count as one.

use crate::cluster::Cluster;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::node::Node;
use crate::partition::Partition;
use crate::policy::BasePolicy;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::yield_now;
use tokio::time::{sleep, Instant};
use tracing::debug;

/// A single-partition command
#[async_trait]
pub trait Command: Send {
    /// Reads may be served by replicas and are never in doubt
    fn is_read(&self) -> bool;

    /// Routing state, advanced between attempts
    fn partition(&mut self) -> &mut Partition;

    /// Send the request and read the reply. Socket errors must be returned as is so
    /// the connection is discarded.
    async fn execute(&mut self, conn: &mut Connection) -> Result<()>;
}

/// Retry bookkeeping of one command execution
struct Attempts {
    is_read: bool,
    iteration: usize,
    commands_sent: usize,
    errors: Option<Error>,
}

impl Attempts {
    fn record(&mut self, e: Error, node: Option<&Arc<Node>>) {
        let mut e = e.with_iteration(self.iteration);
        if let Some(node) = node {
            e = e.with_node(node);
        }
        self.errors = Some(e.chain(self.errors.take()));
    }

    /// Record a lease failure. A run of pool-full failures collapses into the
    /// newest one, as these attempts never reached the server.
    fn record_pool_full(&mut self, e: Error, node: &Arc<Node>) {
        let repeated = self
            .errors
            .as_ref()
            .is_some_and(|head| head.code() == e.code() && head.message() == e.message());
        if repeated {
            if let Some(mut head) = self.errors.take() {
                self.errors = head.take_previous();
            }
        }
        self.record(e, Some(node));
    }

    /// Final error: `last` in front of every earlier attempt
    fn finish(mut self, last: Error) -> Error {
        last.with_iteration(self.iteration)
            .set_in_doubt(self.is_read, self.commands_sent)
            .chain(self.errors.take())
    }

    /// `fallback` in front of every attempt. Whether a write is in doubt is decided
    /// by the last attempt that failed.
    fn finish_last(mut self, fallback: Error) -> Error {
        let fallback = fallback.with_iteration(self.iteration);
        match self.errors.take() {
            Some(last) => {
                let last = last.set_in_doubt(self.is_read, self.commands_sent);
                let fallback = if last.in_doubt() {
                    fallback.set_in_doubt(self.is_read, self.commands_sent)
                } else {
                    fallback
                };
                fallback.chain(Some(last))
            }
            None => fallback,
        }
    }
}

impl Cluster {
    /// Run `command` until it succeeds, fails for good or runs out of retries or time
    pub async fn execute<C>(&self, command: &mut C, policy: &BasePolicy) -> Result<()>
    where
        C: Command + ?Sized,
    {
        let deadline = (!policy.total_timeout.is_zero()).then(|| Instant::now() + policy.total_timeout);
        let mut attempts = Attempts {
            is_read: command.is_read(),
            iteration: 0,
            commands_sent: 0,
            errors: None,
        };
        let hint = self.next_connection_hint();
        let mut retrying = false;

        loop {
            if retrying {
                if attempts.iteration > policy.max_retries {
                    return Err(attempts.finish_last(Error::MAX_RETRIES_EXCEEDED.err()));
                }
                let delay = retry_delay(policy, attempts.iteration);
                if !delay.is_zero() {
                    if let Some(deadline) = deadline {
                        if Instant::now() + delay > deadline {
                            return Err(attempts.finish_last(Error::TIMEOUT.err()));
                        }
                    }
                    sleep(delay).await;
                }
            }
            retrying = true;

            let remaining = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(attempts.finish_last(Error::TIMEOUT.err()));
                    }
                    Some(deadline - now)
                }
                None => None,
            };
            attempts.iteration += 1;

            let is_read = attempts.is_read;
            let node = match command.partition().get_node(self, is_read) {
                Ok(node) => node,
                Err(e) => {
                    debug!("Node selection failed for {}: {}", command.partition(), e);
                    attempts.record(e, None);
                    command.partition().prepare_retry(is_read, false);
                    continue;
                }
            };

            if let Err(e) = node.validate_error_count() {
                attempts.record(e, Some(&node));
                command.partition().prepare_retry(is_read, false);
                continue;
            }

            let attempt_timeout = policy.attempt_timeout(remaining);
            let connect_timeout = attempt_timeout.map_or(self.policy().timeout, |t| t.min(self.policy().timeout));
            let mut conn = match node.get_connection(connect_timeout, hint).await {
                Ok(conn) => conn,
                Err(e) => {
                    let pool_full = e.is(&Error::CONNECTION_POOL_EMPTY) || e.is(&Error::CONNECTION_POOL_EXHAUSTED);
                    if pool_full && policy.exit_fast_on_exhausted_connection_pool {
                        return Err(attempts.finish(e));
                    }
                    debug!("Node {}: {}", node, e);
                    if pool_full {
                        attempts.record_pool_full(e, &node);
                        // the command never reached the server
                        if deadline.is_some() {
                            attempts.iteration -= 1;
                        }
                        command.partition().prepare_retry(is_read, false);
                        // let the tasks holding connections run
                        yield_now().await;
                        continue;
                    }
                    node.incr_error_count();
                    attempts.record(e, Some(&node));
                    command.partition().prepare_retry(is_read, false);
                    continue;
                }
            };
            conn.set_timeout(attempt_timeout);

            attempts.commands_sent += 1;
            match command.execute(&mut conn).await {
                Ok(()) => {
                    node.put_connection(conn, hint);
                    return Ok(());
                }
                Err(e) => {
                    if e.is_network_error() {
                        node.close_connection(conn);
                        node.incr_error_count();
                    } else {
                        node.put_connection(conn, hint);
                        if !e.is_retriable() {
                            return Err(attempts.finish(e.with_node(&node)));
                        }
                    }

                    let is_client_timeout = e.is_client_timeout();
                    debug!(
                        "Attempt {} of {} on node {} failed: {}",
                        attempts.iteration,
                        command.partition(),
                        node,
                        e
                    );
                    attempts.record(e, Some(&node));
                    command.partition().prepare_retry(is_read, is_client_timeout);
                }
            }
        }
    }
}

/// Sleep before retry `iteration` (1-based) under `policy`
pub fn retry_delay(policy: &BasePolicy, iteration: usize) -> Duration {
    let exponent = iteration.saturating_sub(1).min(i32::MAX as usize) as i32;
    let factor = policy.sleep_multiplier.max(1.0).powi(exponent);
    Duration::try_from_secs_f64(policy.sleep_between_retries.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_grows_with_multiplier() {
        let policy = BasePolicy {
            sleep_between_retries: Duration::from_millis(10),
            sleep_multiplier: 2.0,
            ..BasePolicy::default()
        };
        assert_eq!(retry_delay(&policy, 1), Duration::from_millis(10));
        assert_eq!(retry_delay(&policy, 2), Duration::from_millis(20));
        assert_eq!(retry_delay(&policy, 4), Duration::from_millis(80));

        let flat = BasePolicy {
            sleep_between_retries: Duration::from_millis(10),
            sleep_multiplier: 0.5,
            ..BasePolicy::default()
        };
        assert_eq!(retry_delay(&flat, 3), Duration::from_millis(10));
    }
}
