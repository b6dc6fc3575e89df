// Copyright (c) 2025 Ronan LE MEILLAT, SCTG Development
// This file is part of the modbus-closed-loop project and is licensed under the
// SCTG Development Non-Commercial License v1.0 (see LICENSE.md for details).

//! Fixed-delay retry of async operations
//!
//! A [`RetryPolicy`] pairs a [`RetryStrategy`] with a classifier that tells
//! transient failures (worth another attempt) from fatal ones. The master
//! keeps one policy for connecting and one for request/response exchanges,
//! and rebuilds both whenever its options change.

use std::future::Future;
use std::io;
use std::time::Duration;

use log::{debug, warn};

use crate::config::ConnectionOptions;
use crate::error::ModbusError;

/// Decides whether a failed attempt may be retried
pub type Classifier = fn(&ModbusError) -> bool;

/// Connect failures worth retrying: refused, reset, unreachable, timed out.
pub fn is_retryable_connect_error(err: &ModbusError) -> bool {
    err.is_transient()
}

/// Request failures worth retrying.
///
/// Exception responses and framing errors are answers from the device and
/// are never retried. Undecodable data is treated the same way.
pub fn is_retryable_request_error(err: &ModbusError) -> bool {
    match err {
        ModbusError::Io { source } => source.kind() != io::ErrorKind::InvalidData,
        ModbusError::Timeout { .. } => true,
        _ => false,
    }
}

/// How many times and how often an operation is attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryStrategy {
    /// Exactly one attempt
    NoRetry,
    /// One attempt plus up to `retries` more, `delay` apart
    Fixed { retries: u32, delay: Duration },
}

#[derive(Clone)]
pub struct RetryPolicy {
    strategy: RetryStrategy,
    classifier: Classifier,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl RetryPolicy {
    pub fn no_retry(classifier: Classifier) -> Self {
        Self {
            strategy: RetryStrategy::NoRetry,
            classifier,
        }
    }

    pub fn fixed(retries: u32, delay: Duration, classifier: Classifier) -> Self {
        Self {
            strategy: RetryStrategy::Fixed { retries, delay },
            classifier,
        }
    }

    /// Policy for `options.number_of_retries`, no-retry when it is zero
    pub fn from_options(options: &ConnectionOptions, classifier: Classifier) -> Self {
        if options.number_of_retries == 0 {
            Self::no_retry(classifier)
        } else {
            Self::fixed(options.number_of_retries, options.retry_delay(), classifier)
        }
    }

    pub fn strategy(&self) -> RetryStrategy {
        self.strategy
    }

    /// Total attempts including the first one
    pub fn max_attempts(&self) -> u32 {
        match self.strategy {
            RetryStrategy::NoRetry => 1,
            RetryStrategy::Fixed { retries, .. } => retries.saturating_add(1),
        }
    }

    /// Run `attempt` under this policy.
    ///
    /// Each transient failure is logged before the delay. Fatal failures are
    /// returned unchanged; a transient failure on the last attempt is wrapped
    /// in [`ModbusError::RetriesExhausted`] with the number of attempts made.
    pub async fn execute<T, F, Fut>(&self, operation: &str, mut attempt: F) -> Result<T, ModbusError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ModbusError>>,
    {
        let (max_attempts, delay) = match self.strategy {
            RetryStrategy::NoRetry => {
                return attempt()
                    .await
                    .map_err(|err| self.give_up(operation, 1, err));
            }
            RetryStrategy::Fixed { retries, delay } => (retries.saturating_add(1), delay),
        };

        let mut attempts = 1;
        loop {
            match attempt().await {
                Ok(value) => {
                    if attempts > 1 {
                        debug!("{} succeeded on attempt {}", operation, attempts);
                    }
                    return Ok(value);
                }
                Err(err) if attempts >= max_attempts || !(self.classifier)(&err) => {
                    return Err(self.give_up(operation, attempts, err));
                }
                Err(err) => {
                    warn!(
                        "{} attempt {}/{} failed: {}. Retrying in {:?}",
                        operation, attempts, max_attempts, err, delay
                    );
                    tokio::time::sleep(delay).await;
                    attempts += 1;
                }
            }
        }
    }

    fn give_up(&self, operation: &str, attempts: u32, err: ModbusError) -> ModbusError {
        if (self.classifier)(&err) {
            warn!(
                "{} failed after {} attempt(s): {}",
                operation, attempts, err
            );
            ModbusError::RetriesExhausted {
                operation: operation.to_string(),
                attempts,
                source: Box::new(err),
            }
        } else {
            err
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Instant;
    use tokio_modbus::ExceptionCode;

    fn refused() -> ModbusError {
        ModbusError::from(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    #[test]
    fn test_from_options_selects_strategy() {
        let mut options = ConnectionOptions::default();
        options.number_of_retries = 0;
        let policy = RetryPolicy::from_options(&options, is_retryable_connect_error);
        assert_eq!(policy.strategy(), RetryStrategy::NoRetry);
        assert_eq!(policy.max_attempts(), 1);

        options.number_of_retries = 3;
        options.retry_delay_ms = 200;
        let policy = RetryPolicy::from_options(&options, is_retryable_connect_error);
        assert_eq!(
            policy.strategy(),
            RetryStrategy::Fixed {
                retries: 3,
                delay: Duration::from_millis(200)
            }
        );
        assert_eq!(policy.max_attempts(), 4);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_all_attempts() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(20), is_retryable_connect_error);
        let calls = Arc::new(AtomicU32::new(0));

        let started = Instant::now();
        let result: Result<(), ModbusError> = policy
            .execute("connect", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(refused())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= Duration::from_millis(60));
        match result {
            Err(ModbusError::RetriesExhausted { attempts, .. }) => assert_eq!(attempts, 4),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fatal_failure_is_not_retried() {
        let policy = RetryPolicy::fixed(5, Duration::from_millis(10), is_retryable_request_error);
        let calls = Arc::new(AtomicU32::new(0));

        let result: Result<(), ModbusError> = policy
            .execute("read_holding_registers", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(ModbusError::Protocol(ExceptionCode::IllegalDataAddress))
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result,
            Err(ModbusError::Protocol(ExceptionCode::IllegalDataAddress))
        ));
    }

    #[tokio::test]
    async fn test_success_after_transient_failures() {
        let policy = RetryPolicy::fixed(3, Duration::from_millis(5), is_retryable_request_error);
        let calls = Arc::new(AtomicU32::new(0));

        let result = policy
            .execute("read_coils", || {
                let calls = calls.clone();
                async move {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    if n < 3 {
                        Err(ModbusError::Timeout {
                            operation: "read_coils".to_string(),
                            timeout: Duration::from_millis(50),
                        })
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_no_retry_policy_makes_one_attempt() {
        let policy = RetryPolicy::no_retry(is_retryable_connect_error);
        let calls = Arc::new(AtomicU32::new(0));

        let started = Instant::now();
        let result: Result<(), ModbusError> = policy
            .execute("connect", || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err(refused())
                }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(started.elapsed() < Duration::from_millis(500));
        assert!(matches!(
            result,
            Err(ModbusError::RetriesExhausted { attempts: 1, .. })
        ));
    }

    #[test]
    fn test_request_classifier() {
        assert!(is_retryable_request_error(&refused()));
        assert!(!is_retryable_request_error(&ModbusError::from(io::Error::new(
            io::ErrorKind::InvalidData,
            "bad frame"
        ))));
        assert!(!is_retryable_request_error(&ModbusError::NotConnected));
        assert!(!is_retryable_request_error(&ModbusError::Transport {
            reason: "transaction id mismatch".to_string()
        }));
    }
}
