//! Retry logic
//!
//! Exponential backoff with jitter for the handshake and for re-opening the
//! notification stream.

mod backoff;

pub use backoff::{with_retry, IsRetryable, RetryConfig, RetryExhausted};
