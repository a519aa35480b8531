//! Re-exports common types for convenient usage.
//!
//! # Example
//! ```rust,no_run
//! use resilience_rs::prelude::*;
//! ```

pub use crate::error::{BreakerError, BulkheadError};
pub use crate::schedule::{ExponentialBackoff, FixedBackoff};
pub use crate::state::State;
pub use crate::{Bulkhead, CircuitBreaker, RateLimiter};
