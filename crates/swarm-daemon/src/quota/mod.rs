//! Resource quota manager and crash-loop circuit breaker.

mod breaker;
mod limits;

pub use breaker::{BreakerOpen, CircuitBreaker};
pub use limits::{QuotaError, QuotaLimits, QuotaManager, ResourceUsage};
