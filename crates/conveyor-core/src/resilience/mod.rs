/// Circuit breaker guarding primitive calls
pub mod circuit_breaker;

pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStatus, GuardedPrimitive,
};
