//! External-collaborator ports and resilience plumbing
//!
//! The concrete key/value store and event bus live outside this crate;
//! here are the ports they implement plus in-memory implementations used
//! by tests and single-node runs.

pub mod bus;
pub mod circuit_breaker;
pub mod kv;
pub mod rate_limit;

pub use bus::{BusError, BusMessage, EventBus, InMemoryEventBus};
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, GuardError};
pub use kv::{GuardedKvStore, InMemoryKvStore, KeyValueStore, KvError};
pub use rate_limit::{FloodControl, FloodKind, RateDecision, RateLimitSettings, RateLimiter};
