//! The topology-aware smart client: versioned shard cache, smart router
//! with pluggable load balancing and circuit breaking, and the shard-aware
//! connection pool.

pub mod balance;
pub mod breaker;
pub mod cache;
pub mod pool;
pub mod router;
