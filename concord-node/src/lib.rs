//! The runnable ConcordKV node.
//!
//! Provides the in-memory implementations of the core's storage contracts
//! ([`store::MemKv`], [`store::MemLog`]), the HTTP transport implementing
//! the core's network contracts ([`net::HttpNetwork`]), the node's HTTP API
//! surface ([`http`]), and the multi-DC coordination wiring
//! ([`coordination`]).

pub mod coordination;
pub mod http;
pub mod net;
pub mod store;

pub use store::KvCommand;
pub use store::KvResponse;
pub use store::MemKv;
pub use store::MemLog;
