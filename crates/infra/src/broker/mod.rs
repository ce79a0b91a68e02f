//! Broker adapters.
//!
//! The abstraction and the in-memory broker live in `flowbridge-messaging`;
//! this module adds the networked implementations.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsBroker;
