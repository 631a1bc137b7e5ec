//! Broker-backed intake queues.
//!
//! The in-memory broker lives in `flashsale-events`; this module holds the
//! implementations that need infrastructure.

#[cfg(feature = "redis")]
pub mod redis_streams;

#[cfg(feature = "redis")]
pub use redis_streams::RedisStreamsQueue;
