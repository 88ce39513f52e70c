//! Broker implementations.
//!
//! Both transports carry the same JSON envelope (see [`codec`]) and implement
//! [`Broker`](crate::ports::Broker) and [`ResultBackend`](crate::ports::ResultBackend).

pub mod codec;
mod memory;
mod redis;

pub use self::memory::InMemoryBroker;
pub use self::redis::{RedisBroker, RedisBrokerOptions};
