//! herald-core
//!
//! Asynchronous task dispatch: producers enqueue envelopes onto a broker,
//! workers lease them, run the registered handler and either retry or record
//! a terminal result.
//!
//! # Modules
//! - **domain**: envelope, state machine, errors, retry policy, decider, result records
//! - **ports**: Broker / TaskLease / ResultBackend, Delivery, Clock, IdGenerator
//! - **queue**: in-memory and Redis brokers
//! - **typed**: Task / Handler traits and the registry
//! - **app**: builder, producer, runtime, worker loop
//! - **notification**: the notification task and its log-backed channel

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod notification;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod typed;

pub use self::app::{App, AppBuilder, Producer, WorkerGroup};
pub use self::config::{ConfigError, HeraldConfig};
pub use self::domain::{TaskEnvelope, TaskError, TaskId, TaskState};
pub use self::error::TransportError;
