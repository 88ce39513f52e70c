//! Application layer: ports wired into a producer and a worker.
//!
//! - **AppBuilder**: wiring and startup checks
//! - **Producer**: enqueue, returns a task id without waiting
//! - **Runtime**: handler dispatch under soft/hard time limits
//! - **Worker / WorkerGroup**: lease -> execute -> decide -> retry or complete

pub mod builder;
pub mod producer;
pub mod runtime;
pub mod worker_loop;

pub use self::builder::{App, AppBuilder, BuildError};
pub use self::producer::Producer;
pub use self::runtime::{Runtime, TimeLimits};
pub use self::worker_loop::{Worker, WorkerGroup};
