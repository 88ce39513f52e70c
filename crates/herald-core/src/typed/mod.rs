//! Typed task API.
//!
//! - **Typed surface**: [`Task`], [`Handler<T>`]; a task name cannot be
//!   paired with the wrong payload type
//! - **Dyn core**: [`DynHandler`]; what the worker dispatches on

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{DynHandler, Handler, TaskOutput, TypedHandler};
pub use self::registry::{RegistryError, TaskRegistry};
pub use self::task::Task;
