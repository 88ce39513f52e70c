//! Ports - seams to everything outside the core.
//!
//! - **Broker / TaskLease / ResultBackend**: task transport and result store
//! - **Delivery**: the downstream notification channel
//! - **Clock / IdGenerator**: time and identity, swappable in tests

pub mod broker;
pub mod clock;
pub mod delivery;
pub mod id_generator;

pub use self::broker::{Broker, ResultBackend, TaskLease};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::delivery::{Delivery, DeliveryError};
pub use self::id_generator::{IdGenerator, UlidGenerator};
