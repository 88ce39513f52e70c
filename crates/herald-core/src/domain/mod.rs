//! Domain model: identifiers, envelopes, state machine, failure taxonomy,
//! retry decisions and result records.
//!
//! Nothing in here performs I/O.

pub mod decision;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod outcome;
pub mod retry;
pub mod state;
pub mod task;

pub use decision::{Decider, Decision, DefaultDecider};
pub use envelope::TaskEnvelope;
pub use errors::{Classify, ErrorKind, TaskError, TransitionError};
pub use ids::{ParseIdError, TaskId};
pub use outcome::{FailureReason, ResultRecord, ResultStatus};
pub use retry::{Backoff, RetryPolicy};
pub use state::TaskState;
pub use task::TaskName;
