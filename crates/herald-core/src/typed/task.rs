//! Task trait - binds a task name to its payload type.

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::domain::TaskError;

/// A payload type that can be enqueued and handled.
///
/// ```ignore
/// #[derive(Serialize, Deserialize)]
/// struct Resize {
///     url: String,
/// }
///
/// impl Task for Resize {
///     const NAME: &'static str = "images.resize";
/// }
/// ```
pub trait Task: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Name carried by every envelope of this task.
    const NAME: &'static str;

    /// Structural checks on the decoded payload.
    ///
    /// Runs on the worker before the handler; an error here fails the task
    /// without retrying.
    fn validate(&self) -> Result<(), TaskError> {
        Ok(())
    }
}
