//! AppBuilder - wiring and startup checks.

use std::sync::Arc;
use std::time::Duration;

use super::producer::Producer;
use super::runtime::{Runtime, TimeLimits};
use super::worker_loop::{Worker, WorkerGroup};
use crate::domain::{Decider, DefaultDecider, RetryPolicy};
use crate::ports::{Broker, Clock, IdGenerator, ResultBackend, SystemClock, UlidGenerator};
use crate::typed::{Handler, RegistryError, Task, TaskRegistry};

/// Builds an [`App`] around one transport.
///
/// ```ignore
/// let app = AppBuilder::new()
///     .register::<SendNotification, _>(NotificationHandler::new(LogDelivery))?
///     .expect_tasks(&[SendNotification::NAME])
///     .build(broker)?;
/// ```
///
/// `build` fails if any name passed to `expect_tasks` has no handler, so a
/// worker never starts without the handlers its producers rely on.
pub struct AppBuilder {
    registry: TaskRegistry,
    expected_tasks: Option<Vec<String>>,
    retry_policy: RetryPolicy,
    time_limits: TimeLimits,
    clock: Arc<dyn Clock>,
    decider: Option<Arc<dyn Decider>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task handlers: {0:?}")]
    MissingTasks(Vec<String>),

    #[error("soft time limit ({soft:?}) must be below hard time limit ({hard:?})")]
    TimeLimits { soft: Duration, hard: Duration },
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            registry: TaskRegistry::new(),
            expected_tasks: None,
            retry_policy: RetryPolicy::default(),
            time_limits: TimeLimits::default(),
            clock: Arc::new(SystemClock),
            decider: None,
        }
    }

    pub fn register<T: Task, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn expect_tasks(mut self, names: &[&str]) -> Self {
        self.expected_tasks = Some(names.iter().map(|name| name.to_string()).collect());
        self
    }

    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    pub fn time_limits(mut self, limits: TimeLimits) -> Self {
        self.time_limits = limits;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the default decider (built from the retry policy).
    pub fn decider(mut self, decider: Arc<dyn Decider>) -> Self {
        self.decider = Some(decider);
        self
    }

    pub fn build<B>(self, transport: Arc<B>) -> Result<App, BuildError>
    where
        B: Broker + ResultBackend + 'static,
    {
        if let Some(expected) = &self.expected_tasks {
            let missing: Vec<String> = expected
                .iter()
                .filter(|name| !self.registry.contains(name))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTasks(missing));
            }
        }
        if self.time_limits.soft >= self.time_limits.hard {
            return Err(BuildError::TimeLimits {
                soft: self.time_limits.soft,
                hard: self.time_limits.hard,
            });
        }

        let broker: Arc<dyn Broker> = transport.clone();
        let results: Arc<dyn ResultBackend> = transport;
        let decider: Arc<dyn Decider> = match self.decider {
            Some(decider) => decider,
            None => Arc::new(DefaultDecider::new(self.retry_policy.clone())),
        };
        let ids: Arc<dyn IdGenerator> = Arc::new(UlidGenerator::new(Arc::clone(&self.clock)));

        tracing::debug!(tasks = ?self.registry.registered_names(), "app built");

        let runtime = Arc::new(Runtime::new(Arc::new(self.registry), self.time_limits));
        Ok(App {
            producer: Producer::new(
                Arc::clone(&broker),
                ids,
                Arc::clone(&self.clock),
                self.retry_policy.max_attempts,
            ),
            worker: Arc::new(Worker::new(
                Arc::clone(&broker),
                runtime,
                decider,
                self.clock,
            )),
            broker,
            results,
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A wired producer and worker sharing one transport.
pub struct App {
    producer: Producer,
    worker: Arc<Worker>,
    broker: Arc<dyn Broker>,
    results: Arc<dyn ResultBackend>,
}

impl App {
    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn worker(&self) -> Arc<Worker> {
        Arc::clone(&self.worker)
    }

    pub fn broker(&self) -> Arc<dyn Broker> {
        Arc::clone(&self.broker)
    }

    pub fn results(&self) -> Arc<dyn ResultBackend> {
        Arc::clone(&self.results)
    }

    pub fn spawn_workers(&self, concurrency: usize, poll_interval: Duration) -> WorkerGroup {
        WorkerGroup::spawn(concurrency, self.worker(), poll_interval)
    }
}
