//! Uniform execution of a single authentication step.
//!
//! [`StepExecutor`] wraps a step body with lifecycle callbacks and optional
//! pacing delays. Failures are reported and then returned unchanged: the
//! caller still needs the original error to categorize it.

use std::fmt::{self, Display};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::hooks::{NoopLifecycle, StepLifecycle};
use crate::step::AuthStep;

/// Pacing applied around steps so progress is readable in the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepDelays {
    /// Wait after `on_step_start` before running a step body.
    pub before: Duration,
    /// Wait after a step body succeeded, before `on_step_complete`.
    pub after: Duration,
    /// Pre-delay for the lock step, which is otherwise instantaneous.
    pub lock_before: Duration,
}

impl Default for StepDelays {
    fn default() -> Self {
        Self {
            before: Duration::from_millis(100),
            after: Duration::from_millis(200),
            lock_before: Duration::from_millis(500),
        }
    }
}

impl StepDelays {
    /// No pacing at all.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            before: Duration::ZERO,
            after: Duration::ZERO,
            lock_before: Duration::ZERO,
        }
    }
}

/// Per-call options for [`StepExecutor::execute_step`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StepOptions {
    /// Wait before the step body.
    pub before_delay: Duration,
    /// Wait after a successful step body.
    pub after_delay: Duration,
    /// Suppress all lifecycle callbacks for this call.
    pub skip_progress_callbacks: bool,
}

/// Runs steps with callbacks and pacing.
#[derive(Clone)]
pub struct StepExecutor {
    lifecycle: Arc<dyn StepLifecycle>,
    delays: StepDelays,
}

impl fmt::Debug for StepExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepExecutor")
            .field("delays", &self.delays)
            .finish_non_exhaustive()
    }
}

impl Default for StepExecutor {
    fn default() -> Self {
        Self::new(Arc::new(NoopLifecycle), StepDelays::default())
    }
}

async fn pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

impl StepExecutor {
    /// Creates an executor reporting to `lifecycle`.
    #[must_use]
    pub fn new(lifecycle: Arc<dyn StepLifecycle>, delays: StepDelays) -> Self {
        Self { lifecycle, delays }
    }

    /// Configured pacing.
    #[must_use]
    pub const fn delays(&self) -> StepDelays {
        self.delays
    }

    /// Options using the configured default pacing.
    #[must_use]
    pub const fn paced(&self) -> StepOptions {
        StepOptions {
            before_delay: self.delays.before,
            after_delay: self.delays.after,
            skip_progress_callbacks: false,
        }
    }

    /// Runs `body` as `step`.
    ///
    /// # Errors
    ///
    /// Returns the body's error unchanged after reporting its message to
    /// `on_step_fail`.
    pub async fn execute_step<T, E, F, Fut>(
        &self,
        step: AuthStep,
        body: F,
        options: StepOptions,
    ) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let report = !options.skip_progress_callbacks;
        if report {
            self.lifecycle.on_step_start(step);
        }
        pause(options.before_delay).await;

        match body().await {
            Ok(value) => {
                pause(options.after_delay).await;
                if report {
                    self.lifecycle.on_step_complete(step);
                }
                Ok(value)
            }
            Err(error) => {
                if report {
                    self.lifecycle.on_step_fail(step, &error.to_string());
                }
                Err(error)
            }
        }
    }

    /// Runs `body` as the `acquire-lock` step with the longer lock pre-delay.
    ///
    /// # Errors
    ///
    /// Returns the body's error unchanged.
    pub async fn execute_lock_step<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let options = StepOptions {
            before_delay: self.delays.lock_before,
            after_delay: self.delays.after,
            skip_progress_callbacks: false,
        };
        self.execute_step(AuthStep::AcquireLock, body, options).await
    }

    /// Runs `body` with no callbacks and no delays.
    ///
    /// # Errors
    ///
    /// Returns the body's error unchanged.
    pub async fn execute_internal_step<T, E, F, Fut>(&self, body: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        body().await
    }
}
