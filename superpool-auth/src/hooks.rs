//! Lifecycle callbacks for authentication steps.
//!
//! The step executor reports three events per step through [`StepLifecycle`]:
//! start, completion and failure. UI progress indicators and telemetry both
//! implement the trait; the pipeline only sees the trait object.

use std::fmt::{self, Debug};
use std::sync::Arc;

use crate::step::AuthStep;

/// Observer of step transitions.
///
/// All methods default to no-ops; implement the ones you need. The trait is
/// dyn-compatible so heterogeneous observers can be combined with
/// [`LifecycleFanout`].
pub trait StepLifecycle: Send + Sync {
    /// Called before the step's delay and body.
    fn on_step_start(&self, _step: AuthStep) {}

    /// Called after the step's body and post-delay succeeded.
    fn on_step_complete(&self, _step: AuthStep) {}

    /// Called when the step's body failed, with the error's display text.
    fn on_step_fail(&self, _step: AuthStep, _message: &str) {}
}

impl<T: StepLifecycle + ?Sized> StepLifecycle for Arc<T> {
    fn on_step_start(&self, step: AuthStep) {
        (**self).on_step_start(step);
    }

    fn on_step_complete(&self, step: AuthStep) {
        (**self).on_step_complete(step);
    }

    fn on_step_fail(&self, step: AuthStep, message: &str) {
        (**self).on_step_fail(step, message);
    }
}

/// Observer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopLifecycle;

impl StepLifecycle for NoopLifecycle {}

/// Observer that logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingLifecycle;

impl StepLifecycle for TracingLifecycle {
    fn on_step_start(&self, step: AuthStep) {
        tracing::info!(step = %step, "Authentication step started");
    }

    fn on_step_complete(&self, step: AuthStep) {
        tracing::info!(step = %step, "Authentication step completed");
    }

    fn on_step_fail(&self, step: AuthStep, message: &str) {
        tracing::warn!(step = %step, error = message, "Authentication step failed");
    }
}

/// Forwards every event to each registered observer, in registration order.
#[derive(Default, Clone)]
pub struct LifecycleFanout {
    observers: Vec<Arc<dyn StepLifecycle>>,
}

impl Debug for LifecycleFanout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LifecycleFanout")
            .field("observers", &format!("[{} observers]", self.observers.len()))
            .finish()
    }
}

impl LifecycleFanout {
    /// Creates an empty fan-out.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers an observer.
    #[must_use]
    pub fn with(mut self, observer: impl StepLifecycle + 'static) -> Self {
        self.observers.push(Arc::new(observer));
        self
    }

    /// Number of registered observers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.observers.len()
    }

    /// Whether no observer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }
}

impl StepLifecycle for LifecycleFanout {
    fn on_step_start(&self, step: AuthStep) {
        for observer in &self.observers {
            observer.on_step_start(step);
        }
    }

    fn on_step_complete(&self, step: AuthStep) {
        for observer in &self.observers {
            observer.on_step_complete(step);
        }
    }

    fn on_step_fail(&self, step: AuthStep, message: &str) {
        for observer in &self.observers {
            observer.on_step_fail(step, message);
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Records every event for assertions.
    #[derive(Debug, Default)]
    pub struct RecordingLifecycle {
        pub events: Mutex<Vec<String>>,
    }

    impl RecordingLifecycle {
        pub fn events(&self) -> Vec<String> {
            self.events.lock().unwrap().clone()
        }
    }

    impl StepLifecycle for RecordingLifecycle {
        fn on_step_start(&self, step: AuthStep) {
            self.events.lock().unwrap().push(format!("start:{step}"));
        }

        fn on_step_complete(&self, step: AuthStep) {
            self.events.lock().unwrap().push(format!("complete:{step}"));
        }

        fn on_step_fail(&self, step: AuthStep, message: &str) {
            self.events
                .lock()
                .unwrap()
                .push(format!("fail:{step}:{message}"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingLifecycle;
    use super::*;

    #[test]
    fn test_fanout_preserves_order() {
        let first = Arc::new(RecordingLifecycle::default());
        let second = Arc::new(RecordingLifecycle::default());
        let fanout = LifecycleFanout::new()
            .with(Arc::clone(&first))
            .with(Arc::clone(&second))
            .with(NoopLifecycle);
        assert_eq!(fanout.len(), 3);

        fanout.on_step_start(AuthStep::ConnectWallet);
        fanout.on_step_fail(AuthStep::ConnectWallet, "boom");

        let expected = vec![
            "start:connect-wallet".to_owned(),
            "fail:connect-wallet:boom".to_owned(),
        ];
        assert_eq!(first.events(), expected);
        assert_eq!(second.events(), expected);
    }
}
