//! Authentication state machine.
//!
//! [`AuthStateMachine`] owns the authentication lock and the per-attempt
//! progress: the active step, the completed-step set, the failure marker and
//! the signed-in user. All mutation goes through the transition methods
//! below; readers get consistent [`AuthSnapshot`]s, either on demand or
//! pushed through a [`watch`] channel on every transition.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;

use crate::lock::{AuthLock, ConnectionDrift, ConnectionGuard, LockHeld, LockTicket};
use crate::proto::AuthenticatedUser;
use crate::step::{AuthStep, StepStatus};
use crate::wallet::WalletState;

/// A step was started out of the fixed order.
///
/// This is a programming error in the caller, not a user-facing failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StepOrderError {
    /// The step is not the next unstarted one.
    #[error(
        "step {step} started out of order (next step is {})",
        .next.map_or("none", AuthStep::as_str)
    )]
    OutOfOrder {
        /// Step that was requested.
        step: AuthStep,
        /// Step that may start next, if any.
        next: Option<AuthStep>,
    },
    /// Another step is still running.
    #[error("step {step} started while {running} is still running")]
    Busy {
        /// Step that was requested.
        step: AuthStep,
        /// Step currently marked as running.
        running: AuthStep,
    },
    /// The attempt already failed; no further step may run.
    #[error("step {step} started after the flow failed at {failed}")]
    Halted {
        /// Step that was requested.
        step: AuthStep,
        /// Step the flow failed at.
        failed: AuthStep,
    },
    /// A step was completed or failed without being the running step.
    #[error(
        "step {step} finished while not running (running step is {})",
        .running.map_or("none", AuthStep::as_str)
    )]
    NotRunning {
        /// Step that was finished.
        step: AuthStep,
        /// Step currently marked as running, if any.
        running: Option<AuthStep>,
    },
}

/// Read-only projection of the machine for UI layers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthSnapshot {
    /// Last wallet state observed by the machine.
    pub wallet_state: WalletState,
    /// Lock state.
    pub auth_lock: AuthLock,
    /// Step currently running.
    pub current_step: Option<AuthStep>,
    /// Steps finished successfully, in pipeline order.
    pub completed_steps: Vec<AuthStep>,
    /// Step the attempt failed at.
    pub failed_step: Option<AuthStep>,
    /// Failure message of the attempt.
    pub error: Option<String>,
    /// Signed-in user after a successful attempt.
    pub user: Option<AuthenticatedUser>,
    /// Lock held and no error recorded.
    pub is_authenticating: bool,
    /// Completed share of the pipeline, 0 to 100.
    pub progress: u8,
}

impl AuthSnapshot {
    /// Status of `step` as shown to users.
    #[must_use]
    pub fn step_status(&self, step: AuthStep) -> StepStatus {
        if self.failed_step == Some(step) {
            StepStatus::Failed
        } else if self.completed_steps.contains(&step) {
            StepStatus::Completed
        } else if self.is_authenticating && self.current_step == Some(step) {
            StepStatus::Current
        } else {
            StepStatus::Pending
        }
    }
}

#[derive(Debug, Default)]
struct MachineState {
    wallet_state: WalletState,
    current_step: Option<AuthStep>,
    completed: BTreeSet<AuthStep>,
    failed_step: Option<AuthStep>,
    error: Option<String>,
    user: Option<AuthenticatedUser>,
}

impl MachineState {
    /// Drops everything a previous attempt left behind.
    fn clear_attempt(&mut self) {
        self.current_step = None;
        self.completed.clear();
        self.failed_step = None;
        self.error = None;
        self.user = None;
    }

    fn ensure_running(&self, step: AuthStep) -> Result<(), StepOrderError> {
        if self.current_step == Some(step) {
            Ok(())
        } else {
            Err(StepOrderError::NotRunning {
                step,
                running: self.current_step,
            })
        }
    }

    fn next_step(&self) -> Option<AuthStep> {
        AuthStep::ALL
            .into_iter()
            .find(|step| !self.completed.contains(step))
    }
}

fn progress_of(completed: usize) -> u8 {
    let percent = completed.min(AuthStep::COUNT) * 100 / AuthStep::COUNT;
    u8::try_from(percent).unwrap_or(100)
}

/// Owner of the lock and progress of one sign-in attempt at a time.
#[derive(Debug)]
pub struct AuthStateMachine {
    guard: ConnectionGuard,
    state: Mutex<MachineState>,
    updates: watch::Sender<AuthSnapshot>,
}

impl Default for AuthStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthStateMachine {
    /// Creates an idle machine.
    #[must_use]
    pub fn new() -> Self {
        let (updates, _) = watch::channel(AuthSnapshot::default());
        Self {
            guard: ConnectionGuard::new(),
            state: Mutex::new(MachineState::default()),
            updates,
        }
    }

    fn state(&self) -> MutexGuard<'_, MachineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn project(&self, state: &MachineState) -> AuthSnapshot {
        let auth_lock = self.guard.lock();
        AuthSnapshot {
            wallet_state: state.wallet_state.clone(),
            is_authenticating: auth_lock.is_locked && state.error.is_none(),
            auth_lock,
            current_step: state.current_step,
            completed_steps: state.completed.iter().copied().collect(),
            failed_step: state.failed_step,
            error: state.error.clone(),
            user: state.user.clone(),
            progress: progress_of(state.completed.len()),
        }
    }

    fn publish(&self, state: &MachineState) {
        self.updates.send_replace(self.project(state));
    }

    /// Receiver notified after every transition.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.updates.subscribe()
    }

    /// Current projection.
    #[must_use]
    pub fn snapshot(&self) -> AuthSnapshot {
        self.project(&self.state())
    }

    /// Records the wallet state reported by the connection layer.
    pub fn set_wallet_state(&self, wallet: WalletState) {
        let mut state = self.state();
        if state.wallet_state != wallet {
            state.wallet_state = wallet;
            self.publish(&state);
        }
    }

    /// Takes the lock for `address` and snapshots `wallet`.
    ///
    /// A new attempt starts from scratch: the steps, failure and user of the
    /// previous attempt are cleared.
    ///
    /// # Errors
    ///
    /// Returns [`LockHeld`] if an attempt already holds the lock. No state
    /// changes in that case.
    pub fn acquire_auth_lock(
        &self,
        address: &str,
        wallet: &WalletState,
    ) -> Result<LockTicket, LockHeld> {
        let mut state = self.state();
        let ticket = self.guard.try_acquire(address, wallet)?;
        state.clear_attempt();
        state.wallet_state = wallet.clone();
        self.publish(&state);
        Ok(ticket)
    }

    /// Re-validates the wallet against the snapshot taken with the lock.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionDrift`] when the wallet identity changed or the
    /// ticket was invalidated by a reset.
    pub fn validate_connection(
        &self,
        ticket: &LockTicket,
        wallet: &WalletState,
    ) -> Result<(), ConnectionDrift> {
        self.guard.validate(ticket, wallet)
    }

    /// Fails unless `ticket` still owns the lock.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionDrift::Stale`] after the lock was released or the
    /// machine reset.
    pub fn ensure_owned(&self, ticket: &LockTicket) -> Result<(), ConnectionDrift> {
        self.guard.ensure_current(ticket)
    }

    /// Whether `ticket` still owns the lock.
    #[must_use]
    pub fn owns_lock(&self, ticket: &LockTicket) -> bool {
        self.guard.is_current(ticket)
    }

    /// Marks `step` as running.
    ///
    /// # Errors
    ///
    /// Returns [`StepOrderError`] unless `step` is the next unstarted step,
    /// no other step is running and the attempt has not failed.
    pub fn start_step(&self, step: AuthStep) -> Result<(), StepOrderError> {
        let mut state = self.state();
        if let Some(failed) = state.failed_step {
            return Err(StepOrderError::Halted { step, failed });
        }
        if let Some(running) = state.current_step {
            return Err(StepOrderError::Busy { step, running });
        }
        let next = state.next_step();
        if next != Some(step) {
            return Err(StepOrderError::OutOfOrder { step, next });
        }
        state.current_step = Some(step);
        self.publish(&state);
        Ok(())
    }

    /// Marks the running `step` as completed.
    ///
    /// # Errors
    ///
    /// Returns [`StepOrderError::NotRunning`] unless `step` is running.
    pub fn complete_step(&self, step: AuthStep) -> Result<(), StepOrderError> {
        let mut state = self.state();
        state.ensure_running(step)?;
        state.completed.insert(step);
        state.current_step = None;
        self.publish(&state);
        Ok(())
    }

    /// Records a failure of the running `step` and releases the lock.
    ///
    /// # Errors
    ///
    /// Returns [`StepOrderError::NotRunning`] unless `step` is running. Nothing
    /// changes in that case.
    pub fn fail_step(
        &self,
        step: AuthStep,
        message: impl Into<String>,
    ) -> Result<(), StepOrderError> {
        let mut state = self.state();
        state.ensure_running(step)?;
        state.failed_step = Some(step);
        state.error = Some(message.into());
        state.current_step = None;
        self.guard.release();
        self.publish(&state);
        Ok(())
    }

    /// Ends the attempt with `message` when no step can be blamed, for
    /// instance when a step could not even start. Releases the lock.
    pub fn abort(&self, message: impl Into<String>) {
        let mut state = self.state();
        state.failed_step = state.current_step.take();
        state.error = Some(message.into());
        self.guard.release();
        self.publish(&state);
    }

    /// Records the signed-in user and releases the lock.
    pub fn finish(&self, user: AuthenticatedUser) {
        let mut state = self.state();
        state.user = Some(user);
        state.current_step = None;
        self.guard.release();
        self.publish(&state);
    }

    /// Returns to the initial state, releasing the lock and invalidating any
    /// outstanding ticket. The observed wallet state is kept.
    pub fn reset(&self) {
        let mut state = self.state();
        let wallet_state = std::mem::take(&mut state.wallet_state);
        *state = MachineState {
            wallet_state,
            ..MachineState::default()
        };
        self.guard.reset();
        self.publish(&state);
    }

    /// Status of `step`.
    #[must_use]
    pub fn step_status(&self, step: AuthStep) -> StepStatus {
        self.snapshot().step_status(step)
    }

    /// Completed share of the pipeline, 0 to 100.
    #[must_use]
    pub fn progress(&self) -> u8 {
        progress_of(self.state().completed.len())
    }

    /// Lock held and no error recorded.
    #[must_use]
    pub fn is_authenticating(&self) -> bool {
        let state = self.state();
        self.guard.is_locked() && state.error.is_none()
    }

    /// Step currently running.
    #[must_use]
    pub fn current_step(&self) -> Option<AuthStep> {
        self.state().current_step
    }

    /// Failure message of the attempt.
    #[must_use]
    pub fn error(&self) -> Option<String> {
        self.state().error.clone()
    }

    /// Signed-in user, if the last attempt succeeded.
    #[must_use]
    pub fn user(&self) -> Option<AuthenticatedUser> {
        self.state().user.clone()
    }

    /// Current lock state.
    #[must_use]
    pub fn auth_lock(&self) -> AuthLock {
        self.guard.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user() -> AuthenticatedUser {
        AuthenticatedUser {
            uid: "0xabc".into(),
            wallet_address: "0xAbC".into(),
        }
    }

    #[test]
    fn test_full_pipeline_reaches_completion() {
        let machine = AuthStateMachine::new();
        let wallet = WalletState::connected("0xAbC", Some(1));
        machine.acquire_auth_lock("0xAbC", &wallet).unwrap();
        assert!(machine.is_authenticating());

        for step in AuthStep::ALL {
            machine.start_step(step).unwrap();
            assert_eq!(machine.step_status(step), StepStatus::Current);
            machine.complete_step(step).unwrap();
        }
        machine.finish(user());

        let snapshot = machine.snapshot();
        assert_eq!(snapshot.completed_steps.len(), 6);
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.error, None);
        assert!(!snapshot.auth_lock.is_locked);
        assert!(!snapshot.is_authenticating);
        assert_eq!(snapshot.user, Some(user()));
    }

    #[test]
    fn test_steps_must_advance_in_order() {
        let machine = AuthStateMachine::new();
        assert_eq!(
            machine.start_step(AuthStep::GenerateMessage),
            Err(StepOrderError::OutOfOrder {
                step: AuthStep::GenerateMessage,
                next: Some(AuthStep::ConnectWallet),
            })
        );
        machine.start_step(AuthStep::ConnectWallet).unwrap();
        assert_eq!(
            machine.start_step(AuthStep::AcquireLock),
            Err(StepOrderError::Busy {
                step: AuthStep::AcquireLock,
                running: AuthStep::ConnectWallet,
            })
        );
        machine.complete_step(AuthStep::ConnectWallet).unwrap();
        assert!(machine.start_step(AuthStep::ConnectWallet).is_err());
        machine.start_step(AuthStep::AcquireLock).unwrap();
    }

    #[test]
    fn test_failure_halts_and_releases_lock() {
        let machine = AuthStateMachine::new();
        let wallet = WalletState::connected("0xabc", Some(1));
        machine.acquire_auth_lock("0xabc", &wallet).unwrap();
        machine.start_step(AuthStep::ConnectWallet).unwrap();
        machine.complete_step(AuthStep::ConnectWallet).unwrap();
        machine.start_step(AuthStep::AcquireLock).unwrap();
        machine.fail_step(AuthStep::AcquireLock, "boom").unwrap();

        assert!(!machine.auth_lock().is_locked);
        assert!(!machine.is_authenticating());
        assert_eq!(machine.error().as_deref(), Some("boom"));
        assert_eq!(machine.step_status(AuthStep::AcquireLock), StepStatus::Failed);
        assert_eq!(
            machine.step_status(AuthStep::ConnectWallet),
            StepStatus::Completed
        );
        assert_eq!(
            machine.step_status(AuthStep::GenerateMessage),
            StepStatus::Pending
        );
        assert!(matches!(
            machine.start_step(AuthStep::AcquireLock),
            Err(StepOrderError::Halted { .. })
        ));
    }

    #[test]
    fn test_reset_clears_progress_and_invalidates_ticket() {
        let machine = AuthStateMachine::new();
        let wallet = WalletState::connected("0xabc", Some(1));
        let ticket = machine.acquire_auth_lock("0xabc", &wallet).unwrap();
        machine.start_step(AuthStep::ConnectWallet).unwrap();
        machine.complete_step(AuthStep::ConnectWallet).unwrap();
        assert_eq!(machine.progress(), 16);

        machine.reset();
        assert_eq!(machine.progress(), 0);
        assert_eq!(machine.current_step(), None);
        assert!(!machine.owns_lock(&ticket));
        assert!(machine.validate_connection(&ticket, &wallet).is_err());
        assert!(machine.acquire_auth_lock("0xabc", &wallet).is_ok());
    }

    #[test]
    fn test_second_lock_attempt_changes_nothing() {
        let machine = AuthStateMachine::new();
        let wallet = WalletState::connected("0xabc", Some(1));
        machine.acquire_auth_lock("0xabc", &wallet).unwrap();
        let before = machine.snapshot();
        assert!(machine.acquire_auth_lock("0xabc", &wallet).is_err());
        assert!(
            machine
                .acquire_auth_lock("0xdef", &WalletState::connected("0xdef", Some(1)))
                .is_err()
        );
        assert_eq!(machine.snapshot(), before);
    }

    #[test]
    fn test_subscribers_see_transitions() {
        let machine = AuthStateMachine::new();
        let mut updates = machine.subscribe();
        machine.start_step(AuthStep::ConnectWallet).unwrap();
        assert!(updates.has_changed().unwrap());
        assert_eq!(
            updates.borrow_and_update().current_step,
            Some(AuthStep::ConnectWallet)
        );
        machine.complete_step(AuthStep::ConnectWallet).unwrap();
        assert_eq!(
            updates.borrow_and_update().completed_steps,
            vec![AuthStep::ConnectWallet]
        );
    }

    #[test]
    fn test_only_the_running_step_can_finish() {
        let machine = AuthStateMachine::new();
        assert_eq!(
            machine.complete_step(AuthStep::FirebaseAuth),
            Err(StepOrderError::NotRunning {
                step: AuthStep::FirebaseAuth,
                running: None,
            })
        );
        assert_eq!(machine.progress(), 0);

        machine.start_step(AuthStep::ConnectWallet).unwrap();
        assert_eq!(
            machine.fail_step(AuthStep::AcquireLock, "boom"),
            Err(StepOrderError::NotRunning {
                step: AuthStep::AcquireLock,
                running: Some(AuthStep::ConnectWallet),
            })
        );
        assert_eq!(machine.error(), None);
        assert_eq!(machine.current_step(), Some(AuthStep::ConnectWallet));
        assert!(machine.snapshot().completed_steps.is_empty());
    }

    #[test]
    fn test_new_lock_starts_a_fresh_attempt() {
        let machine = AuthStateMachine::new();
        let wallet = WalletState::connected("0xabc", Some(1));
        machine.acquire_auth_lock("0xabc", &wallet).unwrap();
        for step in AuthStep::ALL {
            machine.start_step(step).unwrap();
            machine.complete_step(step).unwrap();
        }
        machine.finish(user());
        assert_eq!(machine.progress(), 100);

        machine.acquire_auth_lock("0xabc", &wallet).unwrap();
        let snapshot = machine.snapshot();
        assert_eq!(snapshot.progress, 0);
        assert!(snapshot.completed_steps.is_empty());
        assert_eq!(snapshot.user, None);
        assert!(snapshot.is_authenticating);
        machine.start_step(AuthStep::ConnectWallet).unwrap();
    }

    #[test]
    fn test_abort_records_error_and_releases_lock() {
        let machine = AuthStateMachine::new();
        let wallet = WalletState::connected("0xabc", Some(1));
        machine.acquire_auth_lock("0xabc", &wallet).unwrap();
        machine.abort("step connect-wallet started out of order");

        assert!(!machine.auth_lock().is_locked);
        assert!(!machine.is_authenticating());
        assert_eq!(machine.snapshot().failed_step, None);
        assert!(machine.error().is_some());
    }
}
