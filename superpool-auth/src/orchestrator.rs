//! The wallet sign-in pipeline.
//!
//! [`AuthenticationOrchestrator`] wires the collaborators (wallet connection,
//! signer, backend RPC and session backend) to the [`AuthStateMachine`] and
//! runs the six steps in order:
//!
//! 1. `connect-wallet`: the wallet still reports the account.
//! 2. `acquire-lock`: the lock taken before the pipeline started is still
//!    ours and the wallet has not drifted.
//! 3. `generate-message`: the backend issues a challenge (retried).
//! 4. `request-signature`: the wallet signs it (retried under the wallet's
//!    policy), then the connection is re-validated.
//! 5. `verify-signature`: the backend checks the signature and returns a
//!    custom token (retried), then the connection is re-validated.
//! 6. `firebase-auth`: the session backend accepts the token.
//!
//! The lock is acquired before any step runs, so a duplicate trigger returns
//! [`AuthOutcome::Skipped`] without touching the wallet or the network.

use std::error::Error as StdError;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::categorize::{ErrorCategory, categorize_error};
use crate::executor::{StepDelays, StepExecutor};
use crate::hooks::{StepLifecycle, TracingLifecycle};
use crate::lock::{ConnectionDrift, LockTicket};
use crate::machine::{AuthSnapshot, AuthStateMachine, StepOrderError};
use crate::proto::{
    AuthRpc, AuthenticatedUser, GenerateAuthMessageRequest, SignatureRequest, SignatureType,
    VerifySignatureRequest,
};
use crate::retry::{
    OperationAborted, RetryAttempt, RetryOptions, RetryPolicy, execute_with_error_policy,
    execute_with_retry, policy_for_wallet,
};
use crate::step::AuthStep;
use crate::wallet::{
    MessageSigner, SessionBackend, WalletConnection, WalletState, is_session_corruption,
};

type BoxError = Box<dyn StdError + Send + Sync>;

/// Why a call to [`AuthenticationOrchestrator::authenticate`] did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No connected account.
    NotConnected,
    /// Another attempt holds the lock.
    AlreadyAuthenticating,
    /// The previous attempt failed and has not been reset.
    UnresolvedError,
    /// The session backend already has a session for this wallet.
    ExistingSession,
}

/// Result of an authentication request that did not fail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    /// All six steps completed.
    Authenticated(AuthenticatedUser),
    /// A guard condition did not hold; nothing ran.
    Skipped(SkipReason),
}

/// Failure of a sign-in attempt.
#[derive(Debug, thiserror::Error)]
pub enum AuthFlowError {
    /// The wallet disconnected before the pipeline could use it.
    #[error("wallet is not connected")]
    WalletDisconnected,
    /// The wallet switched account or chain, or the attempt was reset.
    #[error(transparent)]
    ConnectionChanged(#[from] ConnectionDrift),
    /// Steps were driven out of order.
    #[error(transparent)]
    StepOrder(#[from] StepOrderError),
    /// The attempt was cancelled between retries.
    #[error(transparent)]
    Aborted(#[from] OperationAborted),
    /// A collaborator failed. Displays the upstream message unchanged.
    #[error("{message}")]
    Step {
        /// Step that failed.
        step: AuthStep,
        /// Classification of `message`.
        category: ErrorCategory,
        /// Upstream error text.
        message: String,
        /// Upstream error.
        #[source]
        source: BoxError,
    },
}

impl AuthFlowError {
    fn step_failure<E>(step: AuthStep, error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let message = error.to_string();
        Self::Step {
            step,
            category: categorize_error(&message),
            message,
            source: Box::new(error),
        }
    }

    /// Classification of the failure.
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Step { category, .. } => *category,
            Self::WalletDisconnected => ErrorCategory::Network,
            Self::StepOrder(_) => ErrorCategory::Fatal,
            Self::ConnectionChanged(_) | Self::Aborted(_) => ErrorCategory::Recoverable,
        }
    }

    /// Fixed text for end users.
    #[must_use]
    pub fn user_message(&self) -> &'static str {
        self.category().user_message()
    }
}

fn log_retry(attempt: &RetryAttempt<'_>) {
    tracing::info!(
        attempt = attempt.attempt,
        total = attempt.total_attempts,
        delay_ms = u64::try_from(attempt.next_delay.as_millis()).unwrap_or(u64::MAX),
        error = attempt.last_error,
        "Retrying authentication operation"
    );
}

/// Runs wallet sign-ins against one set of collaborators.
pub struct AuthenticationOrchestrator<W, S, R, B> {
    wallet: Arc<W>,
    signer: Arc<S>,
    rpc: Arc<R>,
    session: Arc<B>,
    machine: AuthStateMachine,
    executor: StepExecutor,
    flow_cancel: Mutex<CancellationToken>,
    first_attempt: AtomicBool,
}

impl<W, S, R, B> std::fmt::Debug for AuthenticationOrchestrator<W, S, R, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticationOrchestrator")
            .field("machine", &self.machine)
            .field("executor", &self.executor)
            .finish_non_exhaustive()
    }
}

impl<W, S, R, B> AuthenticationOrchestrator<W, S, R, B>
where
    W: WalletConnection,
    S: MessageSigner,
    R: AuthRpc,
    B: SessionBackend,
{
    /// Creates an orchestrator that logs step transitions with `tracing`.
    pub fn new(wallet: Arc<W>, signer: Arc<S>, rpc: Arc<R>, session: Arc<B>) -> Self {
        Self::with_executor(
            wallet,
            signer,
            rpc,
            session,
            StepExecutor::new(Arc::new(TracingLifecycle), StepDelays::default()),
        )
    }

    /// Creates an orchestrator reporting to `lifecycle` with custom pacing.
    pub fn with_lifecycle(
        wallet: Arc<W>,
        signer: Arc<S>,
        rpc: Arc<R>,
        session: Arc<B>,
        lifecycle: Arc<dyn StepLifecycle>,
        delays: StepDelays,
    ) -> Self {
        Self::with_executor(
            wallet,
            signer,
            rpc,
            session,
            StepExecutor::new(lifecycle, delays),
        )
    }

    fn with_executor(
        wallet: Arc<W>,
        signer: Arc<S>,
        rpc: Arc<R>,
        session: Arc<B>,
        executor: StepExecutor,
    ) -> Self {
        let machine = AuthStateMachine::new();
        machine.set_wallet_state(wallet.state());
        Self {
            wallet,
            signer,
            rpc,
            session,
            machine,
            executor,
            flow_cancel: Mutex::new(CancellationToken::new()),
            first_attempt: AtomicBool::new(true),
        }
    }

    /// The underlying state machine.
    pub fn machine(&self) -> &AuthStateMachine {
        &self.machine
    }

    /// Receiver notified after every state transition.
    pub fn subscribe(&self) -> watch::Receiver<AuthSnapshot> {
        self.machine.subscribe()
    }

    /// Abandons any running attempt and returns to the initial state.
    ///
    /// Pending retries stop before their next attempt; in-flight wallet or
    /// network calls are not interrupted, but their results are discarded.
    pub fn reset(&self) {
        self.flow_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .cancel();
        self.machine.reset();
        self.first_attempt.store(true, Ordering::SeqCst);
    }

    /// Feeds a wallet state change into the machine. A disconnect resets the
    /// attempt.
    pub fn handle_wallet_change(&self, wallet: WalletState) {
        let disconnected = !wallet.is_connected;
        self.machine.set_wallet_state(wallet);
        if disconnected {
            tracing::info!("Wallet disconnected, resetting authentication");
            self.reset();
        }
    }

    fn begin_flow(&self) -> CancellationToken {
        let token = CancellationToken::new();
        *self
            .flow_cancel
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = token.clone();
        token
    }

    /// Runs the sign-in pipeline for the connected wallet.
    ///
    /// Returns [`AuthOutcome::Skipped`] without side effects when the wallet
    /// is not connected, another attempt is running, a previous failure is
    /// unresolved, or a session for this wallet already exists.
    ///
    /// # Errors
    ///
    /// Returns the [`AuthFlowError`] of the step that failed. The failure is
    /// recorded in the state machine and the lock is released.
    #[tracing::instrument(skip_all, fields(address))]
    pub async fn authenticate(&self) -> Result<AuthOutcome, AuthFlowError> {
        let wallet = self.wallet.state();
        self.machine.set_wallet_state(wallet.clone());
        let Some(address) = wallet.connected_address().map(str::to_owned) else {
            return Ok(AuthOutcome::Skipped(SkipReason::NotConnected));
        };
        tracing::Span::current().record("address", address.as_str());

        let snapshot = self.machine.snapshot();
        if snapshot.is_authenticating {
            return Ok(AuthOutcome::Skipped(SkipReason::AlreadyAuthenticating));
        }
        if snapshot.error.is_some() {
            return Ok(AuthOutcome::Skipped(SkipReason::UnresolvedError));
        }
        if self
            .session
            .current_user()
            .is_some_and(|user| user.wallet_address.eq_ignore_ascii_case(&address))
        {
            return Ok(AuthOutcome::Skipped(SkipReason::ExistingSession));
        }

        let ticket = match self.machine.acquire_auth_lock(&address, &wallet) {
            Ok(ticket) => ticket,
            Err(held) => {
                tracing::debug!(
                    held_by = %held.held_by,
                    "Duplicate authentication attempt ignored"
                );
                return Ok(AuthOutcome::Skipped(SkipReason::AlreadyAuthenticating));
            }
        };
        let cancel = self.begin_flow();
        let is_first_attempt = self.first_attempt.swap(false, Ordering::SeqCst);

        let user = self
            .run_pipeline(&ticket, &wallet, is_first_attempt, &cancel)
            .await?;
        if self.machine.owns_lock(&ticket) {
            self.machine.finish(user.clone());
        }
        tracing::info!(uid = %user.uid, "Wallet authentication succeeded");
        Ok(AuthOutcome::Authenticated(user))
    }

    async fn run_pipeline(
        &self,
        ticket: &LockTicket,
        wallet: &WalletState,
        is_first_attempt: bool,
        cancel: &CancellationToken,
    ) -> Result<AuthenticatedUser, AuthFlowError> {
        let options = RetryOptions {
            on_retry: Some(&log_retry),
            cancel: Some(cancel.clone()),
        };
        let address = ticket.address.as_str();

        self.run_step(ticket, AuthStep::ConnectWallet, || async {
            let current = self.wallet.state();
            if current.connected_address().is_none() {
                return Err(AuthFlowError::WalletDisconnected);
            }
            self.machine
                .validate_connection(ticket, &current)
                .map_err(AuthFlowError::from)
        })
        .await?;

        self.run_step(ticket, AuthStep::AcquireLock, || async {
            self.machine
                .validate_connection(ticket, &self.wallet.state())
                .map_err(AuthFlowError::from)
        })
        .await?;

        let request = self
            .run_step(ticket, AuthStep::GenerateMessage, || async {
                let body = GenerateAuthMessageRequest {
                    wallet_address: address.to_owned(),
                };
                let challenge = execute_with_error_policy(
                    || self.rpc.generate_auth_message(&body),
                    &RetryPolicy::standard(),
                    options.clone(),
                )
                .await?
                .into_result()
                .map_err(|e| AuthFlowError::step_failure(AuthStep::GenerateMessage, e))?;
                Ok::<_, AuthFlowError>(SignatureRequest::from_challenge(
                    address,
                    wallet.chain_id,
                    challenge,
                ))
            })
            .await?;

        let signature = self
            .run_step(ticket, AuthStep::RequestSignature, || async {
                let signature_type = self.signer.signature_type();
                let policy = policy_for_wallet(signature_type, is_first_attempt);
                let signature = execute_with_retry(
                    || self.sign(signature_type, &request),
                    &policy,
                    options.clone(),
                )
                .await?
                .into_result()
                .map_err(|e| AuthFlowError::step_failure(AuthStep::RequestSignature, e))?;
                self.machine
                    .validate_connection(ticket, &self.wallet.state())?;
                Ok::<_, AuthFlowError>(signature)
            })
            .await?;

        let token = self
            .run_step(ticket, AuthStep::VerifySignature, || async {
                let body = VerifySignatureRequest::signed(&request, signature);
                let response = execute_with_error_policy(
                    || self.rpc.verify_signature_and_login(&body),
                    &RetryPolicy::standard(),
                    options.clone(),
                )
                .await?
                .into_result()
                .map_err(|e| AuthFlowError::step_failure(AuthStep::VerifySignature, e))?;
                self.machine
                    .validate_connection(ticket, &self.wallet.state())?;
                Ok::<_, AuthFlowError>(response.custom_token)
            })
            .await?;

        self.run_step(ticket, AuthStep::FirebaseAuth, || async {
            self.session
                .sign_in_with_custom_token(&token)
                .await
                .map_err(|e| AuthFlowError::step_failure(AuthStep::FirebaseAuth, e))
        })
        .await
    }

    async fn sign(
        &self,
        signature_type: SignatureType,
        request: &SignatureRequest,
    ) -> Result<String, S::Error> {
        match signature_type {
            SignatureType::PersonalSign => self.signer.sign_message(&request.message).await,
            SignatureType::TypedData => self.signer.sign_typed_data(&request.typed_data()).await,
            SignatureType::SafeWallet => {
                let signature = self.signer.sign_message(&request.message).await?;
                Ok(request.safe_envelope(&signature))
            }
        }
    }

    /// Runs one step and records its failure, whatever the cause, so the
    /// lock never outlives a failed attempt.
    async fn run_step<T, F, Fut>(
        &self,
        ticket: &LockTicket,
        step: AuthStep,
        body: F,
    ) -> Result<T, AuthFlowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AuthFlowError>>,
    {
        let result = self.drive_step(ticket, step, body).await;
        if let Err(error) = &result {
            self.record_failure(ticket, step, error).await;
        }
        result
    }

    async fn drive_step<T, F, Fut>(
        &self,
        ticket: &LockTicket,
        step: AuthStep,
        body: F,
    ) -> Result<T, AuthFlowError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, AuthFlowError>>,
    {
        self.machine.ensure_owned(ticket)?;
        self.machine.start_step(step)?;
        let result = if step == AuthStep::AcquireLock {
            self.executor.execute_lock_step(body).await
        } else {
            self.executor
                .execute_step(step, body, self.executor.paced())
                .await
        };
        let value = result?;
        if self.machine.owns_lock(ticket) {
            self.machine.complete_step(step)?;
        }
        Ok(value)
    }

    async fn record_failure(&self, ticket: &LockTicket, step: AuthStep, error: &AuthFlowError) {
        if !self.machine.owns_lock(ticket) {
            tracing::debug!(%step, "Attempt was reset, dropping its failure");
            return;
        }
        let message = error.to_string();
        tracing::warn!(
            %step,
            category = %error.category(),
            error = %message,
            "Wallet authentication failed"
        );
        if self.machine.fail_step(step, message.as_str()).is_err() {
            self.machine.abort(message.as_str());
        }

        if is_session_corruption(&message) {
            tracing::warn!("Wallet session looks corrupted, clearing it");
            if let Err(e) = self.wallet.clear_stale_sessions().await {
                tracing::warn!(error = %e, "Failed to clear stale wallet sessions");
            }
            if let Err(e) = self.session.sign_out().await {
                tracing::warn!(error = %e, "Failed to sign out of the session backend");
            }
            if let Err(e) = self.wallet.disconnect().await {
                tracing::warn!(error = %e, "Failed to disconnect wallet");
            }
        }
    }

    /// Ends the session and abandons any running attempt.
    ///
    /// # Errors
    ///
    /// Returns the session backend's error. The machine is reset regardless.
    pub async fn sign_out(&self) -> Result<(), B::Error> {
        self.reset();
        self.session.sign_out().await
    }
}

impl<W, S, R, B> AuthenticationOrchestrator<W, S, R, B>
where
    W: WalletConnection + 'static,
    S: MessageSigner + 'static,
    R: AuthRpc + 'static,
    B: SessionBackend + 'static,
{
    /// Spawns a task that forwards wallet changes to
    /// [`handle_wallet_change`](Self::handle_wallet_change). A disconnect also
    /// ends the backend session.
    ///
    /// The task ends when the orchestrator is dropped or the wallet stops
    /// publishing.
    pub fn spawn_wallet_watcher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut changes = self.wallet.subscribe();
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let state = changes.borrow_and_update().clone();
                let Some(this) = weak.upgrade() else { break };
                let disconnected = !state.is_connected;
                this.handle_wallet_change(state);
                if disconnected && this.session.current_user().is_some() {
                    let signed_out = this.session.sign_out().await;
                    if let Err(e) = signed_out {
                        tracing::warn!(error = %e, "Failed to sign out after wallet disconnect");
                    }
                }
            }
        })
    }
}
