//! Background tasks and shutdown coordination.

use std::time::Duration;

use superpool_auth::timestamp::EpochMillis;
use superpool_auth_evm::nonce::NonceStore;
use superpool_auth_evm::token::TokenIssuer;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::handlers::AuthState;

/// Cancels a token on SIGTERM / SIGINT (Ctrl-C elsewhere) and tracks the
/// tasks that must finish before the process exits.
#[allow(missing_debug_implementations)]
pub struct Shutdown {
    tracker: TaskTracker,
    token: CancellationToken,
}

impl Shutdown {
    /// Installs the signal listener.
    ///
    /// # Errors
    ///
    /// Returns an [`std::io::Error`] if signal registration fails.
    #[allow(clippy::unnecessary_wraps)]
    pub fn install() -> Result<Self, std::io::Error> {
        let token = CancellationToken::new();
        let tracker = TaskTracker::new();
        let trigger = token.clone();

        #[cfg(unix)]
        {
            use tokio::signal::unix::{SignalKind, signal};
            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            tracker.spawn(async move {
                tokio::select! {
                    _ = sigterm.recv() => tracing::info!("Received SIGTERM, shutting down"),
                    _ = sigint.recv() => tracing::info!("Received SIGINT, shutting down"),
                    () = trigger.cancelled() => return,
                }
                trigger.cancel();
            });
        }

        #[cfg(not(unix))]
        {
            tracker.spawn(async move {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => tracing::info!("Received Ctrl-C, shutting down"),
                    () = trigger.cancelled() => return,
                }
                trigger.cancel();
            });
        }

        Ok(Self { tracker, token })
    }

    /// Token cancelled when shutdown begins.
    #[must_use]
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Tracker for tasks that must drain before exit.
    #[must_use]
    pub const fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Begins shutdown and waits for every tracked task.
    pub async fn drain(self) {
        self.token.cancel();
        self.tracker.close();
        self.tracker.wait().await;
    }
}

/// Periodically drops expired challenges and session tokens until `token` is
/// cancelled.
pub fn spawn_expiry_purge(
    tracker: &TaskTracker,
    state: AuthState,
    every: Duration,
    token: CancellationToken,
) {
    let every = every.max(Duration::from_secs(1));
    tracker.spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                () = token.cancelled() => break,
                _ = ticker.tick() => {
                    let now = EpochMillis::now();
                    let challenges = state.nonces().purge_expired(now).await;
                    let tokens = state.tokens().purge_expired(now).await;
                    if challenges + tokens > 0 {
                        tracing::debug!(challenges, tokens, "Dropped expired records");
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use superpool_auth::proto::AuthenticatedUser;
    use superpool_auth_evm::{AuthVerifier, RpcSafeSource, SafeWalletVerifier};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_purge_drops_expired_records() {
        let state: AuthState = Arc::new(AuthVerifier::new(SafeWalletVerifier::new(
            RpcSafeSource::new(),
        )));
        state
            .issue_challenge(
                "0x742d35Cc6634C0532925a3b844Bc454e4438f44e",
                EpochMillis::from_millis(0),
            )
            .await
            .unwrap();
        let user = AuthenticatedUser {
            uid: "0x742d35cc6634c0532925a3b844bc454e4438f44e".into(),
            wallet_address: "0x742d35Cc6634C0532925a3b844Bc454e4438f44e".into(),
        };
        state
            .tokens()
            .issue_token(&user, EpochMillis::from_millis(0))
            .await
            .unwrap();
        assert_eq!(state.nonces().len(), 1);
        assert_eq!(state.tokens().len(), 1);

        let tracker = TaskTracker::new();
        let token = CancellationToken::new();
        spawn_expiry_purge(
            &tracker,
            Arc::clone(&state),
            Duration::from_secs(60),
            token.clone(),
        );
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert!(state.nonces().is_empty());
        assert!(state.tokens().is_empty());

        token.cancel();
        tracker.close();
        tracker.wait().await;
    }
}
