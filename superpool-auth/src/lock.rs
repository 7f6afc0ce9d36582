//! Single-attempt authentication lock and connection-state snapshots.
//!
//! Only one sign-in may run per orchestrator. The lock is a mutex-guarded
//! test-and-set, so a duplicate trigger (a re-render, a repeated effect)
//! observes the held lock and backs off before prompting the wallet.
//!
//! Alongside the lock, every observed wallet state gets a sequence number.
//! The snapshot captured when the lock was taken is compared with fresh
//! snapshots after each suspension point; if the user switched account or
//! network in between, the comparison fails and the flow aborts.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};

use crate::timestamp::EpochMillis;
use crate::wallet::WalletState;

/// Immutable view of the wallet at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    /// Whether an account was connected.
    pub is_connected: bool,
    /// Connected account.
    pub address: Option<String>,
    /// Connected chain.
    pub chain_id: Option<u64>,
    /// Capture time.
    pub timestamp: EpochMillis,
    /// Position in the capture order.
    pub sequence_number: u64,
}

/// Why a later snapshot is not consistent with the locked one.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectionDrift {
    /// The wallet connected or disconnected.
    #[error("connection state changed: wallet connection toggled")]
    Connection,
    /// A different account is now selected.
    #[error("connection state changed: wallet address changed")]
    Address,
    /// The wallet moved to another chain.
    #[error("connection state changed: chain changed")]
    Chain,
    /// The snapshot predates the locked one.
    #[error("connection state changed: stale snapshot (sequence {later} < {locked})")]
    Stale {
        /// Sequence number captured with the lock.
        locked: u64,
        /// Sequence number of the rejected snapshot.
        later: u64,
    },
}

impl ConnectionSnapshot {
    /// Checks that `later` describes the same wallet identity as `self`.
    ///
    /// Addresses are compared case-insensitively.
    ///
    /// # Errors
    ///
    /// Returns the first [`ConnectionDrift`] found.
    pub fn check_consistent(&self, later: &Self) -> Result<(), ConnectionDrift> {
        if later.sequence_number < self.sequence_number {
            return Err(ConnectionDrift::Stale {
                locked: self.sequence_number,
                later: later.sequence_number,
            });
        }
        if self.is_connected != later.is_connected {
            return Err(ConnectionDrift::Connection);
        }
        let same_address = match (&self.address, &later.address) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        };
        if !same_address {
            return Err(ConnectionDrift::Address);
        }
        if self.chain_id != later.chain_id {
            return Err(ConnectionDrift::Chain);
        }
        Ok(())
    }
}

/// Lock state as exposed to callers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthLock {
    /// Whether an attempt holds the lock.
    pub is_locked: bool,
    /// Account the lock was taken for.
    pub locked_wallet_address: Option<String>,
    /// When the lock was taken.
    pub locked_at: Option<EpochMillis>,
}

/// The lock is already held.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("authentication already in progress for {held_by}")]
pub struct LockHeld {
    /// Account holding the lock.
    pub held_by: String,
}

/// Proof of lock ownership returned by [`ConnectionGuard::try_acquire`].
///
/// The generation changes whenever the guard is reset, so a flow that was
/// overtaken by a reset can tell its ticket is no longer current.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockTicket {
    /// Account the lock was taken for.
    pub address: String,
    /// Wallet snapshot at acquisition.
    pub snapshot: ConnectionSnapshot,
    generation: u64,
}

#[derive(Debug, Default)]
struct GuardState {
    lock: AuthLock,
    locked_snapshot: Option<ConnectionSnapshot>,
    generation: u64,
}

/// Owner of the authentication lock and the snapshot sequence counter.
#[derive(Debug, Default)]
pub struct ConnectionGuard {
    state: Mutex<GuardState>,
    sequence: AtomicU64,
}

impl ConnectionGuard {
    /// Creates an unlocked guard with the counter at zero.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stamps `wallet` with the next sequence number.
    pub fn capture(&self, wallet: &WalletState) -> ConnectionSnapshot {
        let sequence_number = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
        ConnectionSnapshot {
            is_connected: wallet.is_connected,
            address: wallet.address.clone(),
            chain_id: wallet.chain_id,
            timestamp: EpochMillis::now(),
            sequence_number,
        }
    }

    /// Takes the lock for `address` and records the wallet snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`LockHeld`] if any attempt already holds the lock. Nothing is
    /// modified in that case.
    pub fn try_acquire(&self, address: &str, wallet: &WalletState) -> Result<LockTicket, LockHeld> {
        let mut state = self.state();
        if state.lock.is_locked {
            return Err(LockHeld {
                held_by: state.lock.locked_wallet_address.clone().unwrap_or_default(),
            });
        }
        let snapshot = self.capture(wallet);
        state.lock = AuthLock {
            is_locked: true,
            locked_wallet_address: Some(address.to_owned()),
            locked_at: Some(snapshot.timestamp),
        };
        state.locked_snapshot = Some(snapshot.clone());
        tracing::debug!(
            address,
            sequence = snapshot.sequence_number,
            "Authentication lock acquired"
        );
        Ok(LockTicket {
            address: address.to_owned(),
            snapshot,
            generation: state.generation,
        })
    }

    /// Releases the lock if held. The sequence counter is left untouched.
    pub fn release(&self) {
        let mut state = self.state();
        if state.lock.is_locked {
            tracing::debug!(
                address = state.lock.locked_wallet_address.as_deref().unwrap_or_default(),
                "Authentication lock released"
            );
        }
        state.lock = AuthLock::default();
        state.locked_snapshot = None;
    }

    /// Releases the lock, invalidates outstanding tickets and zeroes the counter.
    pub fn reset(&self) {
        let mut state = self.state();
        state.lock = AuthLock::default();
        state.locked_snapshot = None;
        state.generation = state.generation.wrapping_add(1);
        self.sequence.store(0, Ordering::SeqCst);
    }

    /// Current lock state.
    #[must_use]
    pub fn lock(&self) -> AuthLock {
        self.state().lock.clone()
    }

    /// Whether the lock is held.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.state().lock.is_locked
    }

    /// Whether `ticket` still owns the lock.
    #[must_use]
    pub fn is_current(&self, ticket: &LockTicket) -> bool {
        let state = self.state();
        state.lock.is_locked && state.generation == ticket.generation
    }

    /// Fails with [`ConnectionDrift::Stale`] unless `ticket` still owns the lock.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionDrift::Stale`] after a release or reset.
    pub fn ensure_current(&self, ticket: &LockTicket) -> Result<(), ConnectionDrift> {
        if self.is_current(ticket) {
            Ok(())
        } else {
            Err(ConnectionDrift::Stale {
                locked: ticket.snapshot.sequence_number,
                later: self.sequence.load(Ordering::SeqCst),
            })
        }
    }

    /// Re-validates the wallet against the snapshot stored with `ticket`.
    ///
    /// # Errors
    ///
    /// Returns [`ConnectionDrift`] if the lock was reset or released since the
    /// ticket was issued, or if the wallet identity changed.
    pub fn validate(
        &self,
        ticket: &LockTicket,
        wallet: &WalletState,
    ) -> Result<(), ConnectionDrift> {
        self.ensure_current(ticket)?;
        let current = self.capture(wallet);
        ticket.snapshot.check_consistent(&current)
    }
}
