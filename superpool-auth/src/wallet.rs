//! Traits for the collaborators the orchestrator drives: the wallet
//! connection, the wallet's signer, and the session backend.

use std::future::Future;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::proto::{AuthenticatedUser, SignatureType};

/// What the wallet-connection layer currently reports.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WalletState {
    /// Whether an account is connected.
    pub is_connected: bool,
    /// Connected account.
    pub address: Option<String>,
    /// Connected chain.
    pub chain_id: Option<u64>,
}

impl WalletState {
    /// A connected wallet on `chain_id`.
    #[must_use]
    pub fn connected(address: impl Into<String>, chain_id: Option<u64>) -> Self {
        Self {
            is_connected: true,
            address: Some(address.into()),
            chain_id,
        }
    }

    /// Connected address, if the wallet is connected and reports one.
    #[must_use]
    pub fn connected_address(&self) -> Option<&str> {
        if self.is_connected {
            self.address.as_deref().filter(|a| !a.is_empty())
        } else {
            None
        }
    }
}

/// Wallet-connection layer.
pub trait WalletConnection: Send + Sync {
    /// Error raised by `disconnect` or session cleanup.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Current connection state.
    fn state(&self) -> WalletState;

    /// Receiver that observes every connection change.
    fn subscribe(&self) -> watch::Receiver<WalletState>;

    /// Disconnects the wallet.
    fn disconnect(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;

    /// Drops persisted relay sessions that the wallet SDK can no longer use.
    fn clear_stale_sessions(&self) -> impl Future<Output = Result<(), Self::Error>> + Send {
        async { Ok(()) }
    }
}

/// Off-chain signer exposed by the wallet SDK.
pub trait MessageSigner: Send + Sync {
    /// Rejections and timeouts. Display text goes through the categorizer.
    type Error: std::error::Error + Send + Sync + 'static;

    /// How this signer signs challenges.
    fn signature_type(&self) -> SignatureType {
        SignatureType::PersonalSign
    }

    /// Signs `message` and returns the wallet's signature string.
    fn sign_message(&self, message: &str)
    -> impl Future<Output = Result<String, Self::Error>> + Send;

    /// Signs EIP-712 typed data given in its JSON form.
    fn sign_typed_data(
        &self,
        typed_data: &serde_json::Value,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send;
}

/// Session backend that accepts custom tokens.
pub trait SessionBackend: Send + Sync {
    /// Sign-in failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Identity of an existing session, if one is active.
    fn current_user(&self) -> Option<AuthenticatedUser>;

    /// Exchanges a server-issued custom token for a session.
    fn sign_in_with_custom_token(
        &self,
        token: &str,
    ) -> impl Future<Output = Result<AuthenticatedUser, Self::Error>> + Send;

    /// Ends the current session.
    fn sign_out(&self) -> impl Future<Output = Result<(), Self::Error>> + Send;
}

/// Markers the wallet relay uses when a persisted session is unusable.
const STALE_SESSION_MARKERS: &[&str] = &[
    "no matching key",
    "session topic",
    "pairing",
    "record was recently deleted",
    "missing or invalid",
];

/// Whether `message` indicates a corrupted wallet relay session.
#[must_use]
pub fn is_session_corruption(message: &str) -> bool {
    let lowered = message.to_lowercase();
    STALE_SESSION_MARKERS.iter().any(|m| lowered.contains(m))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connected_address() {
        let state = WalletState::connected("0xabc", Some(1));
        assert_eq!(state.connected_address(), Some("0xabc"));

        let disconnected = WalletState {
            is_connected: false,
            ..state.clone()
        };
        assert_eq!(disconnected.connected_address(), None);

        let blank = WalletState::connected("", Some(1));
        assert_eq!(blank.connected_address(), None);
    }

    #[test]
    fn test_session_corruption_markers() {
        assert!(is_session_corruption(
            "No matching key. session topic doesn't exist: 4f1c"
        ));
        assert!(is_session_corruption(
            "Missing or invalid. Record was recently deleted - pairing: 99"
        ));
        assert!(!is_session_corruption("User rejected the request"));
    }
}
