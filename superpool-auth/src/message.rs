//! Canonical challenge message.
//!
//! The server recomputes this text byte-for-byte during verification, so the
//! field order and line breaks below are part of the protocol.

use crate::timestamp::EpochMillis;

/// Builds the challenge text a wallet is asked to sign.
#[must_use]
pub fn create_auth_message(wallet_address: &str, nonce: &str, timestamp: EpochMillis) -> String {
    format!(
        "Welcome to SuperPool!\n\nThis request will not trigger a blockchain transaction.\n\nWallet address:\n{wallet_address}\n\nNonce:\n{nonce}\nTimestamp:\n{timestamp}"
    )
}
