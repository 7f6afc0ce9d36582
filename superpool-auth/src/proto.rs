//! Wire types and the abstract server RPC surface.
//!
//! The backend exposes two callables, `generateAuthMessage` and
//! `verifySignatureAndLogin`. [`AuthRpc`] describes them independent of
//! transport; the HTTP client and the in-process verifier both implement it.

use std::fmt::Display;
use std::future::Future;

use serde::{Deserialize, Serialize};

use crate::timestamp::EpochMillis;

/// How the wallet produced its signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignatureType {
    /// EIP-191 `personal_sign`.
    PersonalSign,
    /// EIP-712 typed data.
    TypedData,
    /// Safe multisig contract wallet, verified through EIP-1271.
    SafeWallet,
}

/// Body of `generateAuthMessage`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateAuthMessageRequest {
    /// Account requesting a challenge.
    pub wallet_address: String,
}

/// Challenge issued by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateAuthMessageResponse {
    /// Text to be signed.
    pub message: String,
    /// Single-use nonce bound into `message`.
    pub nonce: String,
    /// Issue time bound into `message`.
    pub timestamp: EpochMillis,
}

/// Everything the signing step needs, and everything verification consumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignatureRequest {
    /// Account that must sign.
    pub wallet_address: String,
    /// Chain the wallet was connected to when the challenge was issued.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
    /// Challenge text.
    pub message: String,
    /// Challenge nonce.
    pub nonce: String,
    /// Challenge timestamp.
    pub timestamp: EpochMillis,
}

impl SignatureRequest {
    /// Pairs a server challenge with the wallet identity it was issued for.
    #[must_use]
    pub fn from_challenge(
        wallet_address: impl Into<String>,
        chain_id: Option<u64>,
        challenge: GenerateAuthMessageResponse,
    ) -> Self {
        Self {
            wallet_address: wallet_address.into(),
            chain_id,
            message: challenge.message,
            nonce: challenge.nonce,
            timestamp: challenge.timestamp,
        }
    }

    /// Wraps a raw Safe owner signature in the `safe-wallet:` envelope that
    /// binds it to this challenge.
    #[must_use]
    pub fn safe_envelope(&self, signature: &str) -> String {
        format!(
            "{SAFE_SIGNATURE_PREFIX}{}:{}:{}:sig:{signature}",
            self.wallet_address, self.nonce, self.timestamp
        )
    }

    /// EIP-712 typed data for wallets that sign structured payloads.
    ///
    /// The domain carries `chainId` only when the chain is known.
    #[must_use]
    pub fn typed_data(&self) -> serde_json::Value {
        let mut domain_fields = vec![
            serde_json::json!({ "name": "name", "type": "string" }),
            serde_json::json!({ "name": "version", "type": "string" }),
        ];
        let mut domain = serde_json::json!({
            "name": TYPED_DATA_DOMAIN_NAME,
            "version": TYPED_DATA_DOMAIN_VERSION,
        });
        if let Some(chain_id) = self.chain_id {
            domain_fields.push(serde_json::json!({ "name": "chainId", "type": "uint256" }));
            domain["chainId"] = chain_id.into();
        }
        serde_json::json!({
            "types": {
                "EIP712Domain": domain_fields,
                "Authentication": [
                    { "name": "wallet", "type": "address" },
                    { "name": "nonce", "type": "string" },
                    { "name": "timestamp", "type": "uint256" },
                    { "name": "message", "type": "string" },
                ],
            },
            "primaryType": "Authentication",
            "domain": domain,
            "message": {
                "wallet": self.wallet_address,
                "nonce": self.nonce,
                "timestamp": self.timestamp.as_millis(),
                "message": self.message,
            },
        })
    }
}

/// Prefix of Safe wallet signature envelopes.
pub const SAFE_SIGNATURE_PREFIX: &str = "safe-wallet:";

/// EIP-712 domain name used for typed-data challenges.
pub const TYPED_DATA_DOMAIN_NAME: &str = "SuperPool";

/// EIP-712 domain version used for typed-data challenges.
pub const TYPED_DATA_DOMAIN_VERSION: &str = "1";

/// Body of `verifySignatureAndLogin`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySignatureRequest {
    /// Account claiming to have signed.
    pub wallet_address: String,
    /// Hex ECDSA signature, or a `safe-wallet:` envelope for Safe wallets.
    pub signature: String,
    /// Nonce from the challenge.
    pub nonce: String,
    /// Timestamp from the challenge.
    pub timestamp: EpochMillis,
    /// Challenge text as signed.
    pub message: String,
    /// Chain the wallet is connected to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<u64>,
}

impl VerifySignatureRequest {
    /// Builds the verification call for a signed challenge.
    #[must_use]
    pub fn signed(request: &SignatureRequest, signature: impl Into<String>) -> Self {
        Self {
            wallet_address: request.wallet_address.clone(),
            signature: signature.into(),
            nonce: request.nonce.clone(),
            timestamp: request.timestamp,
            message: request.message.clone(),
            chain_id: request.chain_id,
        }
    }
}

/// Token returned after a successful verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifySignatureResponse {
    /// Custom token to exchange with the session backend.
    pub custom_token: String,
}

/// Body of a custom-token redemption, sent by the session backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RedeemTokenRequest {
    /// Token previously returned by `verifySignatureAndLogin`.
    pub custom_token: String,
}

/// Signed-in identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthenticatedUser {
    /// Backend user id. Wallet sign-ins use the lower-cased address.
    pub uid: String,
    /// Wallet that authenticated.
    pub wallet_address: String,
}

/// The two backend callables used during sign-in.
pub trait AuthRpc: Send + Sync {
    /// Transport or backend failure. The display text is fed to the error
    /// categorizer, so it should carry the upstream message.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Requests a challenge for `request.wallet_address`.
    fn generate_auth_message(
        &self,
        request: &GenerateAuthMessageRequest,
    ) -> impl Future<Output = Result<GenerateAuthMessageResponse, Self::Error>> + Send;

    /// Submits a signed challenge and receives a custom token.
    fn verify_signature_and_login(
        &self,
        request: &VerifySignatureRequest,
    ) -> impl Future<Output = Result<VerifySignatureResponse, Self::Error>> + Send;
}

/// Error body returned by the backend on failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Human-readable error.
    pub error: String,
}

impl ErrorBody {
    /// Wraps any displayable error.
    #[must_use]
    pub fn new(error: &impl Display) -> Self {
        Self {
            error: error.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_request_wire_names() {
        let request = VerifySignatureRequest {
            wallet_address: "0xabc".into(),
            signature: "0xsig".into(),
            nonce: "n1".into(),
            timestamp: EpochMillis::from_millis(7),
            message: "hello".into(),
            chain_id: None,
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "walletAddress": "0xabc",
                "signature": "0xsig",
                "nonce": "n1",
                "timestamp": 7,
                "message": "hello"
            })
        );
    }

    #[test]
    fn test_signed_copies_challenge_fields() {
        let challenge = GenerateAuthMessageResponse {
            message: "m".into(),
            nonce: "n".into(),
            timestamp: EpochMillis::from_millis(9),
        };
        let request = SignatureRequest::from_challenge("0xabc", Some(137), challenge);
        let verify = VerifySignatureRequest::signed(&request, "0x01");
        assert_eq!(verify.nonce, "n");
        assert_eq!(verify.timestamp.as_millis(), 9);
        assert_eq!(verify.chain_id, Some(137));
        assert_eq!(verify.signature, "0x01");
    }

    #[test]
    fn test_safe_envelope_and_typed_data() {
        let request = SignatureRequest {
            wallet_address: "0xsafe".into(),
            chain_id: None,
            message: "m".into(),
            nonce: "n".into(),
            timestamp: EpochMillis::from_millis(5),
        };
        assert_eq!(request.safe_envelope("0xdead"), "safe-wallet:0xsafe:n:5:sig:0xdead");

        let typed = request.typed_data();
        assert_eq!(typed["primaryType"], "Authentication");
        assert_eq!(typed["message"]["timestamp"], 5);
        assert!(typed["domain"].get("chainId").is_none());

        let on_chain = SignatureRequest {
            chain_id: Some(137),
            ..request
        };
        assert_eq!(on_chain.typed_data()["domain"]["chainId"], 137);
        assert_eq!(
            on_chain.typed_data()["types"]["EIP712Domain"]
                .as_array()
                .map(Vec::len),
            Some(3)
        );
    }
}
