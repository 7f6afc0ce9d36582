//! [`MessageSigner`] backed by a local private key.
//!
//! Used by integration tests, scripts and headless agents that hold their own
//! key instead of going through a wallet SDK.

use alloy_primitives::hex;
use alloy_signer::Signer;
use alloy_signer_local::PrivateKeySigner;
use serde::Deserialize;
use superpool_auth::proto::{SignatureRequest, SignatureType};
use superpool_auth::timestamp::EpochMillis;
use superpool_auth::wallet::MessageSigner;

use crate::ecdsa::typed_data_hash;

/// Failure signing with a local key.
#[derive(Debug, thiserror::Error)]
pub enum LocalSignerError {
    /// The key could not sign.
    #[error(transparent)]
    Signer(#[from] alloy_signer::Error),
    /// The typed data is not an `Authentication` payload.
    #[error("unsupported typed data: {0}")]
    TypedData(String),
}

/// Signs challenges with a [`PrivateKeySigner`].
#[derive(Debug, Clone)]
pub struct LocalMessageSigner {
    inner: PrivateKeySigner,
    signature_type: SignatureType,
}

impl LocalMessageSigner {
    /// A `personal_sign` signer for `key`.
    #[must_use]
    pub const fn new(key: PrivateKeySigner) -> Self {
        Self {
            inner: key,
            signature_type: SignatureType::PersonalSign,
        }
    }

    /// Signs with `signature_type` instead of `personal_sign`.
    #[must_use]
    pub const fn with_signature_type(mut self, signature_type: SignatureType) -> Self {
        self.signature_type = signature_type;
        self
    }

    /// Checksummed address of the key.
    #[must_use]
    pub fn address(&self) -> String {
        self.inner.address().to_checksum(None)
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypedDomain {
    #[serde(default)]
    chain_id: Option<u64>,
}

#[derive(Deserialize)]
struct TypedMessage {
    wallet: String,
    nonce: String,
    timestamp: EpochMillis,
    message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TypedPayload {
    primary_type: String,
    domain: TypedDomain,
    message: TypedMessage,
}

fn request_from_typed_data(
    value: &serde_json::Value,
) -> Result<SignatureRequest, LocalSignerError> {
    let payload = TypedPayload::deserialize(value)
        .map_err(|e| LocalSignerError::TypedData(e.to_string()))?;
    if payload.primary_type != "Authentication" {
        return Err(LocalSignerError::TypedData(format!(
            "primary type {}",
            payload.primary_type
        )));
    }
    Ok(SignatureRequest {
        wallet_address: payload.message.wallet,
        chain_id: payload.domain.chain_id,
        message: payload.message.message,
        nonce: payload.message.nonce,
        timestamp: payload.message.timestamp,
    })
}

impl MessageSigner for LocalMessageSigner {
    type Error = LocalSignerError;

    fn signature_type(&self) -> SignatureType {
        self.signature_type
    }

    async fn sign_message(&self, message: &str) -> Result<String, LocalSignerError> {
        let signature = self.inner.sign_message(message.as_bytes()).await?;
        Ok(hex::encode_prefixed(signature.as_bytes()))
    }

    async fn sign_typed_data(
        &self,
        typed_data: &serde_json::Value,
    ) -> Result<String, LocalSignerError> {
        let request = request_from_typed_data(typed_data)?;
        let hash = typed_data_hash(&request)
            .map_err(|e| LocalSignerError::TypedData(e.to_string()))?;
        let signature = self.inner.sign_hash(&hash).await?;
        Ok(hex::encode_prefixed(signature.as_bytes()))
    }
}
