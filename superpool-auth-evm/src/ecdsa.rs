//! Signer recovery for externally owned accounts.

use std::str::FromStr;

use alloy_primitives::{Address, Signature, U256, hex};
use alloy_sol_types::SolStruct;
use superpool_auth::proto::SignatureRequest;

use crate::contract::{Authentication, auth_domain};

/// Signature could not be checked against the wallet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    /// Not a 65-byte hex ECDSA signature.
    #[error("invalid signature encoding: {0}")]
    Encoding(String),
    /// Recovery failed.
    #[error("failed to recover signer: {0}")]
    Recovery(String),
    /// The recovered signer differs from the wallet.
    #[error("signature was produced by {recovered}, not {expected}")]
    SignerMismatch {
        /// Wallet that claimed the signature.
        expected: Address,
        /// Address recovered from the signature.
        recovered: Address,
    },
}

fn parse_signature(signature: &str) -> Result<Signature, SignatureError> {
    let bytes = hex::decode(signature).map_err(|e| SignatureError::Encoding(e.to_string()))?;
    if bytes.len() != 65 {
        return Err(SignatureError::Encoding(format!(
            "expected 65 bytes, got {}",
            bytes.len()
        )));
    }
    Signature::from_raw(&bytes).map_err(|e| SignatureError::Encoding(e.to_string()))
}

/// Recovers the `personal_sign` (EIP-191) signer of `message`.
///
/// # Errors
///
/// Returns [`SignatureError`] if the signature is malformed or unrecoverable.
pub fn recover_personal_signer(message: &str, signature: &str) -> Result<Address, SignatureError> {
    parse_signature(signature)?
        .recover_address_from_msg(message)
        .map_err(|e| SignatureError::Recovery(e.to_string()))
}

/// EIP-712 hash of the typed-data form of `request`.
///
/// # Errors
///
/// Returns [`SignatureError::Encoding`] if the wallet address does not parse.
pub fn typed_data_hash(
    request: &SignatureRequest,
) -> Result<alloy_primitives::B256, SignatureError> {
    let wallet = Address::from_str(&request.wallet_address)
        .map_err(|e| SignatureError::Encoding(e.to_string()))?;
    let payload = Authentication {
        wallet,
        nonce: request.nonce.clone(),
        timestamp: U256::from(request.timestamp.as_millis()),
        message: request.message.clone(),
    };
    Ok(payload.eip712_signing_hash(&auth_domain(request.chain_id)))
}

/// Recovers the EIP-712 signer of the typed-data form of `request`.
///
/// # Errors
///
/// Returns [`SignatureError`] if the signature is malformed or unrecoverable.
pub fn recover_typed_signer(
    request: &SignatureRequest,
    signature: &str,
) -> Result<Address, SignatureError> {
    let hash = typed_data_hash(request)?;
    parse_signature(signature)?
        .recover_address_from_prehash(&hash)
        .map_err(|e| SignatureError::Recovery(e.to_string()))
}

/// Checks that `signature` over `request` was produced by `expected`.
///
/// Both the `personal_sign` form of the message and its typed-data form are
/// accepted.
///
/// # Errors
///
/// Returns [`SignatureError::SignerMismatch`] when neither form recovers to
/// `expected`, or the parse error when the signature is malformed.
pub fn verify_eoa_signature(
    request: &SignatureRequest,
    signature: &str,
    expected: Address,
) -> Result<(), SignatureError> {
    let recovered = recover_personal_signer(&request.message, signature)?;
    if recovered == expected {
        return Ok(());
    }
    match recover_typed_signer(request, signature) {
        Ok(typed) if typed == expected => Ok(()),
        _ => Err(SignatureError::SignerMismatch {
            expected,
            recovered,
        }),
    }
}

#[cfg(test)]
mod tests {
    use alloy_signer::SignerSync;
    use alloy_signer_local::PrivateKeySigner;
    use superpool_auth::timestamp::EpochMillis;

    use super::*;

    fn request(signer: &PrivateKeySigner) -> SignatureRequest {
        SignatureRequest {
            wallet_address: signer.address().to_checksum(None),
            chain_id: Some(1),
            message: "Welcome to SuperPool!".into(),
            nonce: "n1".into(),
            timestamp: EpochMillis::from_millis(1_700_000_000_000),
        }
    }

    #[test]
    fn test_personal_sign_round_trip() {
        let signer = PrivateKeySigner::random();
        let request = request(&signer);
        let signature = signer.sign_message_sync(request.message.as_bytes()).unwrap();
        let encoded = hex::encode_prefixed(signature.as_bytes());

        assert_eq!(
            recover_personal_signer(&request.message, &encoded).unwrap(),
            signer.address()
        );
        assert!(verify_eoa_signature(&request, &encoded, signer.address()).is_ok());

        let other = PrivateKeySigner::random().address();
        assert!(matches!(
            verify_eoa_signature(&request, &encoded, other),
            Err(SignatureError::SignerMismatch { .. })
        ));
    }

    #[test]
    fn test_typed_data_signature_accepted() {
        let signer = PrivateKeySigner::random();
        let request = request(&signer);
        let hash = typed_data_hash(&request).unwrap();
        let signature = signer.sign_hash_sync(&hash).unwrap();
        let encoded = hex::encode_prefixed(signature.as_bytes());
        assert!(verify_eoa_signature(&request, &encoded, signer.address()).is_ok());
    }

    #[test]
    fn test_malformed_signatures() {
        assert!(matches!(
            recover_personal_signer("m", "0x1234"),
            Err(SignatureError::Encoding(_))
        ));
        assert!(matches!(
            recover_personal_signer("m", "not hex"),
            Err(SignatureError::Encoding(_))
        ));
    }
}
