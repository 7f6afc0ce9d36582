//! Safe multisig wallet verification through EIP-1271.
//!
//! [`SafeWalletVerifier::verify`] runs the full pipeline for a
//! `safe-wallet:` envelope:
//!
//! 1. The wallet address must parse.
//! 2. The envelope must carry signature bytes and match the challenge.
//! 3. The contract's `VERSION` must be in the supported list.
//! 4. Owners, threshold and (optionally) ownership of an expected signer are
//!    read in parallel. Failed reads fall back to values that fail the check.
//! 5. The contract must look like a Safe (version, positive threshold,
//!    non-empty owners, all read successfully) before the `isValidSignature`
//!    result over the EIP-191 hash of the canonical message is trusted.
//!
//! Anything that cannot be completed against the chain ends on the fallback
//! path, which is diagnostic only and never yields `is_valid = true`.

use std::future::Future;
use std::str::FromStr;

use alloy_primitives::{Address, B256, Bytes, FixedBytes, U256, eip191_hash_message};
use alloy_provider::Provider;
use alloy_transport::TransportError;
use serde::{Deserialize, Serialize};
use superpool_auth::message::create_auth_message;
use superpool_auth::timestamp::EpochMillis;

use crate::contract::{EIP1271_MAGIC_VALUE, ISafe};
use crate::envelope::SafeEnvelope;

/// Safe singleton versions whose EIP-1271 behaviour is known.
pub const SUPPORTED_SAFE_VERSIONS: &[&str] =
    &["1.0.0", "1.1.1", "1.2.0", "1.3.0", "1.4.0", "1.4.1"];

/// Failure reading from a Safe contract.
#[derive(Debug, thiserror::Error)]
pub enum SafeCallError {
    /// RPC transport error.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The call reverted, or the contract does not implement it.
    #[error("Safe contract call failed: {0}")]
    Contract(String),
}

impl From<alloy_contract::Error> for SafeCallError {
    fn from(e: alloy_contract::Error) -> Self {
        match e {
            alloy_contract::Error::TransportError(e) => Self::Transport(e),
            other => Self::Contract(other.to_string()),
        }
    }
}

/// Read access to a deployed Safe.
pub trait SafeContract: Send + Sync {
    /// Address of the Safe.
    fn address(&self) -> Address;

    /// `VERSION()`.
    fn version(&self) -> impl Future<Output = Result<String, SafeCallError>> + Send;

    /// `getThreshold()`.
    fn threshold(&self) -> impl Future<Output = Result<U256, SafeCallError>> + Send;

    /// `getOwners()`.
    fn owners(&self) -> impl Future<Output = Result<Vec<Address>, SafeCallError>> + Send;

    /// `isOwner(owner)`.
    fn is_owner(&self, owner: Address) -> impl Future<Output = Result<bool, SafeCallError>> + Send;

    /// `isValidSignature(hash, signature)`.
    fn is_valid_signature(
        &self,
        hash: B256,
        signature: Bytes,
    ) -> impl Future<Output = Result<FixedBytes<4>, SafeCallError>> + Send;
}

/// Hands out [`SafeContract`] handles for a chain.
pub trait SafeContractSource: Send + Sync {
    /// Contract handle type.
    type Contract: SafeContract;

    /// Handle for the Safe at `address` on `chain_id`, or `None` when the
    /// chain is not reachable.
    fn safe_at(&self, address: Address, chain_id: Option<u64>) -> Option<Self::Contract>;
}

/// [`SafeContract`] backed by an `alloy` provider.
#[derive(Debug, Clone)]
pub struct OnchainSafe<P>(ISafe::ISafeInstance<P>);

impl<P: Provider> OnchainSafe<P> {
    /// Binds the Safe ABI to `address` through `provider`.
    pub fn new(address: Address, provider: P) -> Self {
        Self(ISafe::ISafeInstance::new(address, provider))
    }
}

impl<P: Provider + Send + Sync> SafeContract for OnchainSafe<P> {
    fn address(&self) -> Address {
        *self.0.address()
    }

    async fn version(&self) -> Result<String, SafeCallError> {
        Ok(self.0.VERSION().call().await?)
    }

    async fn threshold(&self) -> Result<U256, SafeCallError> {
        Ok(self.0.getThreshold().call().await?)
    }

    async fn owners(&self) -> Result<Vec<Address>, SafeCallError> {
        Ok(self.0.getOwners().call().await?)
    }

    async fn is_owner(&self, owner: Address) -> Result<bool, SafeCallError> {
        Ok(self.0.isOwner(owner).call().await?)
    }

    async fn is_valid_signature(
        &self,
        hash: B256,
        signature: Bytes,
    ) -> Result<FixedBytes<4>, SafeCallError> {
        Ok(self.0.isValidSignature(hash, signature).call().await?)
    }
}

/// How a verification result was reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VerificationMethod {
    /// On-chain `isValidSignature` after Safe validation.
    Eip1271,
    /// Verification performed with the Safe SDK by a trusted component.
    SafeSdk,
    /// Chain interaction could not be completed; never valid.
    Fallback,
}

/// Machine-readable reason a Safe signature was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SafeVerificationError {
    /// The wallet address is not an EVM address.
    #[error("invalid Safe contract address")]
    InvalidContractAddress,
    /// The envelope is missing, legacy, malformed, or for another challenge.
    #[error("invalid Safe signature format")]
    InvalidSignatureFormat,
    /// The Safe reports a version outside the supported list.
    #[error("unsupported Safe version")]
    UnsupportedSafeVersion,
    /// The contract does not behave like a Safe.
    #[error("Safe contract validation failed")]
    ContractValidationFailed,
    /// `isValidSignature` did not return the magic value.
    #[error("Safe signature verification failed")]
    SignatureVerificationFailed,
    /// The expected signer is not an owner.
    #[error("Safe ownership verification failed")]
    OwnershipVerificationFailed,
    /// The Safe threshold is not satisfiable.
    #[error("Safe threshold not met")]
    ThresholdNotMet,
    /// The chain could not be queried.
    #[error("Safe verification unavailable")]
    VerificationUnavailable,
}

impl SafeVerificationError {
    /// Wire code of the error.
    #[must_use]
    pub const fn as_code(self) -> &'static str {
        match self {
            Self::InvalidContractAddress => "INVALID_CONTRACT_ADDRESS",
            Self::InvalidSignatureFormat => "INVALID_SIGNATURE_FORMAT",
            Self::UnsupportedSafeVersion => "UNSUPPORTED_SAFE_VERSION",
            Self::ContractValidationFailed => "CONTRACT_VALIDATION_FAILED",
            Self::SignatureVerificationFailed => "SIGNATURE_VERIFICATION_FAILED",
            Self::OwnershipVerificationFailed => "OWNERSHIP_VERIFICATION_FAILED",
            Self::ThresholdNotMet => "THRESHOLD_NOT_MET",
            Self::VerificationUnavailable => "VERIFICATION_UNAVAILABLE",
        }
    }
}

/// Individual checks behind a verdict.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeVerification {
    /// `isValidSignature` returned the magic value.
    pub signature_validation: bool,
    /// Ownership was proven.
    pub ownership_verification: bool,
    /// Threshold is positive and reachable by the owners.
    pub threshold_check: bool,
    /// `VERSION` is supported.
    pub safe_version_compatibility: bool,
    /// How the checks were run.
    pub verification_method: VerificationMethod,
    /// Address that was checked.
    pub contract_address: String,
}

/// Verdict of [`SafeWalletVerifier::verify`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeVerificationResult {
    /// All four checks passed.
    pub is_valid: bool,
    /// Individual checks.
    pub verification: SafeVerification,
    /// Reason for rejection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<SafeVerificationError>,
    /// Diagnostics for operators.
    #[serde(default)]
    pub warnings: Vec<String>,
}

impl SafeVerificationResult {
    fn rejected(
        contract_address: &str,
        method: VerificationMethod,
        error: SafeVerificationError,
        warnings: Vec<String>,
    ) -> Self {
        Self {
            is_valid: false,
            verification: SafeVerification {
                signature_validation: false,
                ownership_verification: false,
                threshold_check: false,
                safe_version_compatibility: false,
                verification_method: method,
                contract_address: contract_address.to_owned(),
            },
            error: Some(error),
            warnings,
        }
    }
}

/// State read from a Safe, with conservative defaults for failed reads.
#[derive(Debug)]
struct SafeState {
    is_owner: Option<bool>,
    threshold: U256,
    owners: Vec<Address>,
    complete: bool,
}

/// Verifies Safe envelopes against on-chain state.
#[derive(Debug, Clone)]
pub struct SafeWalletVerifier<S> {
    source: S,
    supported_versions: Vec<String>,
}

impl<S: SafeContractSource> SafeWalletVerifier<S> {
    /// Creates a verifier accepting [`SUPPORTED_SAFE_VERSIONS`].
    pub fn new(source: S) -> Self {
        Self::with_versions(
            source,
            SUPPORTED_SAFE_VERSIONS.iter().map(|v| (*v).to_owned()).collect(),
        )
    }

    /// Creates a verifier accepting only `supported_versions`.
    pub const fn with_versions(source: S, supported_versions: Vec<String>) -> Self {
        Self {
            source,
            supported_versions,
        }
    }

    fn is_supported(&self, version: &str) -> bool {
        self.supported_versions.iter().any(|v| v == version)
    }

    /// Verifies `signature` for the challenge `(wallet_address, nonce, timestamp)`.
    ///
    /// When `expected_owner` is given it must be an owner of the Safe;
    /// otherwise ownership means the Safe has at least one owner.
    #[tracing::instrument(skip_all, fields(wallet = wallet_address, chain_id = ?chain_id))]
    pub async fn verify(
        &self,
        wallet_address: &str,
        signature: &str,
        nonce: &str,
        timestamp: EpochMillis,
        chain_id: Option<u64>,
        expected_owner: Option<Address>,
    ) -> SafeVerificationResult {
        let Ok(address) = Address::from_str(wallet_address) else {
            return SafeVerificationResult::rejected(
                wallet_address,
                VerificationMethod::Fallback,
                SafeVerificationError::InvalidContractAddress,
                vec![format!("{wallet_address} is not a valid address")],
            );
        };

        let envelope = match SafeEnvelope::parse(signature, wallet_address, nonce, timestamp) {
            Ok(envelope) => envelope,
            Err(e) => {
                let warning = if e.is_legacy() {
                    "rejected old insecure Safe signature format; a signature segment is required"
                        .to_owned()
                } else {
                    e.to_string()
                };
                tracing::warn!(error = %e, "Rejected Safe signature envelope");
                return SafeVerificationResult::rejected(
                    wallet_address,
                    VerificationMethod::Fallback,
                    SafeVerificationError::InvalidSignatureFormat,
                    vec![warning],
                );
            }
        };

        let Some(safe) = self.source.safe_at(address, chain_id) else {
            return Self::fallback(
                wallet_address,
                &envelope,
                SafeVerificationError::VerificationUnavailable,
                false,
                format!("no RPC endpoint configured for chain {chain_id:?}"),
            );
        };

        let version = match safe.version().await {
            Ok(version) => version,
            Err(e) => {
                return Self::fallback(
                    wallet_address,
                    &envelope,
                    SafeVerificationError::VerificationUnavailable,
                    false,
                    format!("VERSION() failed: {e}"),
                );
            }
        };
        if !self.is_supported(&version) {
            return Self::fallback(
                wallet_address,
                &envelope,
                SafeVerificationError::UnsupportedSafeVersion,
                false,
                format!("unsupported Safe version {version}"),
            );
        }

        let state = Self::read_state(&safe, expected_owner).await;
        let threshold_check = state.threshold > U256::ZERO
            && state.threshold <= U256::from(state.owners.len());
        let ownership_verification = match state.is_owner {
            Some(is_owner) => is_owner,
            None => !state.owners.is_empty(),
        };
        let looks_like_safe =
            state.complete && state.threshold > U256::ZERO && !state.owners.is_empty();

        let mut warnings = Vec::new();
        let signature_validation = if looks_like_safe {
            let hash = eip191_hash_message(create_auth_message(wallet_address, nonce, timestamp));
            match safe.is_valid_signature(hash, envelope.signature.clone()).await {
                Ok(magic) => magic == EIP1271_MAGIC_VALUE,
                Err(e) => {
                    return Self::fallback(
                        wallet_address,
                        &envelope,
                        SafeVerificationError::VerificationUnavailable,
                        true,
                        format!("isValidSignature() failed: {e}"),
                    );
                }
            }
        } else {
            warnings.push(
                "contract does not expose a consistent Safe owner set; EIP-1271 result ignored"
                    .to_owned(),
            );
            false
        };

        let error = if !looks_like_safe {
            Some(SafeVerificationError::ContractValidationFailed)
        } else if !signature_validation {
            Some(SafeVerificationError::SignatureVerificationFailed)
        } else if !ownership_verification {
            Some(SafeVerificationError::OwnershipVerificationFailed)
        } else if !threshold_check {
            Some(SafeVerificationError::ThresholdNotMet)
        } else {
            None
        };
        let is_valid = signature_validation && ownership_verification && threshold_check;

        tracing::info!(
            %version,
            is_valid,
            owners = state.owners.len(),
            threshold = %state.threshold,
            "Safe signature verified"
        );

        SafeVerificationResult {
            is_valid,
            verification: SafeVerification {
                signature_validation,
                ownership_verification,
                threshold_check,
                safe_version_compatibility: true,
                verification_method: VerificationMethod::Eip1271,
                contract_address: safe.address().to_checksum(None),
            },
            error,
            warnings,
        }
    }

    async fn read_state(safe: &S::Contract, expected_owner: Option<Address>) -> SafeState {
        let is_owner = async {
            match expected_owner {
                Some(owner) => safe.is_owner(owner).await.map(Some),
                None => Ok(None),
            }
        };
        let (is_owner, threshold, owners) = tokio::join!(is_owner, safe.threshold(), safe.owners());
        let complete = is_owner.is_ok() && threshold.is_ok() && owners.is_ok();
        if !complete {
            tracing::debug!(
                is_owner = ?is_owner.as_ref().err(),
                threshold = ?threshold.as_ref().err(),
                owners = ?owners.as_ref().err(),
                "Safe state read incomplete"
            );
        }
        SafeState {
            is_owner: is_owner.unwrap_or(Some(false)),
            threshold: threshold.unwrap_or(U256::ZERO),
            owners: owners.unwrap_or_default(),
            complete,
        }
    }

    fn fallback(
        wallet_address: &str,
        envelope: &SafeEnvelope,
        error: SafeVerificationError,
        version_compatible: bool,
        warning: String,
    ) -> SafeVerificationResult {
        tracing::warn!(%warning, "Safe verification fell back");
        let error = if envelope.signature.is_empty() {
            SafeVerificationError::InvalidSignatureFormat
        } else {
            error
        };
        let mut result = SafeVerificationResult::rejected(
            wallet_address,
            VerificationMethod::Fallback,
            error,
            vec![
                warning,
                "fallback verification cannot authorize a Safe wallet".to_owned(),
            ],
        );
        result.verification.safe_version_compatibility = version_compatible;
        result
    }
}

/// Safe deployment parameters to be checked before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SafeWalletConfig {
    /// Safe address.
    pub address: String,
    /// Chain the Safe is deployed on.
    pub chain_id: u64,
    /// Required confirmations.
    pub threshold: u64,
    /// Owner addresses.
    pub owners: Vec<String>,
}

/// Outcome of [`validate_safe_wallet_config`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigValidation {
    /// No errors found.
    pub is_valid: bool,
    /// Every problem found.
    pub errors: Vec<String>,
}

/// Checks a Safe configuration without touching the chain.
#[must_use]
pub fn validate_safe_wallet_config(config: &SafeWalletConfig) -> ConfigValidation {
    let mut errors = Vec::new();
    if Address::from_str(&config.address).is_err() {
        errors.push(format!("invalid Safe address: {}", config.address));
    }
    if config.chain_id == 0 {
        errors.push("chain id must be positive".to_owned());
    }
    if config.threshold == 0 {
        errors.push("threshold must be positive".to_owned());
    }
    if config.owners.is_empty() {
        errors.push("at least one owner is required".to_owned());
    }
    for owner in &config.owners {
        if Address::from_str(owner).is_err() {
            errors.push(format!("invalid owner address: {owner}"));
        }
    }
    ConfigValidation {
        is_valid: errors.is_empty(),
        errors,
    }
}
