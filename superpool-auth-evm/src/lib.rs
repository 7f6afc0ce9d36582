#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! EVM support for SuperPool wallet authentication.
//!
//! This crate holds everything that needs an EVM library: signer recovery for
//! externally owned accounts, Safe multisig verification through EIP-1271,
//! and the server-side [`AuthVerifier`] that issues challenges and checks
//! their signatures.
//!
//! # Features
//!
//! - **EOA Signatures**: `personal_sign` (EIP-191) and EIP-712 typed-data recovery
//! - **Safe Wallets**: envelope parsing, version checks, owner and threshold
//!   reads, and `isValidSignature` with fail-closed fallbacks
//! - **Challenges**: single-use nonces with a configurable lifetime
//! - **Local Signing**: a private-key [`MessageSigner`](superpool_auth::wallet::MessageSigner)
//!   for scripts and tests
//!
//! # Modules
//!
//! - [`contract`] - Solidity bindings and the EIP-712 domain
//! - [`ecdsa`] - EOA signer recovery
//! - [`envelope`] - `safe-wallet:` signature envelopes
//! - [`nonce`] - Pending challenge storage
//! - [`rpc`] - JSON-RPC providers per chain
//! - [`safe`] - Safe EIP-1271 verification
//! - [`signer`] - Local private-key signer
//! - [`token`] - Session token issuing
//! - [`verifier`] - Server-side challenge verifier

pub mod contract;
pub mod ecdsa;
pub mod envelope;
pub mod nonce;
pub mod rpc;
pub mod safe;
pub mod signer;
pub mod token;
pub mod verifier;

pub use rpc::RpcSafeSource;
pub use safe::{SafeVerificationResult, SafeWalletVerifier};
pub use signer::LocalMessageSigner;
pub use verifier::{AuthServiceError, AuthVerifier};
