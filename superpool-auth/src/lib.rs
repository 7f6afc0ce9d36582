//! Client-side core of SuperPool wallet authentication.
//!
//! A wallet sign-in runs as a fixed six-step pipeline: confirm the wallet
//! connection, take the single-attempt lock, fetch a challenge from the
//! backend, have the wallet sign it, have the backend verify the signature,
//! and exchange the returned custom token for a session.
//!
//! This crate owns the sequencing, locking, retry and error-classification
//! logic. Wallet SDKs, the backend transport and the session backend are
//! plugged in through the traits in [`wallet`] and [`proto`].
//!
//! # Modules
//!
//! - [`categorize`] - Error-message classification and retry decisions
//! - [`executor`] - Step execution with lifecycle callbacks and pacing
//! - [`hooks`] - Step lifecycle observer trait
//! - [`lock`] - Authentication lock and connection-state snapshots
//! - [`machine`] - Authentication state machine
//! - [`message`] - Canonical challenge message
//! - [`orchestrator`] - The end-to-end sign-in pipeline
//! - [`proto`] - Wire types and the backend RPC trait
//! - [`retry`] - Retry policies and the backoff executor
//! - [`step`] - Step identifiers and statuses
//! - [`timestamp`] - Millisecond epoch timestamps
//! - [`wallet`] - Wallet, signer and session collaborator traits

pub mod categorize;
pub mod executor;
pub mod hooks;
pub mod lock;
pub mod machine;
pub mod message;
pub mod orchestrator;
pub mod proto;
pub mod retry;
pub mod step;
pub mod timestamp;
pub mod wallet;
