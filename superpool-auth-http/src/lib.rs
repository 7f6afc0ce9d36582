//! HTTP transport for the SuperPool authentication backend.
//!
//! [`HttpAuthRpc`] implements [`superpool_auth::proto::AuthRpc`] against the
//! `POST /generateAuthMessage` and `POST /verifySignatureAndLogin` endpoints
//! served by `superpool-auth-server`.

pub mod client;
pub mod error;

pub use client::HttpAuthRpc;
pub use error::HttpRpcError;
