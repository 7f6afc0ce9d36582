//! SuperPool authentication server.
//!
//! Serves the two sign-in callables over HTTP, backed by
//! [`superpool_auth_evm::AuthVerifier`].
//!
//! # Modules
//!
//! - [`config`] - Server configuration with environment variable expansion
//! - [`error`] - Error responses
//! - [`handlers`] - Axum route handlers and router builder
//! - [`tasks`] - Expired-challenge sweeps and shutdown coordination

pub mod config;
pub mod error;
pub mod handlers;
pub mod tasks;

pub use handlers::{AuthState, auth_router};
