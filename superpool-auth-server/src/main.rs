//! SuperPool authentication HTTP server.
//!
//! # Usage
//!
//! ```bash
//! # Run with default config (config.toml in current directory)
//! cargo run -p superpool-auth-server --release
//!
//! # Run with custom config path
//! CONFIG=/path/to/config.toml cargo run -p superpool-auth-server
//!
//! # Configure logging level
//! RUST_LOG=debug cargo run -p superpool-auth-server
//! ```
//!
//! # Environment Variables
//!
//! - `CONFIG` - Path to TOML configuration file (default: `config.toml`)
//! - `HOST` - Override bind address (default: `0.0.0.0`)
//! - `PORT` - Override port (default: `8080`)
//! - `RUST_LOG` - Log level filter (default: `info`)

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use superpool_auth_evm::nonce::InMemoryNonceStore;
use superpool_auth_evm::token::OpaqueTokenIssuer;
use superpool_auth_evm::{AuthVerifier, SafeWalletVerifier};
use tower_http::cors;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use superpool_auth_server::config::ServerConfig;
use superpool_auth_server::handlers::{AuthState, auth_router};
use superpool_auth_server::tasks::{Shutdown, spawn_expiry_purge};

#[tokio::main]
async fn main() {
    // A missing .env file is fine.
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = run().await {
        tracing::error!("Server failed: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = ServerConfig::load()?;
    tracing::info!(
        host = %config.host,
        port = config.port,
        chains = config.chains.len(),
        nonce_ttl_secs = config.nonce_ttl_secs,
        token_ttl_secs = config.token_ttl_secs,
        "Loaded configuration"
    );

    let source = config.safe_source()?;
    if source.chains().next().is_none() {
        tracing::warn!("No chains configured; Safe wallet sign-ins will be rejected");
    }

    let safe = SafeWalletVerifier::with_versions(source, config.safe_versions.clone());
    let state: AuthState = Arc::new(
        AuthVerifier::with_parts(
            safe,
            InMemoryNonceStore::new(),
            OpaqueTokenIssuer::with_ttl(config.token_ttl()),
        )
        .with_nonce_ttl(config.nonce_ttl()),
    );

    let shutdown = Shutdown::install()?;
    spawn_expiry_purge(
        shutdown.tracker(),
        Arc::clone(&state),
        config.purge_interval(),
        shutdown.token(),
    );

    let app = auth_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let addr = SocketAddr::new(config.host, config.port);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Listening on http://{addr}");

    let token = shutdown.token();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { token.cancelled().await })
        .await?;

    shutdown.drain().await;
    tracing::info!("Shut down gracefully");
    Ok(())
}
