//! Axum route handlers.
//!
//! The two callables are exposed as `POST` endpoints whose bodies are the
//! protocol types from `superpool_auth::proto`, next to the token redemption
//! endpoint the session backend calls.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use superpool_auth::proto::{
    AuthRpc, AuthenticatedUser, GenerateAuthMessageRequest, GenerateAuthMessageResponse,
    RedeemTokenRequest, VerifySignatureRequest, VerifySignatureResponse,
};
use superpool_auth::timestamp::EpochMillis;
use superpool_auth_evm::{AuthVerifier, RpcSafeSource};

use crate::error::ServerError;

/// Shared verifier.
pub type AuthState = Arc<AuthVerifier<RpcSafeSource>>;

/// `POST /generateAuthMessage` - issues a challenge for a wallet.
///
/// # Errors
///
/// Returns 400 for a malformed body or address.
pub async fn post_generate_auth_message(
    State(verifier): State<AuthState>,
    body: Result<Json<GenerateAuthMessageRequest>, JsonRejection>,
) -> Result<Json<GenerateAuthMessageResponse>, ServerError> {
    let Json(request) = body?;
    Ok(Json(verifier.generate_auth_message(&request).await?))
}

/// `POST /verifySignatureAndLogin` - verifies a signed challenge and returns
/// a custom token.
///
/// # Errors
///
/// Returns 404 when no challenge is pending, 401 for an expired challenge or
/// a bad signature, and 400 for malformed input.
pub async fn post_verify_signature_and_login(
    State(verifier): State<AuthState>,
    body: Result<Json<VerifySignatureRequest>, JsonRejection>,
) -> Result<Json<VerifySignatureResponse>, ServerError> {
    let Json(request) = body?;
    Ok(Json(verifier.verify_signature_and_login(&request).await?))
}

/// `POST /redeemCustomToken` - exchanges a custom token for the user it was
/// issued to. Each token redeems once.
///
/// # Errors
///
/// Returns 401 for a forged, reused or expired token.
pub async fn post_redeem_custom_token(
    State(verifier): State<AuthState>,
    body: Result<Json<RedeemTokenRequest>, JsonRejection>,
) -> Result<Json<AuthenticatedUser>, ServerError> {
    let Json(request) = body?;
    let user = verifier
        .redeem_token(&request.custom_token, EpochMillis::now())
        .await?;
    Ok(Json(user))
}

/// `GET /health`.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Router with every endpoint:
///
/// - `POST /generateAuthMessage`
/// - `POST /verifySignatureAndLogin`
/// - `POST /redeemCustomToken`
/// - `GET /health`
pub fn auth_router(state: AuthState) -> axum::Router {
    axum::Router::new()
        .route(
            "/generateAuthMessage",
            axum::routing::post(post_generate_auth_message),
        )
        .route(
            "/verifySignatureAndLogin",
            axum::routing::post(post_verify_signature_and_login),
        )
        .route(
            "/redeemCustomToken",
            axum::routing::post(post_redeem_custom_token),
        )
        .route("/health", axum::routing::get(health))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use alloy_signer_local::PrivateKeySigner;
    use superpool_auth::categorize::{ErrorCategory, categorize_error};
    use superpool_auth::proto::SignatureRequest;
    use superpool_auth::wallet::MessageSigner;
    use superpool_auth_evm::{LocalMessageSigner, SafeWalletVerifier};
    use superpool_auth_http::{HttpAuthRpc, HttpRpcError};

    use super::*;

    async fn serve() -> HttpAuthRpc {
        let state: AuthState = Arc::new(AuthVerifier::new(SafeWalletVerifier::new(
            RpcSafeSource::new(),
        )));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, auth_router(state)).await.unwrap();
        });
        HttpAuthRpc::try_from(format!("http://{addr}").as_str()).unwrap()
    }

    #[tokio::test]
    async fn test_sign_in_over_http() {
        let rpc = serve().await;
        let signer = LocalMessageSigner::new(PrivateKeySigner::random());

        let challenge = rpc
            .generate_auth_message(&GenerateAuthMessageRequest {
                wallet_address: signer.address(),
            })
            .await
            .unwrap();
        let request = SignatureRequest::from_challenge(signer.address(), Some(1), challenge);
        let signature = signer.sign_message(&request.message).await.unwrap();
        let verify = VerifySignatureRequest::signed(&request, signature);

        let response = rpc.verify_signature_and_login(&verify).await.unwrap();
        assert_eq!(response.custom_token.len(), 64);

        let replay = rpc.verify_signature_and_login(&verify).await.unwrap_err();
        assert_eq!(replay.status(), Some(axum::http::StatusCode::NOT_FOUND));
        assert_eq!(
            categorize_error(&replay.to_string()),
            ErrorCategory::Authentication
        );

        let user = rpc
            .redeem_custom_token(&response.custom_token)
            .await
            .unwrap();
        assert_eq!(user.wallet_address, signer.address());
        let reused = rpc
            .redeem_custom_token(&response.custom_token)
            .await
            .unwrap_err();
        assert_eq!(reused.status(), Some(axum::http::StatusCode::UNAUTHORIZED));
    }

    #[tokio::test]
    async fn test_forged_token_is_unauthorized() {
        let rpc = serve().await;
        let err = rpc.redeem_custom_token(&"ab".repeat(32)).await.unwrap_err();
        assert_eq!(err.status(), Some(axum::http::StatusCode::UNAUTHORIZED));
        assert_eq!(err.to_string(), "invalid or expired auth token");
    }

    #[tokio::test]
    async fn test_invalid_address_is_bad_request() {
        let rpc = serve().await;
        let err = rpc
            .generate_auth_message(&GenerateAuthMessageRequest {
                wallet_address: "not-an-address".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            HttpRpcError::Rejected { status, .. } if status == axum::http::StatusCode::BAD_REQUEST
        ));
        assert!(err.to_string().contains("invalid wallet address"));
    }

    #[tokio::test]
    async fn test_health() {
        let Json(body) = health().await;
        assert_eq!(body["status"], "ok");
    }
}
