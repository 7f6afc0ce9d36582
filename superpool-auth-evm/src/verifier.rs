//! Server side of the challenge-response sign-in.
//!
//! [`AuthVerifier`] issues challenges and checks signed answers. It implements
//! [`AuthRpc`] directly, so a client orchestrator can run against it
//! in-process as well as over HTTP.

use std::str::FromStr;
use std::time::Duration;

use alloy_primitives::{Address, hex};
use rand::RngExt;
use rand::rng;
use superpool_auth::message::create_auth_message;
use superpool_auth::proto::{
    AuthRpc, AuthenticatedUser, GenerateAuthMessageRequest, GenerateAuthMessageResponse,
    SignatureRequest, VerifySignatureRequest, VerifySignatureResponse,
};
use superpool_auth::timestamp::EpochMillis;

use crate::ecdsa::{SignatureError, verify_eoa_signature};
use crate::envelope::is_safe_envelope;
use crate::nonce::{DEFAULT_NONCE_TTL, InMemoryNonceStore, NonceRecord, NonceStore};
use crate::safe::{SafeContractSource, SafeVerificationError, SafeWalletVerifier};
use crate::token::{OpaqueTokenIssuer, TokenIssuer};

/// Reasons a challenge could not be issued or a sign-in was refused.
///
/// Display strings travel to the client and are classified there, so each
/// carries a word the client categorizer recognises.
#[derive(Debug, thiserror::Error)]
pub enum AuthServiceError {
    /// `walletAddress` is not an EVM address.
    #[error("invalid wallet address for authentication: {0}")]
    InvalidAddress(String),
    /// No challenge is pending for the wallet.
    #[error("no pending authentication challenge for wallet")]
    NonceNotFound,
    /// The nonce or timestamp differs from the pending challenge.
    #[error("authentication challenge does not match the pending {0}")]
    NonceMismatch(&'static str),
    /// The challenge is older than the configured lifetime.
    #[error("authentication challenge expired")]
    Expired,
    /// The submitted text is not the canonical challenge.
    #[error("signed message does not match the authentication challenge")]
    MessageMismatch,
    /// ECDSA signature check failed.
    #[error("invalid signature: {0}")]
    InvalidSignature(#[from] SignatureError),
    /// Safe wallet verification did not succeed.
    #[error(
        "Safe wallet signature rejected: {}",
        .code.map_or("UNKNOWN", SafeVerificationError::as_code)
    )]
    SafeVerificationFailed {
        /// Machine-readable reason.
        code: Option<SafeVerificationError>,
        /// Diagnostics from the verifier.
        warnings: Vec<String>,
    },
    /// The session token could not be minted.
    #[error("failed to issue auth token: {0}")]
    TokenIssue(String),
    /// A presented session token was never issued, was already used, or
    /// expired.
    #[error("invalid or expired auth token")]
    InvalidToken,
}

/// Issues challenges and verifies signed answers.
#[derive(Debug)]
pub struct AuthVerifier<S, N = InMemoryNonceStore, T = OpaqueTokenIssuer> {
    safe: SafeWalletVerifier<S>,
    nonces: N,
    tokens: T,
    nonce_ttl: Duration,
}

impl<S: SafeContractSource> AuthVerifier<S> {
    /// A verifier with an in-memory nonce store and opaque tokens.
    pub fn new(safe: SafeWalletVerifier<S>) -> Self {
        Self::with_parts(safe, InMemoryNonceStore::new(), OpaqueTokenIssuer::new())
    }
}

impl<S, N, T> AuthVerifier<S, N, T>
where
    S: SafeContractSource,
    N: NonceStore,
    T: TokenIssuer,
{
    /// Assembles a verifier from its collaborators.
    pub const fn with_parts(safe: SafeWalletVerifier<S>, nonces: N, tokens: T) -> Self {
        Self {
            safe,
            nonces,
            tokens,
            nonce_ttl: DEFAULT_NONCE_TTL,
        }
    }

    /// Overrides the challenge lifetime.
    #[must_use]
    pub const fn with_nonce_ttl(mut self, ttl: Duration) -> Self {
        self.nonce_ttl = ttl;
        self
    }

    /// Pending challenge storage.
    pub const fn nonces(&self) -> &N {
        &self.nonces
    }

    /// Issued session tokens.
    pub const fn tokens(&self) -> &T {
        &self.tokens
    }

    /// Issues a challenge at `now`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthServiceError::InvalidAddress`] for a malformed address.
    pub async fn issue_challenge(
        &self,
        wallet_address: &str,
        now: EpochMillis,
    ) -> Result<GenerateAuthMessageResponse, AuthServiceError> {
        parse_address(wallet_address)?;
        let nonce_bytes: [u8; 32] = rng().random();
        let nonce = hex::encode(nonce_bytes);
        let message = create_auth_message(wallet_address, &nonce, now);
        let record = NonceRecord::new(nonce.clone(), now, self.nonce_ttl);
        self.nonces.put(wallet_address, record).await;
        tracing::info!(
            wallet = wallet_address,
            timestamp = %now,
            "Issued authentication challenge"
        );
        Ok(GenerateAuthMessageResponse {
            message,
            nonce,
            timestamp: now,
        })
    }

    /// Verifies a signed challenge at `now` and issues a session token.
    ///
    /// The pending challenge is consumed only when every check passes, so a
    /// rejected signature can be retried against the same challenge until it
    /// expires.
    ///
    /// Safe wallets are checked without naming an expected owner: the Safe's
    /// own `isValidSignature` already requires threshold-many owner
    /// signatures, and the envelope carries no single signer to recover. The
    /// ownership check therefore only asserts a non-empty owner set.
    ///
    /// # Errors
    ///
    /// Returns the first failed check as an [`AuthServiceError`].
    #[tracing::instrument(skip_all, fields(wallet = %request.wallet_address))]
    pub async fn verify_at(
        &self,
        request: &VerifySignatureRequest,
        now: EpochMillis,
    ) -> Result<VerifySignatureResponse, AuthServiceError> {
        let address = parse_address(&request.wallet_address)?;

        let record = self
            .nonces
            .get(&request.wallet_address)
            .await
            .ok_or(AuthServiceError::NonceNotFound)?;
        if record.nonce != request.nonce {
            return Err(AuthServiceError::NonceMismatch("nonce"));
        }
        if record.timestamp != request.timestamp {
            return Err(AuthServiceError::NonceMismatch("timestamp"));
        }
        if record.is_expired(now) || request.timestamp.elapsed_until(now) > self.nonce_ttl {
            self.nonces.remove(&request.wallet_address).await;
            tracing::warn!("Rejected expired challenge");
            return Err(AuthServiceError::Expired);
        }

        let expected =
            create_auth_message(&request.wallet_address, &request.nonce, request.timestamp);
        if expected != request.message {
            return Err(AuthServiceError::MessageMismatch);
        }

        if is_safe_envelope(&request.signature) {
            let result = self
                .safe
                .verify(
                    &request.wallet_address,
                    &request.signature,
                    &request.nonce,
                    request.timestamp,
                    request.chain_id,
                    None,
                )
                .await;
            if !result.is_valid {
                return Err(AuthServiceError::SafeVerificationFailed {
                    code: result.error,
                    warnings: result.warnings,
                });
            }
        } else {
            let signed = SignatureRequest {
                wallet_address: request.wallet_address.clone(),
                chain_id: request.chain_id,
                message: request.message.clone(),
                nonce: request.nonce.clone(),
                timestamp: request.timestamp,
            };
            verify_eoa_signature(&signed, &request.signature, address)?;
        }

        if !self.nonces.consume(&request.wallet_address, &request.nonce).await {
            // Lost a race with a concurrent verification of the same challenge.
            return Err(AuthServiceError::NonceNotFound);
        }

        let user = AuthenticatedUser {
            uid: request.wallet_address.to_ascii_lowercase(),
            wallet_address: request.wallet_address.clone(),
        };
        let custom_token = self
            .tokens
            .issue_token(&user, now)
            .await
            .map_err(|e| AuthServiceError::TokenIssue(e.to_string()))?;
        tracing::info!(uid = %user.uid, "Wallet authenticated");
        Ok(VerifySignatureResponse { custom_token })
    }

    /// Exchanges a custom token for the user it was issued to. Each token is
    /// accepted once.
    ///
    /// # Errors
    ///
    /// Returns [`AuthServiceError::InvalidToken`] for a forged, reused or
    /// expired token.
    pub async fn redeem_token(
        &self,
        custom_token: &str,
        now: EpochMillis,
    ) -> Result<AuthenticatedUser, AuthServiceError> {
        let user = self
            .tokens
            .redeem_token(custom_token, now)
            .await
            .ok_or(AuthServiceError::InvalidToken)?;
        tracing::info!(uid = %user.uid, "Session token redeemed");
        Ok(user)
    }
}

fn parse_address(wallet_address: &str) -> Result<Address, AuthServiceError> {
    Address::from_str(wallet_address)
        .map_err(|_| AuthServiceError::InvalidAddress(wallet_address.to_owned()))
}

impl<S, N, T> AuthRpc for AuthVerifier<S, N, T>
where
    S: SafeContractSource,
    N: NonceStore,
    T: TokenIssuer,
{
    type Error = AuthServiceError;

    async fn generate_auth_message(
        &self,
        request: &GenerateAuthMessageRequest,
    ) -> Result<GenerateAuthMessageResponse, AuthServiceError> {
        self.issue_challenge(&request.wallet_address, EpochMillis::now())
            .await
    }

    async fn verify_signature_and_login(
        &self,
        request: &VerifySignatureRequest,
    ) -> Result<VerifySignatureResponse, AuthServiceError> {
        self.verify_at(request, EpochMillis::now()).await
    }
}

#[cfg(test)]
mod tests {
    use alloy_signer_local::PrivateKeySigner;
    use superpool_auth::categorize::{ErrorCategory, categorize_error};
    use superpool_auth::proto::SignatureType;
    use superpool_auth::wallet::MessageSigner;

    use super::*;
    use crate::safe::testing::{MockSafe, MockSource};
    use crate::signer::LocalMessageSigner;

    fn verifier(safe: Option<MockSafe>) -> AuthVerifier<MockSource> {
        AuthVerifier::new(SafeWalletVerifier::new(MockSource(safe)))
    }

    async fn signed_request(
        verifier: &AuthVerifier<MockSource>,
        signer: &LocalMessageSigner,
        chain_id: Option<u64>,
    ) -> VerifySignatureRequest {
        let address = signer.address();
        let challenge = verifier
            .generate_auth_message(&GenerateAuthMessageRequest {
                wallet_address: address.clone(),
            })
            .await
            .unwrap();
        let request = SignatureRequest::from_challenge(address, chain_id, challenge);
        let signature = match signer.signature_type() {
            SignatureType::TypedData => signer.sign_typed_data(&request.typed_data()).await,
            _ => signer.sign_message(&request.message).await,
        }
        .unwrap();
        VerifySignatureRequest::signed(&request, signature)
    }

    #[tokio::test]
    async fn test_personal_sign_login() {
        let verifier = verifier(None);
        let signer = LocalMessageSigner::new(PrivateKeySigner::random());
        let request = signed_request(&verifier, &signer, Some(1)).await;

        let response = verifier.verify_signature_and_login(&request).await.unwrap();
        assert_eq!(response.custom_token.len(), 64);
        assert!(verifier.nonces().is_empty());

        let replay = verifier
            .verify_signature_and_login(&request)
            .await
            .unwrap_err();
        assert!(matches!(replay, AuthServiceError::NonceNotFound));
    }

    #[tokio::test]
    async fn test_only_issued_tokens_redeem() {
        let verifier = verifier(None);
        let signer = LocalMessageSigner::new(PrivateKeySigner::random());
        let request = signed_request(&verifier, &signer, Some(1)).await;
        let token = verifier
            .verify_signature_and_login(&request)
            .await
            .unwrap()
            .custom_token;
        let now = EpochMillis::now();

        let forged = hex::encode([0x42_u8; 32]);
        let err = verifier.redeem_token(&forged, now).await.unwrap_err();
        assert!(matches!(err, AuthServiceError::InvalidToken));
        assert_eq!(categorize_error(&err.to_string()), ErrorCategory::Authentication);

        let user = verifier.redeem_token(&token, now).await.unwrap();
        assert_eq!(user.uid, signer.address().to_ascii_lowercase());
        assert_eq!(user.wallet_address, signer.address());
        assert!(matches!(
            verifier.redeem_token(&token, now).await,
            Err(AuthServiceError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn test_typed_data_login() {
        let verifier = verifier(None);
        let signer = LocalMessageSigner::new(PrivateKeySigner::random())
            .with_signature_type(SignatureType::TypedData);
        let request = signed_request(&verifier, &signer, Some(137)).await;
        assert!(verifier.verify_signature_and_login(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_wrong_signer_keeps_challenge() {
        let verifier = verifier(None);
        let signer = LocalMessageSigner::new(PrivateKeySigner::random());
        let mut request = signed_request(&verifier, &signer, None).await;
        let impostor = LocalMessageSigner::new(PrivateKeySigner::random());
        let genuine_signature = std::mem::replace(
            &mut request.signature,
            impostor.sign_message(&request.message).await.unwrap(),
        );

        let err = verifier
            .verify_signature_and_login(&request)
            .await
            .unwrap_err();
        assert!(matches!(err, AuthServiceError::InvalidSignature(_)));
        assert_eq!(categorize_error(&err.to_string()), ErrorCategory::Authentication);
        assert_eq!(verifier.nonces().len(), 1);

        request.signature = genuine_signature;
        assert!(verifier.verify_signature_and_login(&request).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_challenge() {
        let verifier = verifier(None);
        let signer = LocalMessageSigner::new(PrivateKeySigner::random());
        let issued = EpochMillis::from_millis(1_700_000_000_000);
        let challenge = verifier
            .issue_challenge(&signer.address(), issued)
            .await
            .unwrap();
        let request = SignatureRequest::from_challenge(signer.address(), None, challenge);
        let signature = signer.sign_message(&request.message).await.unwrap();
        let request = VerifySignatureRequest::signed(&request, signature);

        let later = issued + DEFAULT_NONCE_TTL + Duration::from_secs(1);
        let err = verifier.verify_at(&request, later).await.unwrap_err();
        assert_eq!(err.to_string(), "authentication challenge expired");
        assert!(verifier.nonces().is_empty());
    }

    #[tokio::test]
    async fn test_mismatched_fields() {
        let verifier = verifier(None);
        let signer = LocalMessageSigner::new(PrivateKeySigner::random());
        let request = signed_request(&verifier, &signer, None).await;

        let wrong_nonce = VerifySignatureRequest {
            nonce: "other".into(),
            ..request.clone()
        };
        assert!(matches!(
            verifier.verify_signature_and_login(&wrong_nonce).await,
            Err(AuthServiceError::NonceMismatch("nonce"))
        ));

        let wrong_message = VerifySignatureRequest {
            message: format!("{} ", request.message),
            ..request.clone()
        };
        assert!(matches!(
            verifier.verify_signature_and_login(&wrong_message).await,
            Err(AuthServiceError::MessageMismatch)
        ));

        let bad_address = VerifySignatureRequest {
            wallet_address: "0x1234".into(),
            ..request
        };
        assert!(matches!(
            verifier.verify_signature_and_login(&bad_address).await,
            Err(AuthServiceError::InvalidAddress(_))
        ));
    }

    #[tokio::test]
    async fn test_safe_wallet_login() {
        let safe_address = Address::repeat_byte(0x5a);
        let verifier = verifier(Some(MockSafe::healthy(safe_address)));
        let wallet = safe_address.to_checksum(None);
        let challenge = verifier
            .generate_auth_message(&GenerateAuthMessageRequest {
                wallet_address: wallet.clone(),
            })
            .await
            .unwrap();
        let request = SignatureRequest::from_challenge(wallet, Some(1), challenge);

        let legacy = VerifySignatureRequest::signed(
            &request,
            format!(
                "safe-wallet:{}:{}:{}",
                request.wallet_address, request.nonce, request.timestamp
            ),
        );
        let err = verifier
            .verify_signature_and_login(&legacy)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            AuthServiceError::SafeVerificationFailed {
                code: Some(SafeVerificationError::InvalidSignatureFormat),
                ..
            }
        ));

        let enhanced =
            VerifySignatureRequest::signed(&request, request.safe_envelope("0xabcdef"));
        assert!(verifier.verify_signature_and_login(&enhanced).await.is_ok());
    }
}

#[cfg(test)]
mod end_to_end {
    use std::convert::Infallible;
    use std::sync::{Arc, Mutex};

    use alloy_signer_local::PrivateKeySigner;
    use superpool_auth::executor::StepDelays;
    use superpool_auth::hooks::NoopLifecycle;
    use superpool_auth::orchestrator::{AuthOutcome, AuthenticationOrchestrator};
    use superpool_auth::proto::AuthenticatedUser;
    use superpool_auth::step::AuthStep;
    use superpool_auth::wallet::{SessionBackend, WalletConnection, WalletState};
    use tokio::sync::watch;

    use super::*;
    use crate::safe::testing::MockSource;
    use crate::signer::LocalMessageSigner;
    use crate::token::OpaqueTokenIssuer;

    type Verifier = AuthVerifier<MockSource>;

    struct Wallet(watch::Sender<WalletState>);

    impl WalletConnection for Wallet {
        type Error = Infallible;

        fn state(&self) -> WalletState {
            self.0.borrow().clone()
        }

        fn subscribe(&self) -> watch::Receiver<WalletState> {
            self.0.subscribe()
        }

        async fn disconnect(&self) -> Result<(), Infallible> {
            self.0.send_replace(WalletState::default());
            Ok(())
        }
    }

    /// Redeems tokens against the verifier that minted them.
    struct Session {
        verifier: Arc<Verifier>,
        user: Mutex<Option<AuthenticatedUser>>,
    }

    impl SessionBackend for Session {
        type Error = AuthServiceError;

        fn current_user(&self) -> Option<AuthenticatedUser> {
            self.user.lock().unwrap().clone()
        }

        async fn sign_in_with_custom_token(
            &self,
            token: &str,
        ) -> Result<AuthenticatedUser, AuthServiceError> {
            let user = self.verifier.redeem_token(token, EpochMillis::now()).await?;
            *self.user.lock().unwrap() = Some(user.clone());
            Ok(user)
        }

        async fn sign_out(&self) -> Result<(), AuthServiceError> {
            *self.user.lock().unwrap() = None;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_orchestrator_against_in_process_verifier() {
        let signer = LocalMessageSigner::new(PrivateKeySigner::random());
        let address = signer.address();
        let (tx, _rx) = watch::channel(WalletState::connected(address.clone(), Some(1)));
        let verifier: Arc<Verifier> = Arc::new(AuthVerifier::with_parts(
            SafeWalletVerifier::new(MockSource(None)),
            InMemoryNonceStore::new(),
            OpaqueTokenIssuer::new(),
        ));
        let session = Arc::new(Session {
            verifier: Arc::clone(&verifier),
            user: Mutex::new(None),
        });
        let orchestrator = AuthenticationOrchestrator::with_lifecycle(
            Arc::new(Wallet(tx)),
            Arc::new(signer),
            Arc::clone(&verifier),
            Arc::clone(&session),
            Arc::new(NoopLifecycle),
            StepDelays::none(),
        );

        let outcome = orchestrator.authenticate().await.unwrap();
        let AuthOutcome::Authenticated(user) = outcome else {
            panic!("expected sign-in, got {outcome:?}");
        };
        assert_eq!(user.uid, address.to_ascii_lowercase());
        assert_eq!(user.wallet_address, address);
        assert!(verifier.tokens().is_empty());

        let snapshot = orchestrator.machine().snapshot();
        assert_eq!(snapshot.progress, 100);
        assert_eq!(snapshot.completed_steps.len(), AuthStep::COUNT);
        assert!(!snapshot.is_authenticating);

        orchestrator.sign_out().await.unwrap();
        assert_eq!(session.current_user(), None);
        assert!(matches!(
            orchestrator.authenticate().await.unwrap(),
            AuthOutcome::Authenticated(_)
        ));
    }
}
