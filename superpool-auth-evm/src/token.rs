//! Session tokens handed back after a verified sign-in.
//!
//! A token is only worth something if the session backend can check that this
//! server minted it. [`OpaqueTokenIssuer`] records every token it hands out
//! and lets each one be redeemed exactly once before it expires.

use std::convert::Infallible;
use std::future::Future;
use std::time::Duration;

use alloy_primitives::hex;
use dashmap::DashMap;
use rand::RngExt;
use rand::rng;
use superpool_auth::proto::AuthenticatedUser;
use superpool_auth::timestamp::EpochMillis;

/// Default lifetime of an unredeemed token.
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(60 * 60);

/// Mints the custom token a client exchanges with the session backend, and
/// redeems it on the backend's behalf.
pub trait TokenIssuer: Send + Sync {
    /// Minting failure.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Issues a token for `user` at `now`.
    fn issue_token(
        &self,
        user: &AuthenticatedUser,
        now: EpochMillis,
    ) -> impl Future<Output = Result<String, Self::Error>> + Send;

    /// Exchanges `token` for the user it was issued to.
    ///
    /// Returns `None` for a token this issuer never minted, one already
    /// redeemed, or one expired at `now`.
    fn redeem_token(
        &self,
        token: &str,
        now: EpochMillis,
    ) -> impl Future<Output = Option<AuthenticatedUser>> + Send;

    /// Drops every token expired at `now`, returning how many were removed.
    fn purge_expired(&self, now: EpochMillis) -> impl Future<Output = usize> + Send;
}

#[derive(Debug, Clone)]
struct IssuedToken {
    user: AuthenticatedUser,
    expires_at: EpochMillis,
}

/// Issues random 32-byte hex tokens and keeps them until redeemed or expired.
///
/// The token itself carries no claims; its value is an index into this
/// process's table.
#[derive(Debug)]
pub struct OpaqueTokenIssuer {
    issued: DashMap<String, IssuedToken>,
    ttl: Duration,
}

impl Default for OpaqueTokenIssuer {
    fn default() -> Self {
        Self::new()
    }
}

impl OpaqueTokenIssuer {
    /// An issuer whose tokens live for [`DEFAULT_TOKEN_TTL`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_ttl(DEFAULT_TOKEN_TTL)
    }

    /// An issuer whose tokens live for `ttl`.
    #[must_use]
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            issued: DashMap::new(),
            ttl,
        }
    }

    /// Number of outstanding tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.issued.len()
    }

    /// Whether no token is outstanding.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.issued.is_empty()
    }
}

impl TokenIssuer for OpaqueTokenIssuer {
    type Error = Infallible;

    async fn issue_token(
        &self,
        user: &AuthenticatedUser,
        now: EpochMillis,
    ) -> Result<String, Infallible> {
        let bytes: [u8; 32] = rng().random();
        let token = hex::encode(bytes);
        self.issued.insert(
            token.clone(),
            IssuedToken {
                user: user.clone(),
                expires_at: now + self.ttl,
            },
        );
        tracing::debug!(uid = %user.uid, "Issued session token");
        Ok(token)
    }

    async fn redeem_token(&self, token: &str, now: EpochMillis) -> Option<AuthenticatedUser> {
        let (_, issued) = self.issued.remove(token)?;
        if now > issued.expires_at {
            tracing::debug!(uid = %issued.user.uid, "Rejected expired session token");
            return None;
        }
        Some(issued.user)
    }

    async fn purge_expired(&self, now: EpochMillis) -> usize {
        let before = self.issued.len();
        self.issued.retain(|_, issued| now <= issued.expires_at);
        before.saturating_sub(self.issued.len())
    }
}
