//! Authentication step identifiers and their derived status.

use serde::{Deserialize, Serialize};
use std::fmt;

/// One stage of the wallet sign-in pipeline.
///
/// The declaration order is the execution order and also drives the progress
/// value shown to users.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuthStep {
    /// Wallet reports a connected account.
    ConnectWallet,
    /// The single-attempt lock is held for the account.
    AcquireLock,
    /// The server issued a challenge message and nonce.
    GenerateMessage,
    /// The wallet signed the challenge.
    RequestSignature,
    /// The server verified the signature and issued a custom token.
    VerifySignature,
    /// The session backend accepted the custom token.
    FirebaseAuth,
}

impl AuthStep {
    /// Every step, in execution order.
    pub const ALL: [Self; 6] = [
        Self::ConnectWallet,
        Self::AcquireLock,
        Self::GenerateMessage,
        Self::RequestSignature,
        Self::VerifySignature,
        Self::FirebaseAuth,
    ];

    /// Number of steps in a complete flow.
    pub const COUNT: usize = Self::ALL.len();

    /// Position of this step in [`AuthStep::ALL`].
    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Steps that must be completed before this one may start.
    #[must_use]
    pub fn predecessors(self) -> &'static [Self] {
        &Self::ALL[..self.index()]
    }

    /// Kebab-case identifier used on the wire and in logs.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ConnectWallet => "connect-wallet",
            Self::AcquireLock => "acquire-lock",
            Self::GenerateMessage => "generate-message",
            Self::RequestSignature => "request-signature",
            Self::VerifySignature => "verify-signature",
            Self::FirebaseAuth => "firebase-auth",
        }
    }
}

impl fmt::Display for AuthStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// UI-facing status of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepStatus {
    /// Not reached yet.
    Pending,
    /// Currently executing.
    Current,
    /// Finished successfully.
    Completed,
    /// The flow stopped at this step.
    Failed,
}
