//! Heuristic classification of upstream error messages.
//!
//! Wallet SDKs, RPC transports and the auth backend all report failures as
//! opaque text. The classifier below maps that text onto a small taxonomy so
//! retry policies and user-facing copy can be chosen consistently.
//!
//! Rules are evaluated top to bottom and the first match wins. Two orderings
//! matter: fatal markers are checked before anything else (so
//! `"invalid-token: network error"` stays fatal), and timeouts are checked
//! before network errors (so `"connection timeout"` is a timeout).

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::retry::RetryPolicy;

/// Coarse error classes observed by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    /// Bad credentials, disabled account, missing permission. Never retried.
    Fatal,
    /// Backend throttled the request.
    RateLimit,
    /// The operation did not finish in time.
    Timeout,
    /// Connectivity problem between client and backend.
    Network,
    /// Signing or token exchange failed.
    Authentication,
    /// Anything else.
    Recoverable,
}

impl ErrorCategory {
    /// Fixed message suitable for showing to the user.
    #[must_use]
    pub const fn user_message(self) -> &'static str {
        match self {
            Self::Fatal => "Authentication failed. Please check your credentials and try again.",
            Self::Network => "Network error. Please check your connection and try again.",
            Self::RateLimit => "Too many requests. Please wait a moment and retry.",
            Self::Timeout => "The request timed out. Please try again.",
            Self::Authentication => "Signature verification failed. Please try signing again.",
            Self::Recoverable => "Something went wrong. Please try again.",
        }
    }

    /// Whether the category is retried when no policy keyword decides.
    #[must_use]
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Recoverable | Self::Network | Self::Timeout)
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Fatal => "FATAL",
            Self::RateLimit => "RATE_LIMIT",
            Self::Timeout => "TIMEOUT",
            Self::Network => "NETWORK",
            Self::Authentication => "AUTHENTICATION",
            Self::Recoverable => "RECOVERABLE",
        };
        f.write_str(s)
    }
}

/// How a rule inspects the lower-cased message.
#[derive(Debug, Clone, Copy)]
enum Matcher {
    /// Any of the substrings is present.
    Any(&'static [&'static str]),
    /// All of the substrings are present.
    All(&'static [&'static str]),
}

impl Matcher {
    fn matches(self, haystack: &str) -> bool {
        match self {
            Self::Any(needles) => needles.iter().any(|n| haystack.contains(n)),
            Self::All(needles) => needles.iter().all(|n| haystack.contains(n)),
        }
    }
}

/// Classification rules in priority order.
const RULES: &[(ErrorCategory, Matcher)] = &[
    (
        ErrorCategory::Fatal,
        Matcher::Any(&[
            "invalid-token",
            "expired-token",
            "invalid-credential",
            "user-disabled",
            "permission-denied",
        ]),
    ),
    (ErrorCategory::RateLimit, Matcher::All(&["rate", "limit"])),
    (ErrorCategory::Timeout, Matcher::Any(&["timeout"])),
    (
        ErrorCategory::Network,
        Matcher::Any(&["network", "connection", "offline"]),
    ),
    (
        ErrorCategory::Authentication,
        Matcher::Any(&["auth", "sign", "token"]),
    ),
];

/// Classifies an error message. Matching is case-insensitive.
#[must_use]
pub fn categorize_error(message: &str) -> ErrorCategory {
    let lowered = message.to_lowercase();
    RULES
        .iter()
        .find(|(_, matcher)| matcher.matches(&lowered))
        .map_or(ErrorCategory::Recoverable, |(category, _)| *category)
}

/// Decides whether a failed attempt should be retried under `policy`.
///
/// Policy fatal keywords veto the retry, policy retryable keywords force it,
/// and otherwise the message category decides.
#[must_use]
pub fn should_retry(message: &str, policy: &RetryPolicy) -> bool {
    let lowered = message.to_lowercase();
    let hit = |keywords: &[String]| {
        keywords
            .iter()
            .any(|k| lowered.contains(k.to_lowercase().as_str()))
    };
    if hit(&policy.fatal_errors) {
        return false;
    }
    if hit(&policy.retryable_errors) {
        return true;
    }
    categorize_error(message).is_transient()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_markers() {
        assert_eq!(categorize_error("invalid-token"), ErrorCategory::Fatal);
        assert_eq!(categorize_error("auth/user-disabled"), ErrorCategory::Fatal);
        assert_eq!(
            categorize_error("invalid-token: network error"),
            ErrorCategory::Fatal
        );
    }

    #[test]
    fn test_timeout_wins_over_network() {
        assert_eq!(categorize_error("timeout occurred"), ErrorCategory::Timeout);
        assert_eq!(
            categorize_error("Connection timeout while reaching node"),
            ErrorCategory::Timeout
        );
    }

    #[test]
    fn test_network_and_rate_limit() {
        assert_eq!(
            categorize_error("network connection failed"),
            ErrorCategory::Network
        );
        assert_eq!(categorize_error("Device is OFFLINE"), ErrorCategory::Network);
        assert_eq!(
            categorize_error("Rate limit exceeded"),
            ErrorCategory::RateLimit
        );
        // Only one of the two rate-limit words.
        assert_eq!(categorize_error("limit reached"), ErrorCategory::Recoverable);
    }

    #[test]
    fn test_authentication_and_default() {
        assert_eq!(
            categorize_error("User rejected the sign request"),
            ErrorCategory::Authentication
        );
        assert_eq!(categorize_error("something odd"), ErrorCategory::Recoverable);
        assert_eq!(categorize_error(""), ErrorCategory::Recoverable);
    }

    #[test]
    fn test_should_retry_policy_keywords() {
        let policy = RetryPolicy {
            retryable_errors: vec!["flaky".into()],
            fatal_errors: vec!["User Rejected".into()],
            ..RetryPolicy::standard()
        };
        assert!(!should_retry("user rejected request (network)", &policy));
        assert!(should_retry("flaky signer", &policy));
        assert!(should_retry("network down", &policy));
        assert!(should_retry("request timeout", &policy));
        assert!(!should_retry("invalid-credential", &policy));
        assert!(!should_retry("signature mismatch", &policy));
    }

    #[test]
    fn test_user_messages_are_distinct() {
        assert!(ErrorCategory::Network.user_message().contains("connection"));
        assert!(ErrorCategory::Fatal.user_message().contains("credentials"));
        assert!(ErrorCategory::Authentication.user_message().contains("signing"));
    }
}
