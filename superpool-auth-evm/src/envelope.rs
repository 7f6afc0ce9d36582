//! Safe wallet signature envelopes.
//!
//! A Safe cannot produce a recoverable ECDSA signature, so clients send
//! `safe-wallet:<address>:<nonce>:<timestamp>:sig:<signature>`, binding the
//! owner signature bytes to the challenge they answer. The older form without
//! the `:sig:` segment carries no cryptographic proof and is always rejected.

use alloy_primitives::{Bytes, hex};
use superpool_auth::proto::SAFE_SIGNATURE_PREFIX;
use superpool_auth::timestamp::EpochMillis;

const SIGNATURE_MARKER: &str = ":sig:";

/// Why an envelope was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum EnvelopeError {
    /// The format-only envelope with no signature bytes.
    #[error("insecure legacy Safe signature format without embedded signature")]
    LegacyFormat,
    /// Not a parseable envelope.
    #[error("malformed Safe signature envelope: {0}")]
    Malformed(&'static str),
    /// The envelope answers a different challenge.
    #[error("Safe signature envelope {0} does not match the request")]
    Mismatch(&'static str),
}

impl EnvelopeError {
    /// Whether this is the legacy format rather than a malformed envelope.
    #[must_use]
    pub const fn is_legacy(&self) -> bool {
        matches!(self, Self::LegacyFormat)
    }
}

/// A parsed envelope whose header matched the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeEnvelope {
    /// Owner signature bytes, passed to `isValidSignature`.
    pub signature: Bytes,
}

/// Whether `signature` uses the Safe envelope prefix.
#[must_use]
pub fn is_safe_envelope(signature: &str) -> bool {
    signature.starts_with(SAFE_SIGNATURE_PREFIX)
}

impl SafeEnvelope {
    /// Parses `raw` and checks that it answers the challenge
    /// `(wallet_address, nonce, timestamp)`.
    ///
    /// The address is compared case-insensitively; nonce and timestamp must
    /// match exactly.
    ///
    /// # Errors
    ///
    /// Returns [`EnvelopeError::LegacyFormat`] for the envelope without
    /// signature bytes, [`EnvelopeError::Mismatch`] when a header field
    /// differs, and [`EnvelopeError::Malformed`] otherwise.
    pub fn parse(
        raw: &str,
        wallet_address: &str,
        nonce: &str,
        timestamp: EpochMillis,
    ) -> Result<Self, EnvelopeError> {
        let body = raw
            .strip_prefix(SAFE_SIGNATURE_PREFIX)
            .ok_or(EnvelopeError::Malformed("missing safe-wallet prefix"))?;

        let Some((header, signature)) = body.split_once(SIGNATURE_MARKER) else {
            return if body.split(':').count() == 3 {
                Err(EnvelopeError::LegacyFormat)
            } else {
                Err(EnvelopeError::Malformed("missing signature segment"))
            };
        };

        let mut fields = header.split(':');
        let (Some(address), Some(envelope_nonce), Some(envelope_ts), None) =
            (fields.next(), fields.next(), fields.next(), fields.next())
        else {
            return Err(EnvelopeError::Malformed("expected address, nonce and timestamp"));
        };

        if !address.eq_ignore_ascii_case(wallet_address) {
            return Err(EnvelopeError::Mismatch("address"));
        }
        if envelope_nonce != nonce {
            return Err(EnvelopeError::Mismatch("nonce"));
        }
        if envelope_ts != timestamp.to_string() {
            return Err(EnvelopeError::Mismatch("timestamp"));
        }

        if signature.trim_start_matches("0x").is_empty() {
            return Err(EnvelopeError::Malformed("empty signature"));
        }
        let bytes = hex::decode(signature)
            .map_err(|_| EnvelopeError::Malformed("signature is not hex"))?;
        Ok(Self {
            signature: bytes.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADDR: &str = "0x742d35Cc6634C0532925a3b844Bc454e4438f44e";

    fn ts() -> EpochMillis {
        EpochMillis::from_millis(1_700_000_000_000)
    }

    #[test]
    fn test_parses_enhanced_envelope() {
        let raw = format!("safe-wallet:{ADDR}:n1:1700000000000:sig:0xdeadbeef");
        let envelope = SafeEnvelope::parse(&raw, &ADDR.to_lowercase(), "n1", ts()).unwrap();
        assert_eq!(envelope.signature.as_ref(), &[0xde, 0xad, 0xbe, 0xef]);
    }

    #[test]
    fn test_rejects_legacy_envelope() {
        let raw = format!("safe-wallet:{ADDR}:n1:1700000000000");
        let err = SafeEnvelope::parse(&raw, ADDR, "n1", ts()).unwrap_err();
        assert!(err.is_legacy());
    }

    #[test]
    fn test_rejects_mismatch_and_malformed() {
        let raw = format!("safe-wallet:{ADDR}:other:1700000000000:sig:0x01");
        assert_eq!(
            SafeEnvelope::parse(&raw, ADDR, "n1", ts()),
            Err(EnvelopeError::Mismatch("nonce"))
        );
        let raw = format!("safe-wallet:{ADDR}:n1:1:sig:0x01");
        assert_eq!(
            SafeEnvelope::parse(&raw, ADDR, "n1", ts()),
            Err(EnvelopeError::Mismatch("timestamp"))
        );
        let raw = format!("safe-wallet:{ADDR}:n1:1700000000000:sig:");
        assert!(matches!(
            SafeEnvelope::parse(&raw, ADDR, "n1", ts()),
            Err(EnvelopeError::Malformed(_))
        ));
        let raw = format!("safe-wallet:{ADDR}:n1:1700000000000:sig:zz");
        assert!(matches!(
            SafeEnvelope::parse(&raw, ADDR, "n1", ts()),
            Err(EnvelopeError::Malformed(_))
        ));
        assert!(!is_safe_envelope("0xabcdef"));
    }
}
