//! Millisecond timestamps for authentication challenges and connection snapshots.
//!
//! Challenge messages embed the issuing time in milliseconds since the Unix
//! epoch, and the server recomputes the message from that exact value, so the
//! type keeps the raw integer intact across the wire.

use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::ops::Add;
use std::time::{Duration, SystemTime};

/// Milliseconds since the Unix epoch (1970-01-01T00:00:00Z).
///
/// Serialized as a plain JSON number, matching what JavaScript clients produce
/// with `Date.now()`.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Ord, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpochMillis(u64);

impl Display for EpochMillis {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<Duration> for EpochMillis {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        Self(self.0.saturating_add(duration_millis(rhs)))
    }
}

impl EpochMillis {
    /// Creates a timestamp from a raw millisecond value.
    #[must_use]
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    /// Returns the current system time.
    ///
    /// A clock set before the Unix epoch reads as zero.
    #[must_use]
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map_or(0, duration_millis);
        Self(millis)
    }

    /// Returns the raw millisecond value.
    #[must_use]
    pub const fn as_millis(&self) -> u64 {
        self.0
    }

    /// Time elapsed from `self` until `later`, saturating at zero.
    #[must_use]
    pub const fn elapsed_until(&self, later: Self) -> Duration {
        Duration::from_millis(later.0.saturating_sub(self.0))
    }
}

fn duration_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
