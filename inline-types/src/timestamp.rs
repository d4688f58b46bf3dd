//! Server dates.
//!
//! The server reports every date as whole seconds since the Unix epoch.
//! `UnixTime` keeps that representation and adds the little arithmetic the
//! sync cursors need (safety gaps, staleness checks).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Seconds since the Unix epoch, as reported by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnixTime(i64);

impl UnixTime {
    /// The Unix epoch itself.
    pub const EPOCH: Self = Self(0);

    /// Creates a timestamp from raw seconds.
    #[must_use]
    pub const fn from_secs(secs: i64) -> Self {
        Self(secs)
    }

    /// Current wall-clock time.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now().timestamp())
    }

    /// Raw seconds since the epoch.
    #[must_use]
    pub const fn as_secs(&self) -> i64 {
        self.0
    }

    /// Moves the timestamp back by `gap`, saturating at the epoch.
    #[must_use]
    pub fn saturating_sub(&self, gap: Duration) -> Self {
        let secs = i64::try_from(gap.as_secs()).unwrap_or(i64::MAX);
        Self(self.0.saturating_sub(secs).max(0))
    }

    /// Moves the timestamp forward by `gap`.
    #[must_use]
    pub fn saturating_add(&self, gap: Duration) -> Self {
        let secs = i64::try_from(gap.as_secs()).unwrap_or(i64::MAX);
        Self(self.0.saturating_add(secs))
    }

    /// Returns true if this timestamp lies more than `window` before `now`.
    #[must_use]
    pub fn is_older_than(&self, window: Duration, now: Self) -> bool {
        *self < now.saturating_sub(window)
    }

    /// Converts to a chrono `DateTime`, if representable.
    #[must_use]
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp(self.0, 0)
    }
}

impl From<DateTime<Utc>> for UnixTime {
    fn from(dt: DateTime<Utc>) -> Self {
        Self(dt.timestamp())
    }
}

impl fmt::Display for UnixTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_datetime() {
            Some(dt) => write!(f, "{}", dt.format("%Y-%m-%dT%H:%M:%SZ")),
            None => write!(f, "{}s", self.0),
        }
    }
}
