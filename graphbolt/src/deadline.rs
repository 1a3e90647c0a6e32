use std::time::Duration;

use tokio::time::Instant;

/// A monotonic time budget shared by everything that can block: connection
/// acquisition, routing refresh and socket I/O.
///
/// A deadline is either unlimited (no expiry) or anchored to an absolute
/// [`Instant`]. The timeout it was originally constructed from is kept around
/// so that timeout errors can name the configured value instead of whatever
/// remains of it.
#[derive(Clone, Copy, Debug, Default)]
pub struct Deadline {
    at: Option<Instant>,
    original: Option<Duration>,
}

impl Deadline {
    /// A deadline that never expires.
    pub fn unlimited() -> Self {
        Self::default()
    }

    /// A deadline expiring `timeout` from now.
    pub fn from_timeout(timeout: Duration) -> Self {
        Deadline {
            at: Some(Instant::now() + timeout),
            original: Some(timeout),
        }
    }

    /// `None` means unlimited.
    pub fn from_timeout_opt(timeout: Option<Duration>) -> Self {
        match timeout {
            Some(timeout) => Self::from_timeout(timeout),
            None => Self::unlimited(),
        }
    }

    /// The remaining budget: `None` means block indefinitely, `Some(0)` means
    /// the deadline has expired.
    pub fn to_timeout(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.to_timeout() == Some(Duration::ZERO)
    }

    /// The more restrictive of the two deadlines. [`Deadline::unlimited`] is
    /// the identity.
    pub fn merge(self, other: Deadline) -> Deadline {
        match (self.at, other.at) {
            (Some(a), Some(b)) if b < a => other,
            (Some(_), _) => self,
            (None, _) => other,
        }
    }

    /// Merge with a plain timeout starting now; `None` is the identity.
    pub fn merge_timeout(self, timeout: Option<Duration>) -> Deadline {
        self.merge(Deadline::from_timeout_opt(timeout))
    }

    /// The timeout this deadline was constructed from, in seconds, for error
    /// messages. Falls back to the remaining budget.
    pub fn original_secs(&self) -> f64 {
        self.original
            .or_else(|| self.to_timeout())
            .map(|d| d.as_secs_f64())
            .unwrap_or(f64::INFINITY)
    }
}
