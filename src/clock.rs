//! Deadline arithmetic on the tokio clock.
//!
//! Timeouts come from callers and config, so `Duration::MAX` is a legal
//! input; adding it to an `Instant` panics. Everything here saturates.

use std::time::Duration;

use tokio::time::Instant;

/// About a century. Any timeout longer than this waits forever in practice.
pub const NO_EXPIRY: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// `start + timeout`, clamped to [`NO_EXPIRY`].
pub fn deadline_from(start: Instant, timeout: Duration) -> Instant {
    start + timeout.min(NO_EXPIRY)
}

/// `now + timeout`, clamped to [`NO_EXPIRY`].
pub fn deadline_in(timeout: Duration) -> Instant {
    deadline_from(Instant::now(), timeout)
}
