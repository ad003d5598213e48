//! Wall-clock helpers.
//!
//! Kept in one place so every caller that needs "now" (timestamps sent to
//! the orchestrator) goes through the same conversion.

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch, saturating to `0` if the clock is
/// somehow set before it.
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}
