//! Wall-clock stall budgets for confirmation-waiting steps.
//!
//! Unlike the teacher's general-purpose timeout manager, this spec only
//! needs two named budgets (storage-upload confirmation, on-chain tx
//! confirmation) checked against a step's first-attempt timestamp, so
//! this is a narrow elapsed-time helper rather than a registry of
//! in-flight timers.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Returns `true` once `started_at` is more than `budget` in the past,
/// meaning the step should yield `STALLED` instead of continuing to
/// retry.
pub fn budget_exceeded(started_at: DateTime<Utc>, budget: Duration) -> bool {
    let elapsed = Utc::now().signed_duration_since(started_at);
    match chrono::Duration::from_std(budget) {
        Ok(budget) => elapsed > budget,
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_exceeded_immediately() {
        assert!(!budget_exceeded(Utc::now(), Duration::from_secs(60)));
    }

    #[test]
    fn exceeded_when_started_in_the_past() {
        let started = Utc::now() - chrono::Duration::seconds(120);
        assert!(budget_exceeded(started, Duration::from_secs(60)));
    }
}
