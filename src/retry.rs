//! Retry backoff policy (§4.8).
//!
//! Ported from `orch/exec/retry.py`.

/// `backoff_for_attempt(i, schedule)`: `i` is the zero-based retry index
/// (the first retry is `i == 0`). If `schedule` is non-empty, clamp `i` to
/// its last index; otherwise fall back to `min(60, 2^i)`.
pub fn backoff_for_attempt(i: u32, schedule: &[f64]) -> f64 {
    if !schedule.is_empty() {
        let idx = (i as usize).min(schedule.len() - 1);
        schedule[idx]
    } else {
        (2f64.powi(i as i32)).min(60.0)
    }
}

pub struct Outcome {
    pub attempts: u32,
    pub retries: u32,
    pub timed_out: bool,
    pub exit_code: Option<i32>,
    pub canceled: bool,
    pub start_failed: bool,
}

/// Whether a completed attempt should be retried: retry headroom remains,
/// the outcome looks retryable (timed out, or a non-zero/absent exit code),
/// and it was not canceled or a spawn failure.
pub fn should_retry(outcome: &Outcome) -> bool {
    if outcome.canceled || outcome.start_failed {
        return false;
    }
    if outcome.attempts > outcome.retries {
        return false;
    }
    outcome.timed_out || outcome.exit_code.map(|c| c != 0).unwrap_or(true)
}
