//! Countdown derived from the shared question start time.

use std::time::{Duration, SystemTime};

/// Time left on a question.
///
/// Every client computes the same value from the shared start instant. A start time in the
/// future (clock skew) counts as no time elapsed; an expired question saturates at zero.
pub fn remaining(time_limit: Duration, started_at: SystemTime, now: SystemTime) -> Duration {
    let elapsed = now.duration_since(started_at).unwrap_or_default();
    time_limit.saturating_sub(elapsed)
}

/// Elapsed time between the question start and `now`, clamped at zero.
pub fn elapsed_ms(started_at: SystemTime, now: SystemTime) -> u64 {
    let elapsed = now.duration_since(started_at).unwrap_or_default();
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// The running question as seen by one client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestionTimer {
    /// Question the timer belongs to.
    pub question_index: u32,
    /// Shared start instant.
    pub started_at: SystemTime,
    /// Duration granted to answer.
    pub time_limit: Duration,
}

impl QuestionTimer {
    /// Time left at `now`.
    pub fn remaining(&self, now: SystemTime) -> Duration {
        remaining(self.time_limit, self.started_at, now)
    }

    /// Whether at most `threshold` is left at `now`.
    pub fn is_due(&self, now: SystemTime, threshold: Duration) -> bool {
        self.remaining(now) <= threshold
    }
}

/// At-most-once guard for the deadline action of a question.
///
/// The latch only re-arms when a different question index is observed, so a refreshed
/// session record for the same question never triggers a second attempt.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DeadlineLatch {
    question_index: Option<u32>,
    attempted: bool,
}

impl DeadlineLatch {
    /// Track `question_index`, re-arming only if it differs from the tracked one.
    pub fn track(&mut self, question_index: u32) {
        if self.question_index != Some(question_index) {
            self.question_index = Some(question_index);
            self.attempted = false;
        }
    }

    /// Claim the single attempt for the tracked question. Returns `false` once spent.
    pub fn try_fire(&mut self) -> bool {
        if self.question_index.is_none() || self.attempted {
            return false;
        }
        self.attempted = true;
        true
    }

    /// Hand the attempt back after a write that failed for transient reasons.
    pub fn release(&mut self) {
        self.attempted = false;
    }

    /// Whether the attempt for the tracked question was claimed.
    pub fn has_fired(&self) -> bool {
        self.attempted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start() -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000)
    }

    #[test]
    fn remaining_is_pure_and_deterministic() {
        let now = start() + Duration::from_millis(29_900);
        let left = remaining(Duration::from_secs(30), start(), now);
        assert_eq!(left, Duration::from_millis(100));
        assert_eq!(left, remaining(Duration::from_secs(30), start(), now));
    }

    #[test]
    fn remaining_saturates_at_zero() {
        let now = start() + Duration::from_secs(45);
        assert_eq!(remaining(Duration::from_secs(30), start(), now), Duration::ZERO);
    }

    #[test]
    fn future_start_counts_as_no_elapsed_time() {
        let now = start() - Duration::from_secs(2);
        assert_eq!(
            remaining(Duration::from_secs(30), start(), now),
            Duration::from_secs(30)
        );
        assert_eq!(elapsed_ms(start(), now), 0);
    }

    #[test]
    fn timer_is_due_within_threshold() {
        let timer = QuestionTimer {
            question_index: 0,
            started_at: start(),
            time_limit: Duration::from_secs(15),
        };
        let threshold = Duration::from_millis(100);
        assert!(!timer.is_due(start() + Duration::from_millis(14_800), threshold));
        assert!(timer.is_due(start() + Duration::from_millis(14_900), threshold));
        assert!(timer.is_due(start() + Duration::from_secs(60), threshold));
    }

    #[test]
    fn latch_fires_once_per_question() {
        let mut latch = DeadlineLatch::default();
        assert!(!latch.try_fire());

        latch.track(0);
        assert!(latch.try_fire());
        assert!(!latch.try_fire());

        latch.track(0);
        assert!(!latch.try_fire());
        assert!(latch.has_fired());

        latch.track(1);
        assert!(!latch.has_fired());
        assert!(latch.try_fire());
    }
}
