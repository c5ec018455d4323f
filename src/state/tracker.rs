use std::time::SystemTime;

use crate::dao::models::{SessionEntity, SessionStatus};

/// A question became active on the observed session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuestionChange {
    /// Index of the question that opened.
    pub question_index: u32,
    /// Shared start instant of that question.
    pub started_at: Option<SystemTime>,
}

/// Follows session records and reports genuine question activations.
///
/// Repeated deliveries of the same record, or a status flip that keeps the index, never
/// count as a new question.
#[derive(Debug, Default, Clone)]
pub struct QuestionTracker {
    active_index: Option<u32>,
}

impl QuestionTracker {
    /// Feed the next observed record.
    pub fn observe(&mut self, session: &SessionEntity) -> Option<QuestionChange> {
        if session.status != SessionStatus::Active
            || self.active_index == Some(session.current_question_index)
        {
            return None;
        }

        self.active_index = Some(session.current_question_index);
        Some(QuestionChange {
            question_index: session.current_question_index,
            started_at: session.question_start_time,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dao::models::SessionCode;

    fn record(status: SessionStatus, index: u32) -> SessionEntity {
        let mut session = SessionEntity::new(SessionCode::generate(), "host".into(), SystemTime::now());
        session.status = status;
        session.current_question_index = index;
        session.question_start_time = Some(SystemTime::UNIX_EPOCH);
        session
    }

    #[test]
    fn reports_each_activation_once() {
        let mut tracker = QuestionTracker::default();

        assert_eq!(tracker.observe(&record(SessionStatus::Waiting, 0)), None);

        let change = tracker.observe(&record(SessionStatus::Active, 0)).unwrap();
        assert_eq!(change.question_index, 0);
        assert_eq!(tracker.observe(&record(SessionStatus::Active, 0)), None);

        assert_eq!(tracker.observe(&record(SessionStatus::ShowingResults, 0)), None);
        assert_eq!(
            tracker
                .observe(&record(SessionStatus::Active, 1))
                .map(|change| change.question_index),
            Some(1)
        );
        assert_eq!(tracker.observe(&record(SessionStatus::Finished, 1)), None);
    }

    #[test]
    fn advance_straight_from_active_is_detected() {
        let mut tracker = QuestionTracker::default();
        tracker.observe(&record(SessionStatus::Active, 0));

        let mut next = record(SessionStatus::Active, 1);
        next.question_start_time = Some(SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(30));
        let change = tracker.observe(&next).unwrap();
        assert_eq!(change.question_index, 1);
        assert_eq!(change.started_at, next.question_start_time);
    }

    #[test]
    fn results_screen_for_same_index_does_not_reset() {
        let mut tracker = QuestionTracker::default();
        tracker.observe(&record(SessionStatus::Active, 2));
        assert_eq!(tracker.observe(&record(SessionStatus::ShowingResults, 2)), None);
        assert_eq!(tracker.observe(&record(SessionStatus::Active, 2)), None);
    }
}
