use std::time::{Instant, SystemTime};

use thiserror::Error;
use uuid::Uuid;

use crate::dao::models::{SessionEntity, SessionGuard, SessionPatch, SessionStatus};

/// Status and question index of a session: everything a transition depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPhase {
    /// Lifecycle status.
    pub status: SessionStatus,
    /// Zero-based question index.
    pub question_index: u32,
}

impl SessionPhase {
    /// Phase of a stored session record.
    pub fn of(session: &SessionEntity) -> Self {
        Self {
            status: session.status,
            question_index: session.current_question_index,
        }
    }
}

/// Host commands that move a session forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Leave the lobby and open the first question.
    Start,
    /// Score the current question and open the next one, or finish after the last.
    Advance,
    /// Score the current question and show the rankings.
    RevealRankings,
}

/// Error returned when attempting to apply an invalid transition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{event:?} cannot be applied while {} at question {}", .from.status, .from.question_index)]
pub struct InvalidTransition {
    /// The phase the session was in when the invalid event was received.
    pub from: SessionPhase,
    /// The event that cannot be applied from this phase.
    pub event: SessionEvent,
}

/// Errors that can occur when planning a state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanError {
    /// The session is no longer in the phase the caller observed.
    PhaseChanged {
        /// Phase the caller expected to leave.
        expected: SessionPhase,
        /// Phase of the stored record.
        actual: SessionPhase,
    },
    /// The requested transition is not valid from the current phase.
    InvalidTransition(InvalidTransition),
}

/// Errors that can occur when applying a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Errors that can occur when aborting a planned state machine transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortError {
    /// No transition is currently pending.
    NoPending,
    /// Plan ID does not match the pending plan.
    IdMismatch {
        /// Expected plan ID.
        expected: PlanId,
        /// Provided plan ID.
        got: PlanId,
    },
}

/// Unique identifier for a planned state transition.
pub type PlanId = Uuid;

/// A validated transition that has not been written yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Plan {
    /// Unique identifier for this plan.
    pub id: PlanId,
    /// Phase the session is currently in.
    pub from: SessionPhase,
    /// Phase the session will be in once applied.
    pub to: SessionPhase,
    /// Event that triggered this transition.
    pub event: SessionEvent,
    /// Question whose answers must be scored before the write.
    pub score_question: Option<u32>,
    /// Start instant of the question opened by this transition.
    pub question_start_time: Option<SystemTime>,
    /// Timestamp when this plan was created.
    pub pending_since: Instant,
}

impl Plan {
    /// Store-side guard: the write only lands while the record still has the origin phase.
    pub fn guard(&self) -> SessionGuard {
        SessionGuard {
            status: self.from.status,
            current_question_index: self.from.question_index,
        }
    }

    /// Fields written by this transition.
    pub fn patch(&self) -> SessionPatch {
        SessionPatch {
            status: self.to.status,
            current_question_index: self.to.question_index,
            question_start_time: self.question_start_time,
        }
    }
}

/// Session lifecycle: `waiting → active → showing_results → active … → finished`.
///
/// The machine is seeded from the stored record before each host command; the store stays
/// the single source of truth.
#[derive(Debug, Clone)]
pub struct SessionStateMachine {
    phase: SessionPhase,
    question_count: u32,
    pending: Option<Plan>,
}

impl SessionStateMachine {
    /// Seed a machine from the current record and the size of the question bank.
    pub fn from_record(session: &SessionEntity, question_count: u32) -> Self {
        Self {
            phase: SessionPhase::of(session),
            question_count,
            pending: None,
        }
    }

    /// Inspect the current phase.
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// Plan a transition by validating that the event can be applied from the current phase.
    /// `now` becomes the start time of a question opened by the transition.
    /// A plan that was neither applied nor aborted is replaced.
    pub fn plan(&mut self, event: SessionEvent, now: SystemTime) -> Result<Plan, PlanError> {
        let (to, score_question) = self
            .compute_transition(event)
            .map_err(PlanError::InvalidTransition)?;

        let opens_question = to.status == SessionStatus::Active;
        let plan = Plan {
            id: Uuid::new_v4(),
            from: self.phase,
            to,
            event,
            score_question,
            question_start_time: opens_question.then_some(now),
            pending_since: Instant::now(),
        };

        self.pending = Some(plan.clone());

        Ok(plan)
    }

    /// Like [`plan`](Self::plan), but only while the session is still in `expected`.
    ///
    /// Callers reacting to something they observed (a deadline of question N) pass the phase
    /// they saw, so a command that was already carried out by someone else is not repeated
    /// against the next phase.
    pub fn plan_from(
        &mut self,
        expected: SessionPhase,
        event: SessionEvent,
        now: SystemTime,
    ) -> Result<Plan, PlanError> {
        if self.phase != expected {
            return Err(PlanError::PhaseChanged {
                expected,
                actual: self.phase,
            });
        }
        self.plan(event, now)
    }

    /// Apply a planned transition, returning the new phase.
    pub fn apply(&mut self, plan_id: PlanId) -> Result<SessionPhase, ApplyError> {
        let plan = self.pending.take().ok_or(ApplyError::NoPending)?;

        if plan.id != plan_id {
            let expected_plan_id = plan.id;
            self.pending = Some(plan);
            return Err(ApplyError::IdMismatch {
                expected: expected_plan_id,
                got: plan_id,
            });
        }

        self.phase = plan.to;
        Ok(self.phase)
    }

    /// Abort a planned transition without applying it.
    pub fn abort(&mut self, plan_id: PlanId) -> Result<(), AbortError> {
        let plan = self.pending.as_ref().ok_or(AbortError::NoPending)?;

        if plan.id != plan_id {
            return Err(AbortError::IdMismatch {
                expected: plan.id,
                got: plan_id,
            });
        }

        self.pending = None;
        Ok(())
    }

    /// Target phase and the question to score, if the transition is valid.
    fn compute_transition(
        &self,
        event: SessionEvent,
    ) -> Result<(SessionPhase, Option<u32>), InvalidTransition> {
        use SessionStatus::*;

        let SessionPhase {
            status,
            question_index: index,
        } = self.phase;

        let next = match (status, event) {
            (Waiting, SessionEvent::Start) if self.question_count > 0 => (
                SessionPhase {
                    status: Active,
                    question_index: 0,
                },
                None,
            ),
            (Active | ShowingResults, SessionEvent::Advance) => {
                let next_index = index.saturating_add(1);
                let to = if next_index >= self.question_count {
                    SessionPhase {
                        status: Finished,
                        question_index: index,
                    }
                } else {
                    SessionPhase {
                        status: Active,
                        question_index: next_index,
                    }
                };
                (to, Some(index))
            }
            (Active, SessionEvent::RevealRankings) => (
                SessionPhase {
                    status: ShowingResults,
                    question_index: index,
                },
                Some(index),
            ),
            _ => {
                return Err(InvalidTransition {
                    from: self.phase,
                    event,
                });
            }
        };

        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::dao::models::SessionCode;

    fn machine(status: SessionStatus, index: u32, count: u32) -> SessionStateMachine {
        let mut session = SessionEntity::new(SessionCode::generate(), "host".into(), SystemTime::now());
        session.status = status;
        session.current_question_index = index;
        SessionStateMachine::from_record(&session, count)
    }

    fn apply(sm: &mut SessionStateMachine, event: SessionEvent) -> (SessionPhase, Plan) {
        let plan = sm.plan(event, SystemTime::now()).unwrap();
        (sm.apply(plan.id).unwrap(), plan)
    }

    #[test]
    fn start_opens_first_question_with_fresh_start_time() {
        let mut sm = machine(SessionStatus::Waiting, 0, 10);
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(42);

        let plan = sm.plan(SessionEvent::Start, now).unwrap();
        assert_eq!(plan.score_question, None);
        assert_eq!(
            plan.patch(),
            SessionPatch {
                status: SessionStatus::Active,
                current_question_index: 0,
                question_start_time: Some(now),
            }
        );
        assert_eq!(
            plan.guard(),
            SessionGuard {
                status: SessionStatus::Waiting,
                current_question_index: 0,
            }
        );
    }

    #[test]
    fn full_session_walkthrough() {
        let mut sm = machine(SessionStatus::Waiting, 0, 2);

        let (phase, _) = apply(&mut sm, SessionEvent::Start);
        assert_eq!(phase.status, SessionStatus::Active);

        let (phase, plan) = apply(&mut sm, SessionEvent::RevealRankings);
        assert_eq!(phase.status, SessionStatus::ShowingResults);
        assert_eq!(phase.question_index, 0);
        assert_eq!(plan.score_question, Some(0));
        assert_eq!(plan.question_start_time, None);

        let (phase, plan) = apply(&mut sm, SessionEvent::Advance);
        assert_eq!(phase.status, SessionStatus::Active);
        assert_eq!(phase.question_index, 1);
        assert_eq!(plan.score_question, Some(0));
        assert!(plan.question_start_time.is_some());

        let (phase, plan) = apply(&mut sm, SessionEvent::Advance);
        assert_eq!(phase.status, SessionStatus::Finished);
        assert_eq!(phase.question_index, 1);
        assert_eq!(plan.score_question, Some(1));
        assert_eq!(plan.question_start_time, None);
    }

    #[test]
    fn advance_at_last_index_finishes_without_new_start() {
        let mut sm = machine(SessionStatus::Active, 9, 10);
        let plan = sm.plan(SessionEvent::Advance, SystemTime::now()).unwrap();
        assert_eq!(plan.to.status, SessionStatus::Finished);
        assert_eq!(plan.patch().question_start_time, None);
    }

    #[test]
    fn invalid_events_are_rejected() {
        for (status, event) in [
            (SessionStatus::Waiting, SessionEvent::Advance),
            (SessionStatus::Waiting, SessionEvent::RevealRankings),
            (SessionStatus::Active, SessionEvent::Start),
            (SessionStatus::ShowingResults, SessionEvent::RevealRankings),
            (SessionStatus::Finished, SessionEvent::Advance),
        ] {
            let mut sm = machine(status, 0, 3);
            assert!(
                matches!(
                    sm.plan(event, SystemTime::now()),
                    Err(PlanError::InvalidTransition(_))
                ),
                "{event:?} from {status}"
            );
        }
    }

    #[test]
    fn empty_bank_cannot_start() {
        let mut sm = machine(SessionStatus::Waiting, 0, 0);
        assert!(sm.plan(SessionEvent::Start, SystemTime::now()).is_err());
    }

    #[test]
    fn abort_discards_the_plan() {
        let mut sm = machine(SessionStatus::Waiting, 0, 3);
        let plan = sm.plan(SessionEvent::Start, SystemTime::now()).unwrap();

        sm.abort(plan.id).unwrap();
        assert_eq!(sm.abort(plan.id), Err(AbortError::NoPending));
        assert_eq!(sm.apply(plan.id), Err(ApplyError::NoPending));
        assert_eq!(sm.phase().status, SessionStatus::Waiting);
    }

    #[test]
    fn planning_from_a_phase_that_moved_on_is_rejected() {
        let mut sm = machine(SessionStatus::Active, 1, 4);
        let seen = SessionPhase {
            status: SessionStatus::Active,
            question_index: 0,
        };

        assert_eq!(
            sm.plan_from(seen, SessionEvent::Advance, SystemTime::now()),
            Err(PlanError::PhaseChanged {
                expected: seen,
                actual: sm.phase(),
            })
        );
        assert_eq!(sm.abort(Uuid::new_v4()), Err(AbortError::NoPending));

        let current = sm.phase();
        let plan = sm
            .plan_from(current, SessionEvent::Advance, SystemTime::now())
            .unwrap();
        assert_eq!(plan.to.question_index, 2);
    }

    #[test]
    fn apply_with_wrong_id_keeps_plan_pending() {
        let mut sm = machine(SessionStatus::Waiting, 0, 3);
        let plan = sm.plan(SessionEvent::Start, SystemTime::now()).unwrap();
        let other = Uuid::new_v4();

        assert_eq!(
            sm.apply(other),
            Err(ApplyError::IdMismatch {
                expected: plan.id,
                got: other,
            })
        );
        assert_eq!(sm.apply(plan.id).unwrap().status, SessionStatus::Active);
    }
}
