//! Deadline reactions attached to a live session view.
//!
//! A participant agent submits the timeout sentinel once per question when the countdown
//! runs out without an answer. A host agent optionally advances the session once per
//! question when its deadline elapses.

use std::time::Duration;

use tokio::{
    sync::{
        broadcast::{self, error::RecvError},
        watch,
    },
    task::AbortHandle,
};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::models::{AnswerKey, AnswerValue, SessionCode, SessionEntity, SessionStatus},
    error::ServiceError,
    services::{
        session_service::{self, SubmitOutcome},
        session_view::{TimerTick, ViewEvent},
    },
    state::{
        SessionEvent, SessionPhase, SharedState, timer::DeadlineLatch,
        transitions::run_session_transition,
    },
};

/// Who the agent acts for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentRole {
    /// Submits the timeout sentinel for this participant.
    Participant {
        /// Participant the sentinel is submitted for.
        participant_id: Uuid,
    },
    /// Advances the session when a question deadline elapses.
    Host {
        /// Token authorising host commands.
        host_token: String,
    },
}

/// What the agent did on a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickAction {
    Idle,
    Fire,
}

/// Owner of a running agent. Stopping is idempotent and also happens on drop.
#[derive(Debug)]
pub struct AgentHandle {
    task: AbortHandle,
}

impl AgentHandle {
    /// Stop reacting to deadlines.
    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for AgentHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawn an agent fed by the countdown in `events` and the record in `session`.
pub fn spawn(
    state: SharedState,
    code: SessionCode,
    role: AgentRole,
    events: broadcast::Receiver<ViewEvent>,
    session: watch::Receiver<Option<SessionEntity>>,
) -> AgentHandle {
    let task = tokio::spawn(run(state, code, role, events, session));
    AgentHandle {
        task: task.abort_handle(),
    }
}

struct Agent {
    state: SharedState,
    code: SessionCode,
    role: AgentRole,
    session: Option<SessionEntity>,
    latch: DeadlineLatch,
}

async fn run(
    state: SharedState,
    code: SessionCode,
    role: AgentRole,
    mut events: broadcast::Receiver<ViewEvent>,
    session: watch::Receiver<Option<SessionEntity>>,
) {
    let mut agent = Agent {
        state,
        code,
        role,
        session: None,
        latch: DeadlineLatch::default(),
    };

    loop {
        match events.recv().await {
            Ok(ViewEvent::QuestionStarted(change)) => agent.latch.track(change.question_index),
            Ok(ViewEvent::Timer(tick)) => {
                agent.session = session.borrow().clone();
                if agent.on_tick(tick) == TickAction::Fire {
                    agent.fire(tick.question_index).await;
                }
            }
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                debug!(code = %agent.code, skipped, "agent lagged behind view events");
            }
            Err(RecvError::Closed) => return,
        }
    }
}

impl Agent {
    fn threshold(&self) -> Duration {
        match self.role {
            AgentRole::Participant { .. } => self.state.config().sync().auto_submit_threshold_ms,
            AgentRole::Host { .. } => Duration::ZERO,
        }
    }

    fn on_tick(&mut self, tick: TimerTick) -> TickAction {
        if matches!(self.role, AgentRole::Host { .. }) && !self.state.config().auto_advance_on_deadline() {
            return TickAction::Idle;
        }
        let active = self.session.as_ref().is_some_and(|session| {
            session.status == SessionStatus::Active
                && session.current_question_index == tick.question_index
        });
        if !active || tick.remaining > self.threshold() {
            return TickAction::Idle;
        }

        // The view may have been joined mid-question.
        self.latch.track(tick.question_index);
        if self.latch.try_fire() {
            TickAction::Fire
        } else {
            TickAction::Idle
        }
    }

    async fn fire(&mut self, question_index: u32) {
        let result = match &self.role {
            AgentRole::Participant { participant_id } => {
                self.submit_timeout(*participant_id, question_index).await
            }
            AgentRole::Host { host_token } => {
                self.advance(host_token.clone(), question_index).await
            }
        };

        let Err(err) = result else {
            return;
        };
        let transient = matches!(
            err,
            ServiceError::Unavailable(_) | ServiceError::Degraded | ServiceError::Timeout
        );
        if transient {
            warn!(code = %self.code, question_index, error = %err, "deadline action failed; retrying next tick");
            self.latch.release();
        } else {
            debug!(code = %self.code, question_index, error = %err, "deadline action not applicable");
        }
    }

    async fn submit_timeout(&self, participant_id: Uuid, question_index: u32) -> Result<(), ServiceError> {
        let Some(session) = self.session.as_ref() else {
            return Ok(());
        };

        let store = self.state.require_store().await?;
        let key = AnswerKey {
            session_id: session.id,
            participant_id,
            question_index,
        };
        if store.find_answer(key).await?.is_some() {
            debug!(%participant_id, question_index, "answer already recorded; no timeout needed");
            return Ok(());
        }

        let outcome = session_service::record_answer(
            &self.state,
            session,
            participant_id,
            question_index,
            AnswerValue::Timeout,
        )
        .await?;
        if let SubmitOutcome::Recorded(_) = outcome {
            info!(code = %self.code, %participant_id, question_index, "timeout submitted");
        }
        Ok(())
    }

    async fn advance(&self, host_token: String, question_index: u32) -> Result<(), ServiceError> {
        // Only leave the question whose deadline was observed; another host agent or a
        // manual command may already have moved on.
        let observed = SessionPhase {
            status: SessionStatus::Active,
            question_index,
        };
        let updated = run_session_transition(
            &self.state,
            &self.code,
            &host_token,
            Some(observed),
            SessionEvent::Advance,
        )
        .await?;
        info!(
            code = %self.code,
            question_index,
            status = %updated.status,
            "deadline elapsed; session advanced"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::SystemTime};

    use super::*;
    use crate::{
        config::QuizConfig,
        dao::{
            models::SessionStatus,
            quiz_store::{QuizStore, memory::InMemoryQuizStore},
        },
        state::AppState,
    };

    fn agent(role: AgentRole, config: QuizConfig) -> Agent {
        let mut session = SessionEntity::new(SessionCode::generate(), "host".into(), SystemTime::now());
        session.status = SessionStatus::Active;
        Agent {
            state: AppState::new(config),
            code: session.code.clone(),
            role,
            session: Some(session),
            latch: DeadlineLatch::default(),
        }
    }

    fn tick(remaining_ms: u64) -> TimerTick {
        TimerTick {
            question_index: 0,
            remaining: Duration::from_millis(remaining_ms),
            time_limit: Duration::from_secs(30),
        }
    }

    #[test]
    fn participant_fires_once_within_threshold() {
        let mut agent = agent(
            AgentRole::Participant {
                participant_id: Uuid::new_v4(),
            },
            QuizConfig::default(),
        );

        assert_eq!(agent.on_tick(tick(5_000)), TickAction::Idle);
        assert_eq!(agent.on_tick(tick(100)), TickAction::Fire);
        assert_eq!(agent.on_tick(tick(0)), TickAction::Idle);
        assert_eq!(agent.on_tick(tick(0)), TickAction::Idle);
    }

    #[test]
    fn host_waits_for_zero_and_the_config_flag() {
        let role = AgentRole::Host {
            host_token: "t".into(),
        };

        let mut disabled = agent(role.clone(), QuizConfig::default());
        assert_eq!(disabled.on_tick(tick(0)), TickAction::Idle);

        let mut enabled = agent(role, QuizConfig::default().with_auto_advance(true));
        assert_eq!(enabled.on_tick(tick(100)), TickAction::Idle);
        assert_eq!(enabled.on_tick(tick(0)), TickAction::Fire);
        assert_eq!(enabled.on_tick(tick(0)), TickAction::Idle);
    }

    #[test]
    fn ticks_for_a_stale_question_are_ignored() {
        let mut agent = agent(
            AgentRole::Participant {
                participant_id: Uuid::new_v4(),
            },
            QuizConfig::default(),
        );
        let mut stale = tick(0);
        stale.question_index = 3;
        assert_eq!(agent.on_tick(stale), TickAction::Idle);
    }

    #[tokio::test]
    async fn failed_submission_is_retried() {
        let mut agent = agent(
            AgentRole::Participant {
                participant_id: Uuid::new_v4(),
            },
            QuizConfig::default(),
        );

        assert_eq!(agent.on_tick(tick(0)), TickAction::Fire);
        // No store installed: degraded, so the attempt is handed back.
        agent.fire(0).await;
        assert_eq!(agent.on_tick(tick(0)), TickAction::Fire);

        agent
            .state
            .set_store(Arc::new(InMemoryQuizStore::new()) as Arc<dyn QuizStore>)
            .await;
        // The participant is unknown to the store: not retried.
        agent.fire(0).await;
        assert_eq!(agent.on_tick(tick(0)), TickAction::Idle);
    }

    #[tokio::test]
    async fn host_does_not_advance_past_a_question_someone_else_left() {
        let mut host = agent(
            AgentRole::Host {
                host_token: "host".into(),
            },
            QuizConfig::default().with_auto_advance(true),
        );
        let store = InMemoryQuizStore::new();
        let mut stored = host.session.clone().unwrap();
        stored.current_question_index = 1;
        store.insert_session(stored.clone()).await.unwrap();
        host.state.set_store(Arc::new(store) as Arc<dyn QuizStore>).await;

        // The view still shows question 0 when its deadline tick arrives.
        assert_eq!(host.on_tick(tick(0)), TickAction::Fire);
        host.fire(0).await;
        assert_eq!(host.on_tick(tick(0)), TickAction::Idle);

        let session = host
            .state
            .require_store()
            .await
            .unwrap()
            .find_session_by_code(stored.code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.status, SessionStatus::Active);
        assert_eq!(session.current_question_index, 1);
    }
}
