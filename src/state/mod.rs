pub mod state_machine;
pub mod timer;
pub mod tracker;
pub mod transitions;

use std::{
    future::Future,
    sync::Arc,
    time::{Duration, SystemTime},
};

use dashmap::DashMap;
use tokio::sync::{Mutex, RwLock, watch};
use tokio::time::timeout;
use tracing::warn;

use crate::{
    clock::{Clock, SystemClock},
    config::QuizConfig,
    dao::{
        models::{SessionCode, SessionEntity},
        quiz_store::QuizStore,
    },
    error::ServiceError,
};

pub use self::state_machine::{
    AbortError, ApplyError, Plan, PlanError, PlanId, SessionEvent, SessionPhase,
    SessionStateMachine,
};

pub type SharedState = Arc<AppState>;

/// Central application state: the storage handle, the configuration and the transition gates.
pub struct AppState {
    store: RwLock<Option<Arc<dyn QuizStore>>>,
    config: Arc<QuizConfig>,
    clock: Arc<dyn Clock>,
    degraded: watch::Sender<bool>,
    session_gates: DashMap<SessionCode, Arc<Mutex<()>>>,
    transition_timeout: Option<Duration>,
}

impl AppState {
    /// Construct a new [`AppState`] wrapped in an [`Arc`] so it can be cloned cheaply.
    ///
    /// The application starts in degraded mode until a storage backend is installed.
    pub fn new(config: QuizConfig) -> SharedState {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Same as [`AppState::new`] with an explicit wall clock.
    pub fn with_clock(config: QuizConfig, clock: Arc<dyn Clock>) -> SharedState {
        let (degraded_tx, _rx) = watch::channel(true);
        let transition_timeout = Some(config.sync().transition_timeout_ms);
        Arc::new(Self {
            store: RwLock::new(None),
            config: Arc::new(config),
            clock,
            degraded: degraded_tx,
            session_gates: DashMap::new(),
            transition_timeout,
        })
    }

    /// Obtain a handle to the current store, if one is installed.
    pub async fn store(&self) -> Option<Arc<dyn QuizStore>> {
        let guard = self.store.read().await;
        guard.as_ref().cloned()
    }

    /// Current store, or [`ServiceError::Degraded`] when none is installed or it is unhealthy.
    pub async fn require_store(&self) -> Result<Arc<dyn QuizStore>, ServiceError> {
        if *self.degraded.borrow() {
            return Err(ServiceError::Degraded);
        }
        self.store().await.ok_or(ServiceError::Degraded)
    }

    /// Install a new store implementation and leave degraded mode.
    pub async fn set_store(&self, store: Arc<dyn QuizStore>) {
        {
            let mut guard = self.store.write().await;
            *guard = Some(store);
        }
        self.update_degraded(false);
    }

    /// Remove the current store and enter degraded mode.
    pub async fn clear_store(&self) {
        {
            let mut guard = self.store.write().await;
            guard.take();
        }
        self.update_degraded(true);
    }

    /// Current degraded flag.
    pub fn is_degraded(&self) -> bool {
        *self.degraded.borrow()
    }

    /// Subscribe to degraded mode updates.
    pub fn degraded_watcher(&self) -> watch::Receiver<bool> {
        self.degraded.subscribe()
    }

    /// Update and broadcast the degraded flag when the value changes.
    pub fn update_degraded(&self, value: bool) {
        self.degraded.send_if_modified(|current| {
            if *current == value {
                return false;
            }
            *current = value;
            true
        });
    }

    /// Runtime configuration.
    pub fn config(&self) -> &Arc<QuizConfig> {
        &self.config
    }

    /// Wall clock used for start times, deadlines and response times.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Current wall-clock time.
    pub fn now(&self) -> SystemTime {
        self.clock.now()
    }

    fn session_gate(&self, code: &SessionCode) -> Arc<Mutex<()>> {
        self.session_gates
            .entry(code.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the gate of `code` once no transition holds or waits on it.
    fn release_session_gate(&self, code: &SessionCode, gate: Arc<Mutex<()>>) {
        drop(gate);
        self.session_gates
            .remove_if(code, |_, gate| Arc::strong_count(gate) == 1);
    }

    /// Run one host transition of the session identified by `code`.
    ///
    /// Transitions of the same session are serialised. The record is re-read under the gate,
    /// the event is planned against it (only from `expected` when the caller names the phase
    /// it observed), `work` runs under the transition timeout, and the planned phase is
    /// written with a compare-and-set. Any failure aborts the plan and leaves the record
    /// untouched.
    pub async fn run_transition<F, Fut, T>(
        &self,
        code: &SessionCode,
        expected: Option<SessionPhase>,
        event: SessionEvent,
        work: F,
    ) -> Result<(T, SessionEntity), ServiceError>
    where
        F: FnOnce(Arc<dyn QuizStore>, Plan) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let gate = self.session_gate(code);
        let result = {
            let _guard = gate.lock().await;
            self.transition_locked(code, expected, event, work).await
        };
        self.release_session_gate(code, gate);
        result
    }

    async fn transition_locked<F, Fut, T>(
        &self,
        code: &SessionCode,
        expected: Option<SessionPhase>,
        event: SessionEvent,
        work: F,
    ) -> Result<(T, SessionEntity), ServiceError>
    where
        F: FnOnce(Arc<dyn QuizStore>, Plan) -> Fut,
        Fut: Future<Output = Result<T, ServiceError>>,
    {
        let store = self.require_store().await?;
        let current = store
            .find_session_by_code(code.clone())
            .await?
            .ok_or_else(|| ServiceError::NotFound("session not found".into()))?;

        let mut machine = SessionStateMachine::from_record(&current, self.config.question_count());
        let plan = match expected {
            Some(phase) => machine.plan_from(phase, event, self.now())?,
            None => machine.plan(event, self.now())?,
        };
        let plan_id = plan.id;

        let work_future = work(store.clone(), plan.clone());
        let outcome = match self.transition_timeout {
            Some(limit) => match timeout(limit, work_future).await {
                Ok(result) => result,
                Err(_) => Err(ServiceError::Timeout),
            },
            None => work_future.await,
        };

        let written = match outcome {
            Ok(value) => match store.update_session(current.id, plan.guard(), plan.patch()).await {
                Ok(Some(updated)) => Ok((value, updated)),
                Ok(None) => Err(ServiceError::InvalidState(
                    "session changed during transition".into(),
                )),
                Err(err) => Err(err.into()),
            },
            Err(err) => Err(err),
        };

        match written {
            Ok((value, updated)) => {
                machine.apply(plan_id)?;
                Ok((value, updated))
            }
            Err(err) => {
                if let Err(abort_err) = machine.abort(plan_id) {
                    warn!(
                        event = ?event,
                        plan_id = %plan_id,
                        error = ?abort_err,
                        "failed to abort transition"
                    );
                }
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::{
        config::QuizConfig,
        dao::{
            models::{SessionCode, SessionEntity, SessionStatus},
            quiz_store::memory::InMemoryQuizStore,
        },
    };

    async fn state_with_session(status: SessionStatus, index: u32) -> (SharedState, SessionCode) {
        let state = AppState::new(QuizConfig::default());
        let store = InMemoryQuizStore::new();
        let mut session = SessionEntity::new(SessionCode::generate(), "host".into(), SystemTime::now());
        session.status = status;
        session.current_question_index = index;
        let code = session.code.clone();
        store.insert_session(session).await.unwrap();
        state.set_store(Arc::new(store)).await;
        (state, code)
    }

    fn active(question_index: u32) -> Option<SessionPhase> {
        Some(SessionPhase {
            status: SessionStatus::Active,
            question_index,
        })
    }

    async fn advance(
        state: &SharedState,
        code: &SessionCode,
        expected: Option<SessionPhase>,
    ) -> Result<SessionEntity, ServiceError> {
        state
            .run_transition(code, expected, SessionEvent::Advance, |_, _| async { Ok(()) })
            .await
            .map(|(_, updated)| updated)
    }

    #[tokio::test]
    async fn repeated_advance_for_the_same_phase_moves_once() {
        let (state, code) = state_with_session(SessionStatus::Active, 0).await;

        let (first, second) = tokio::join!(
            advance(&state, &code, active(0)),
            advance(&state, &code, active(0)),
        );

        let moved: Vec<_> = [first, second].into_iter().filter_map(Result::ok).collect();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].current_question_index, 1);

        let err = advance(&state, &code, active(0)).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        let session = state
            .require_store()
            .await
            .unwrap()
            .find_session_by_code(code)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.current_question_index, 1);
    }

    #[tokio::test]
    async fn unqualified_advance_plans_against_the_current_phase() {
        let (state, code) = state_with_session(SessionStatus::Active, 0).await;

        advance(&state, &code, None).await.unwrap();
        let updated = advance(&state, &code, None).await.unwrap();
        assert_eq!(updated.current_question_index, 2);
    }

    #[tokio::test]
    async fn gates_are_released_after_transitions() {
        let (state, code) = state_with_session(SessionStatus::Active, 0).await;

        advance(&state, &code, active(0)).await.unwrap();
        assert!(advance(&state, &code, active(0)).await.is_err());
        assert!(state.session_gates.is_empty());

        let slow = state.run_transition(&code, active(1), SessionEvent::Advance, |_, _| async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(())
        });
        let (slow, queued) = tokio::join!(slow, advance(&state, &code, active(1)));
        assert!(slow.is_ok());
        assert!(queued.is_err());
        assert!(state.session_gates.is_empty());
    }
}
