use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    dao::models::{
        AnswerEntity, AnswerKey, AnswerValue, ParticipantEntity, SessionCode, SessionEntity,
        SessionStatus,
    },
    dto::session::{
        CreateSessionResponse, JoinSessionRequest, JoinSessionResponse, ParticipantSummary,
        SessionSummary, SubmitAnswerRequest,
    },
    error::ServiceError,
    state::{SharedState, timer},
};

const MAX_CODE_ATTEMPTS: usize = 5;

/// Outcome of a submission: the store keeps the first answer per participant and question.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// The answer row was created by this call.
    Recorded(AnswerEntity),
    /// An answer already existed; it is returned untouched.
    AlreadyRecorded(AnswerEntity),
}

impl SubmitOutcome {
    /// The stored answer.
    pub fn answer(&self) -> &AnswerEntity {
        match self {
            SubmitOutcome::Recorded(answer) | SubmitOutcome::AlreadyRecorded(answer) => answer,
        }
    }
}

/// Create a session in the lobby, drawing a fresh join code.
pub async fn create_session(state: &SharedState) -> Result<CreateSessionResponse, ServiceError> {
    let store = state.require_store().await?;
    let host_token = Uuid::new_v4().simple().to_string();

    for attempt in 1..=MAX_CODE_ATTEMPTS {
        let session = SessionEntity::new(SessionCode::generate(), host_token.clone(), state.now());
        match store.insert_session(session).await {
            Ok(created) => {
                info!(code = %created.code, session_id = %created.id, "session created");
                return Ok(CreateSessionResponse {
                    session_id: created.id,
                    code: created.code,
                    host_token,
                });
            }
            Err(err) if err.is_conflict() => {
                debug!(attempt, "session code collision; drawing another");
            }
            Err(err) => return Err(err.into()),
        }
    }

    warn!(attempts = MAX_CODE_ATTEMPTS, "could not allocate a unique session code");
    Err(ServiceError::Conflict(
        "could not allocate a unique session code".into(),
    ))
}

/// Resolve a session by code.
pub async fn find_session(state: &SharedState, code: &SessionCode) -> Result<SessionEntity, ServiceError> {
    let store = state.require_store().await?;
    store
        .find_session_by_code(code.clone())
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("session `{code}` not found")))
}

/// Public view of a session.
pub async fn get_session(state: &SharedState, code: &SessionCode) -> Result<SessionSummary, ServiceError> {
    let session = find_session(state, code).await?;
    Ok(SessionSummary::new(&session, state.config()))
}

/// Register a participant. Names are trimmed and must be unique within the session.
pub async fn join_session(
    state: &SharedState,
    code: &SessionCode,
    request: JoinSessionRequest,
) -> Result<JoinSessionResponse, ServiceError> {
    let name = request.name.trim().to_owned();
    if name.is_empty() {
        return Err(ServiceError::InvalidInput("name must not be blank".into()));
    }

    let session = find_session(state, code).await?;
    if session.status == SessionStatus::Finished {
        return Err(ServiceError::InvalidState("session has finished".into()));
    }

    let store = state.require_store().await?;
    if store
        .find_participant_by_name(session.id, name.clone())
        .await?
        .is_some()
    {
        return Err(ServiceError::Conflict(format!("name `{name}` is already taken")));
    }

    let participant = store
        .insert_participant(ParticipantEntity::new(session.id, name, state.now()))
        .await?;
    info!(code = %code, participant_id = %participant.id, name = %participant.name, "participant joined");

    Ok(JoinSessionResponse {
        participant_id: participant.id,
        participant: ParticipantSummary::from(&participant),
    })
}

/// Roster ranked by total score.
pub async fn list_participants(
    state: &SharedState,
    code: &SessionCode,
) -> Result<Vec<ParticipantSummary>, ServiceError> {
    let session = find_session(state, code).await?;
    let store = state.require_store().await?;
    let participants = store.list_participants(session.id).await?;
    Ok(participants.iter().map(ParticipantSummary::from).collect())
}

/// Record an answer for the running question.
///
/// A second submission for the same participant and question is not an error: the first
/// stored answer wins and is returned as [`SubmitOutcome::AlreadyRecorded`].
pub async fn submit_answer(
    state: &SharedState,
    code: &SessionCode,
    request: SubmitAnswerRequest,
) -> Result<SubmitOutcome, ServiceError> {
    let session = find_session(state, code).await?;
    record_answer(
        state,
        &session,
        request.participant_id,
        request.question_index,
        AnswerValue::from_option(request.option),
    )
    .await
}

/// Validate and store one answer against an already resolved session.
pub async fn record_answer(
    state: &SharedState,
    session: &SessionEntity,
    participant_id: Uuid,
    question_index: u32,
    value: AnswerValue,
) -> Result<SubmitOutcome, ServiceError> {
    let store = state.require_store().await?;

    let participant = store
        .find_participant(participant_id)
        .await?
        .filter(|participant| participant.session_id == session.id)
        .ok_or_else(|| ServiceError::NotFound(format!("participant `{participant_id}` not found")))?;

    let key = AnswerKey {
        session_id: session.id,
        participant_id: participant.id,
        question_index,
    };
    if let Some(existing) = store.find_answer(key).await? {
        return Ok(SubmitOutcome::AlreadyRecorded(existing));
    }

    if session.status != SessionStatus::Active || session.current_question_index != question_index {
        return Err(ServiceError::InvalidState(format!(
            "question {question_index} is not accepting answers"
        )));
    }
    let question = state.config().question(question_index).ok_or_else(|| {
        ServiceError::InvalidState(format!("question {question_index} does not exist"))
    })?;

    let now = state.now();
    let started_at = session.question_start_time.unwrap_or(now);
    let is_correct = match value {
        AnswerValue::Choice(option) if option >= question.option_count() => {
            return Err(ServiceError::InvalidInput(format!(
                "option {option} is out of range for question {question_index}"
            )));
        }
        AnswerValue::Choice(_)
            if timer::remaining(question.time_limit(), started_at, now).is_zero() =>
        {
            return Err(ServiceError::InvalidState("time is up for this question".into()));
        }
        AnswerValue::Choice(option) => option == question.correct_option,
        AnswerValue::Timeout => false,
    };

    let answer = AnswerEntity {
        id: Uuid::new_v4(),
        session_id: session.id,
        participant_id: participant.id,
        question_index,
        value,
        is_correct,
        response_time_ms: timer::elapsed_ms(started_at, now),
        points_awarded: 0,
        submitted_at: now,
    };

    match store.insert_answer(answer).await {
        Ok(stored) => {
            debug!(
                code = %session.code,
                participant_id = %participant.id,
                question_index,
                value = %stored.value,
                "answer recorded"
            );
            Ok(SubmitOutcome::Recorded(stored))
        }
        Err(err) if err.is_conflict() => {
            debug!(participant_id = %participant.id, question_index, "answer raced; keeping the first");
            store
                .find_answer(key)
                .await?
                .map(SubmitOutcome::AlreadyRecorded)
                .ok_or_else(|| err.into())
        }
        Err(err) => Err(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use super::*;
    use crate::{
        clock::TokioClock,
        config::QuizConfig,
        dao::quiz_store::{QuizStore, memory::InMemoryQuizStore},
        state::{AppState, SessionEvent, transitions::run_session_transition},
    };

    async fn ready_state() -> (SharedState, InMemoryQuizStore) {
        let memory = InMemoryQuizStore::new();
        let state = AppState::with_clock(QuizConfig::default(), Arc::new(TokioClock::new()));
        state.set_store(Arc::new(memory.clone()) as Arc<dyn QuizStore>).await;
        (state, memory)
    }

    async fn started(state: &SharedState) -> (SessionCode, Uuid) {
        let created = create_session(state).await.unwrap();
        let joined = join_session(state, &created.code, JoinSessionRequest { name: "Ada".into() })
            .await
            .unwrap();
        run_session_transition(state, &created.code, &created.host_token, None, SessionEvent::Start)
            .await
            .unwrap();
        (created.code, joined.participant_id)
    }

    fn answer(participant_id: Uuid, option: Option<u32>) -> SubmitAnswerRequest {
        SubmitAnswerRequest {
            participant_id,
            question_index: 0,
            option,
        }
    }

    #[tokio::test]
    async fn join_rejects_duplicate_trimmed_names() {
        let (state, _) = ready_state().await;
        let created = create_session(&state).await.unwrap();

        join_session(&state, &created.code, JoinSessionRequest { name: "Ada".into() })
            .await
            .unwrap();
        let err = join_session(&state, &created.code, JoinSessionRequest { name: "  Ada ".into() })
            .await
            .unwrap_err();

        assert!(matches!(err, ServiceError::Conflict(_)));
        assert_eq!(list_participants(&state, &created.code).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn unknown_code_is_not_found() {
        let (state, _) = ready_state().await;
        let code = SessionCode::parse("ZZZZZZ").unwrap();
        assert!(matches!(
            get_session(&state, &code).await,
            Err(ServiceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn degraded_state_refuses_user_actions() {
        let state = AppState::new(QuizConfig::default());
        assert!(matches!(create_session(&state).await, Err(ServiceError::Degraded)));
    }

    #[tokio::test(start_paused = true)]
    async fn second_submission_is_a_no_op() {
        let (state, memory) = ready_state().await;
        let (code, participant_id) = started(&state).await;

        tokio::time::advance(Duration::from_millis(1_200)).await;
        let first = submit_answer(&state, &code, answer(participant_id, Some(2))).await.unwrap();
        let second = submit_answer(&state, &code, answer(participant_id, None)).await.unwrap();

        let SubmitOutcome::Recorded(stored) = first else {
            panic!("first submission should be recorded");
        };
        assert!(stored.is_correct);
        assert!(stored.response_time_ms >= 1_200);
        assert_eq!(second, SubmitOutcome::AlreadyRecorded(stored.clone()));

        let session = find_session(&state, &code).await.unwrap();
        assert_eq!(memory.all_answers(session.id).await, vec![stored]);
    }

    #[tokio::test(start_paused = true)]
    async fn choices_after_the_deadline_are_refused_but_timeouts_are_kept() {
        let (state, _) = ready_state().await;
        let (code, participant_id) = started(&state).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(
            submit_answer(&state, &code, answer(participant_id, Some(2))).await,
            Err(ServiceError::InvalidState(_))
        ));

        let outcome = submit_answer(&state, &code, answer(participant_id, None)).await.unwrap();
        assert!(outcome.answer().value.is_timeout());
        assert!(!outcome.answer().is_correct);
    }

    #[tokio::test]
    async fn out_of_range_option_is_invalid_input() {
        let (state, _) = ready_state().await;
        let (code, participant_id) = started(&state).await;

        assert!(matches!(
            submit_answer(&state, &code, answer(participant_id, Some(4))).await,
            Err(ServiceError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn answers_for_other_questions_are_refused() {
        let (state, _) = ready_state().await;
        let (code, participant_id) = started(&state).await;

        let mut request = answer(participant_id, Some(1));
        request.question_index = 1;
        assert!(matches!(
            submit_answer(&state, &code, request).await,
            Err(ServiceError::InvalidState(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn racing_manual_and_timeout_submissions_store_one_answer() {
        let (state, memory) = ready_state().await;
        let (code, participant_id) = started(&state).await;
        let session = find_session(&state, &code).await.unwrap();

        // Both lookups miss, so both submissions reach the insert.
        memory.set_stale_answer_reads(2);
        tokio::time::advance(Duration::from_millis(29_950)).await;
        let (manual, timeout) = tokio::join!(
            submit_answer(&state, &code, answer(participant_id, Some(2))),
            record_answer(&state, &session, participant_id, 0, AnswerValue::Timeout),
        );
        let (manual, timeout) = (manual.unwrap(), timeout.unwrap());

        let recorded = [&manual, &timeout]
            .into_iter()
            .filter(|outcome| matches!(outcome, SubmitOutcome::Recorded(_)))
            .count();
        assert_eq!(recorded, 1);
        assert_eq!(manual.answer(), timeout.answer());

        let stored = memory.all_answers(session.id).await;
        assert_eq!(stored.len(), 1);
        assert_eq!(&stored[0], manual.answer());
    }
}
