use crate::{
    dao::models::SessionCode,
    dto::session::SessionSummary,
    error::ServiceError,
    state::{SessionEvent, SharedState, transitions::run_session_transition},
};

async fn transition(
    state: &SharedState,
    code: &SessionCode,
    host_token: &str,
    event: SessionEvent,
) -> Result<SessionSummary, ServiceError> {
    let updated = run_session_transition(state, code, host_token, None, event).await?;
    Ok(SessionSummary::new(&updated, state.config()))
}

/// Leave the lobby and open the first question.
pub async fn start_quiz(
    state: &SharedState,
    code: &SessionCode,
    host_token: &str,
) -> Result<SessionSummary, ServiceError> {
    transition(state, code, host_token, SessionEvent::Start).await
}

/// Score the current question, then open the next one or finish the session.
pub async fn advance_question(
    state: &SharedState,
    code: &SessionCode,
    host_token: &str,
) -> Result<SessionSummary, ServiceError> {
    transition(state, code, host_token, SessionEvent::Advance).await
}

/// Score the current question and show the rankings.
pub async fn reveal_rankings(
    state: &SharedState,
    code: &SessionCode,
    host_token: &str,
) -> Result<SessionSummary, ServiceError> {
    transition(state, code, host_token, SessionEvent::RevealRankings).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        config::QuizConfig,
        dao::{
            models::SessionStatus,
            quiz_store::{QuizStore, memory::InMemoryQuizStore},
        },
        dto::session::JoinSessionRequest,
        services::session_service,
        state::AppState,
    };

    async fn ready_state() -> SharedState {
        let state = AppState::new(QuizConfig::default());
        state
            .set_store(Arc::new(InMemoryQuizStore::new()) as Arc<dyn QuizStore>)
            .await;
        state
    }

    #[tokio::test]
    async fn host_commands_require_the_host_token() {
        let state = ready_state().await;
        let created = session_service::create_session(&state).await.unwrap();

        let err = start_quiz(&state, &created.code, "not-the-token").await.unwrap_err();
        assert!(matches!(err, ServiceError::Unauthorized(_)));

        let summary = start_quiz(&state, &created.code, &created.host_token).await.unwrap();
        assert_eq!(summary.status, SessionStatus::Active);
        assert_eq!(summary.current_question_index, 0);
        assert!(summary.question_start_time.is_some());
    }

    #[tokio::test]
    async fn invalid_commands_leave_the_record_untouched() {
        let state = ready_state().await;
        let created = session_service::create_session(&state).await.unwrap();

        let err = advance_question(&state, &created.code, &created.host_token)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));

        let summary = session_service::get_session(&state, &created.code).await.unwrap();
        assert_eq!(summary.status, SessionStatus::Waiting);
    }

    #[tokio::test]
    async fn full_quiz_runs_to_finished() {
        let state = ready_state().await;
        let created = session_service::create_session(&state).await.unwrap();
        session_service::join_session(&state, &created.code, JoinSessionRequest { name: "Ada".into() })
            .await
            .unwrap();
        let token = created.host_token.as_str();

        start_quiz(&state, &created.code, token).await.unwrap();
        let count = state.config().question_count();
        for index in 0..count {
            let shown = reveal_rankings(&state, &created.code, token).await.unwrap();
            assert_eq!(shown.status, SessionStatus::ShowingResults);
            assert_eq!(shown.current_question_index, index);

            let next = advance_question(&state, &created.code, token).await.unwrap();
            if index + 1 < count {
                assert_eq!(next.status, SessionStatus::Active);
                assert_eq!(next.current_question_index, index + 1);
            } else {
                assert_eq!(next.status, SessionStatus::Finished);
                assert_eq!(next.current_question_index, index);
                assert_eq!(next.question_start_time, shown.question_start_time);
            }
        }

        let err = advance_question(&state, &created.code, token).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState(_)));
    }
}
