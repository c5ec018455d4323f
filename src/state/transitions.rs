use tracing::info;

use crate::{
    dao::models::{SessionCode, SessionEntity},
    error::ServiceError,
    services::scoring::score_question,
    state::{
        SharedState,
        state_machine::{SessionEvent, SessionPhase},
    },
};

/// Execute one host command against a session: authorise, score the question being left,
/// then write the new phase.
///
/// With `expected`, the command only runs while the session is still in that phase, which
/// keeps a deadline observed by several agents from advancing more than once.
pub async fn run_session_transition(
    state: &SharedState,
    code: &SessionCode,
    host_token: &str,
    expected: Option<SessionPhase>,
    event: SessionEvent,
) -> Result<SessionEntity, ServiceError> {
    let store = state.require_store().await?;
    let session = store
        .find_session_by_code(code.clone())
        .await?
        .ok_or_else(|| ServiceError::NotFound("session not found".into()))?;
    if session.host_token != host_token {
        return Err(ServiceError::Unauthorized("invalid host token".into()));
    }

    let session_id = session.id;
    let (_, updated) = state
        .run_transition(code, expected, event, |store, plan| async move {
            match plan.score_question {
                Some(question_index) => score_question(&store, session_id, question_index)
                    .await
                    .map(|_| ()),
                None => Ok(()),
            }
        })
        .await?;

    info!(
        code = %updated.code,
        event = ?event,
        status = %updated.status,
        question_index = updated.current_question_index,
        "session transitioned"
    );

    Ok(updated)
}
