use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
};
use axum_valid::Valid;

use crate::{
    dao::models::SessionCode,
    dto::session::{
        CreateSessionResponse, JoinSessionRequest, JoinSessionResponse, ParticipantSummary,
        SessionSummary, SubmissionStatus, SubmitAnswerRequest, SubmitAnswerResponse,
    },
    error::AppError,
    services::session_service::{self, SubmitOutcome},
    state::SharedState,
};

/// Participant-facing session endpoints.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/sessions", post(create_session))
        .route("/sessions/{code}", get(get_session))
        .route(
            "/sessions/{code}/participants",
            get(list_participants).post(join_session),
        )
        .route("/sessions/{code}/answers", post(submit_answer))
}

/// Parse a session code path segment into its normalised form.
pub(crate) fn parse_code(raw: &str) -> Result<SessionCode, AppError> {
    SessionCode::parse(raw).map_err(|err| AppError::BadRequest(err.to_string()))
}

/// Create a session in the lobby and hand out its host token.
#[utoipa::path(
    post,
    path = "/sessions",
    tag = "sessions",
    responses(
        (status = 201, description = "Session created", body = CreateSessionResponse),
        (status = 503, description = "Storage unavailable")
    )
)]
pub async fn create_session(
    State(state): State<SharedState>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), AppError> {
    let created = session_service::create_session(&state).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Public view of a session.
#[utoipa::path(
    get,
    path = "/sessions/{code}",
    tag = "sessions",
    params(("code" = String, Path, description = "Six-character session code")),
    responses(
        (status = 200, description = "Session found", body = SessionSummary),
        (status = 404, description = "Unknown session")
    )
)]
pub async fn get_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<SessionSummary>, AppError> {
    let code = parse_code(&code)?;
    let summary = session_service::get_session(&state, &code).await?;
    Ok(Json(summary))
}

/// Join a session under a display name.
#[utoipa::path(
    post,
    path = "/sessions/{code}/participants",
    tag = "sessions",
    params(("code" = String, Path, description = "Six-character session code")),
    request_body = JoinSessionRequest,
    responses(
        (status = 201, description = "Participant registered", body = JoinSessionResponse),
        (status = 409, description = "Name already taken or session finished")
    )
)]
pub async fn join_session(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Valid(Json(payload)): Valid<Json<JoinSessionRequest>>,
) -> Result<(StatusCode, Json<JoinSessionResponse>), AppError> {
    let code = parse_code(&code)?;
    let joined = session_service::join_session(&state, &code, payload).await?;
    Ok((StatusCode::CREATED, Json(joined)))
}

/// Roster of a session ranked by score.
#[utoipa::path(
    get,
    path = "/sessions/{code}/participants",
    tag = "sessions",
    params(("code" = String, Path, description = "Six-character session code")),
    responses((status = 200, description = "Ranked participants", body = [ParticipantSummary]))
)]
pub async fn list_participants(
    State(state): State<SharedState>,
    Path(code): Path<String>,
) -> Result<Json<Vec<ParticipantSummary>>, AppError> {
    let code = parse_code(&code)?;
    let roster = session_service::list_participants(&state, &code).await?;
    Ok(Json(roster))
}

/// Answer the running question. Resubmissions return the first stored answer.
#[utoipa::path(
    post,
    path = "/sessions/{code}/answers",
    tag = "sessions",
    params(("code" = String, Path, description = "Six-character session code")),
    request_body = SubmitAnswerRequest,
    responses(
        (status = 201, description = "Answer recorded", body = SubmitAnswerResponse),
        (status = 200, description = "An answer was already recorded", body = SubmitAnswerResponse),
        (status = 409, description = "Question not open for answers")
    )
)]
pub async fn submit_answer(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Valid(Json(payload)): Valid<Json<SubmitAnswerRequest>>,
) -> Result<(StatusCode, Json<SubmitAnswerResponse>), AppError> {
    let code = parse_code(&code)?;
    let outcome = session_service::submit_answer(&state, &code, payload).await?;
    let (status, submission) = match &outcome {
        SubmitOutcome::Recorded(_) => (StatusCode::CREATED, SubmissionStatus::Recorded),
        SubmitOutcome::AlreadyRecorded(_) => (StatusCode::OK, SubmissionStatus::AlreadyRecorded),
    };
    Ok((
        status,
        Json(SubmitAnswerResponse {
            status: submission,
            answer: outcome.answer().into(),
        }),
    ))
}
