use axum::{
    Json, Router,
    extract::{Path, State},
    http::HeaderMap,
    routing::post,
};

use crate::{
    dto::session::SessionSummary,
    error::AppError,
    routes::session::parse_code,
    services::host_service,
    state::SharedState,
};

const HOST_TOKEN_HEADER: &str = "x-host-token";

/// Host commands. Every call must carry the session's host token in `X-Host-Token`.
pub fn router() -> Router<SharedState> {
    Router::new()
        .route("/sessions/{code}/start", post(start_quiz))
        .route("/sessions/{code}/advance", post(advance_question))
        .route("/sessions/{code}/reveal", post(reveal_rankings))
}

fn host_token(headers: &HeaderMap) -> Result<&str, AppError> {
    headers
        .get(HOST_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| AppError::Unauthorized("missing host token header `X-Host-Token`".into()))
}

/// Leave the lobby and open the first question.
#[utoipa::path(
    post,
    path = "/sessions/{code}/start",
    tag = "host",
    params(
        ("code" = String, Path, description = "Six-character session code"),
        ("X-Host-Token" = String, Header, description = "Host token returned at session creation")
    ),
    responses(
        (status = 200, description = "Quiz started", body = SessionSummary),
        (status = 401, description = "Missing or invalid host token"),
        (status = 409, description = "Session cannot start")
    )
)]
pub async fn start_quiz(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionSummary>, AppError> {
    let code = parse_code(&code)?;
    let summary = host_service::start_quiz(&state, &code, host_token(&headers)?).await?;
    Ok(Json(summary))
}

/// Score the current question, then open the next one or finish.
#[utoipa::path(
    post,
    path = "/sessions/{code}/advance",
    tag = "host",
    params(
        ("code" = String, Path, description = "Six-character session code"),
        ("X-Host-Token" = String, Header, description = "Host token returned at session creation")
    ),
    responses(
        (status = 200, description = "Session advanced", body = SessionSummary),
        (status = 401, description = "Missing or invalid host token"),
        (status = 409, description = "Nothing to advance")
    )
)]
pub async fn advance_question(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionSummary>, AppError> {
    let code = parse_code(&code)?;
    let summary = host_service::advance_question(&state, &code, host_token(&headers)?).await?;
    Ok(Json(summary))
}

/// Score the current question and show the rankings.
#[utoipa::path(
    post,
    path = "/sessions/{code}/reveal",
    tag = "host",
    params(
        ("code" = String, Path, description = "Six-character session code"),
        ("X-Host-Token" = String, Header, description = "Host token returned at session creation")
    ),
    responses(
        (status = 200, description = "Rankings shown", body = SessionSummary),
        (status = 401, description = "Missing or invalid host token"),
        (status = 409, description = "No question is running")
    )
)]
pub async fn reveal_rankings(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    headers: HeaderMap,
) -> Result<Json<SessionSummary>, AppError> {
    let code = parse_code(&code)?;
    let summary = host_service::reveal_rankings(&state, &code, host_token(&headers)?).await?;
    Ok(Json(summary))
}
