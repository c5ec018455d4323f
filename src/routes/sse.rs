use std::convert::Infallible;

use axum::{
    Router,
    extract::{Path, Query, State},
    response::sse::{Event, Sse},
    routing::get,
};
use futures::Stream;

use crate::{
    error::AppError,
    routes::session::parse_code,
    services::sse_service::{self, StreamQuery},
    state::SharedState,
};

#[utoipa::path(
    get,
    path = "/sessions/{code}/events",
    tag = "sse",
    params(
        ("code" = String, Path, description = "Six-character session code"),
        StreamQuery
    ),
    responses(
        (status = 200, description = "Live session stream", content_type = "text/event-stream", body = String),
        (status = 401, description = "Invalid host token"),
        (status = 404, description = "Unknown session or participant")
    )
)]
/// Stream the live session: record, roster, answers, countdown and connection quality.
///
/// Passing `participant_id` auto-submits a timeout when that participant runs out of time;
/// passing `host_token` lets the stream advance the session on deadlines when enabled.
pub async fn session_stream(
    State(state): State<SharedState>,
    Path(code): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, AppError> {
    let code = parse_code(&code)?;
    let stream = sse_service::open_session_stream(state, code, query).await?;
    Ok(stream)
}

/// Configure the SSE endpoints.
pub fn router() -> Router<SharedState> {
    Router::<SharedState>::new().route("/sessions/{code}/events", get(session_stream))
}
