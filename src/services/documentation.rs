use utoipa::OpenApi;

#[derive(OpenApi)]
/// Aggregated OpenAPI specification for the live quiz backend.
#[openapi(
    paths(
        crate::routes::health::healthcheck,
        crate::routes::session::create_session,
        crate::routes::session::get_session,
        crate::routes::session::join_session,
        crate::routes::session::list_participants,
        crate::routes::session::submit_answer,
        crate::routes::host::start_quiz,
        crate::routes::host::advance_question,
        crate::routes::host::reveal_rankings,
        crate::routes::sse::session_stream,
    ),
    components(
        schemas(
            crate::dto::health::HealthResponse,
            crate::dto::session::CreateSessionResponse,
            crate::dto::session::SessionSummary,
            crate::dto::session::QuestionSummary,
            crate::dto::session::JoinSessionRequest,
            crate::dto::session::JoinSessionResponse,
            crate::dto::session::ParticipantSummary,
            crate::dto::session::SubmitAnswerRequest,
            crate::dto::session::SubmitAnswerResponse,
            crate::dto::session::AnswerSummary,
            crate::dto::session::SubmissionStatus,
            crate::dto::sse::InfoEvent,
            crate::dto::sse::TimerEvent,
            crate::dto::sse::QuestionStartedEvent,
            crate::dto::sse::QualityEvent,
            crate::dao::models::SessionCode,
            crate::dao::models::SessionStatus,
            crate::sync::ConnectionQuality,
            crate::sync::SourceMode,
        )
    ),
    tags(
        (name = "health", description = "Health check endpoints"),
        (name = "sessions", description = "Session lifecycle for participants"),
        (name = "host", description = "Host commands, authorised by the session host token"),
        (name = "sse", description = "Server-sent events streams"),
    )
)]
pub struct ApiDoc;
