use serde::Serialize;
use utoipa::ToSchema;

use crate::{
    dto::session::QuestionSummary,
    sync::{ConnectionQuality, SourceMode},
};

#[derive(Clone, Debug)]
/// Dispatched payload carried across SSE channels.
pub struct ServerEvent {
    pub event: Option<String>,
    pub data: String,
}

impl ServerEvent {
    /// Convenience wrapper that serialises `payload` into the SSE data field.
    pub fn json<E, T>(event: E, payload: &T) -> serde_json::Result<Self>
    where
        E: Into<Option<String>>,
        T: Serialize,
    {
        Ok(Self {
            event: event.into(),
            data: serde_json::to_string(payload)?,
        })
    }
}

#[derive(Debug, Serialize, ToSchema)]
/// Sent when a client connects, and for lifecycle notices afterwards.
pub struct InfoEvent {
    /// Human-readable notice.
    pub message: String,
    /// Whether the backend is running without a healthy storage backend.
    pub degraded: bool,
    /// Role attached to this stream (`observer`, `participant` or `host`).
    pub role: String,
}

#[derive(Debug, Serialize, ToSchema)]
/// Countdown of the running question, emitted when the displayed second changes.
pub struct TimerEvent {
    pub question_index: u32,
    pub remaining_ms: u64,
    pub time_limit_ms: u64,
}

#[derive(Debug, Serialize, ToSchema)]
/// Emitted once when a new question becomes active.
pub struct QuestionStartedEvent {
    pub question_index: u32,
    /// RFC 3339 shared start instant.
    pub started_at: Option<String>,
    pub question: Option<QuestionSummary>,
}

#[derive(Debug, Serialize, ToSchema)]
/// Freshness of the live view, emitted when it changes.
pub struct QualityEvent {
    /// Worst quality across the tracked topics.
    pub quality: ConnectionQuality,
    /// Whether any topic is served by polling only.
    pub degraded: bool,
    pub session: SourceMode,
    pub participants: Option<SourceMode>,
    pub answers: Option<SourceMode>,
}
