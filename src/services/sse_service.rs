use std::{convert::Infallible, sync::Arc, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde::Deserialize;
use tokio::sync::{
    broadcast::{self, error::RecvError},
    mpsc,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use utoipa::IntoParams;
use uuid::Uuid;

use crate::{
    config::QuizConfig,
    dao::models::SessionCode,
    dto::{
        format_system_time,
        session::{AnswerSummary, ParticipantSummary, QuestionSummary, SessionSummary},
        sse::{InfoEvent, QualityEvent, QuestionStartedEvent, ServerEvent, TimerEvent},
    },
    error::ServiceError,
    services::{
        agents::{self, AgentHandle, AgentRole},
        session_service,
        session_view::{SessionView, TimerTick, ViewEvent},
    },
    state::SharedState,
};

/// Query string of the session event stream.
#[derive(Debug, Default, Deserialize, IntoParams)]
#[into_params(parameter_in = Query)]
pub struct StreamQuery {
    /// Attach the timeout auto-submit agent for this participant.
    pub participant_id: Option<Uuid>,
    /// Attach the host deadline agent; must match the session's host token.
    pub host_token: Option<String>,
}

/// Open a live view of a session and expose it as an SSE response.
///
/// The view and any attached agent live exactly as long as the client connection.
pub async fn open_session_stream(
    state: SharedState,
    code: SessionCode,
    query: StreamQuery,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ServiceError> {
    let session = session_service::find_session(&state, &code).await?;
    let role = match (query.participant_id, query.host_token) {
        (_, Some(token)) if token != session.host_token => {
            return Err(ServiceError::Unauthorized("invalid host token".into()));
        }
        (_, Some(host_token)) => Some(AgentRole::Host { host_token }),
        (Some(participant_id), None) => {
            let store = state.require_store().await?;
            let known = store
                .find_participant(participant_id)
                .await?
                .is_some_and(|participant| participant.session_id == session.id);
            if !known {
                return Err(ServiceError::NotFound(format!(
                    "participant `{participant_id}` not found"
                )));
            }
            Some(AgentRole::Participant { participant_id })
        }
        (None, None) => None,
    };

    let store = state.require_store().await?;
    let (view, receiver) = SessionView::open(
        store,
        code.clone(),
        state.config().clone(),
        state.clock().clone(),
    );
    let agent = role.clone().map(|role| {
        agents::spawn(
            state.clone(),
            code.clone(),
            role,
            view.subscribe(),
            view.session(),
        )
    });

    let role_label = match role {
        Some(AgentRole::Participant { .. }) => "participant",
        Some(AgentRole::Host { .. }) => "host",
        None => "observer",
    };
    info!(code = %code, role = role_label, "session stream connected");

    Ok(to_sse_stream(state, view, agent, receiver, role_label))
}

/// Forward view events to the client, tearing the view down once it disconnects.
fn to_sse_stream(
    state: SharedState,
    view: SessionView,
    agent: Option<AgentHandle>,
    mut receiver: broadcast::Receiver<ViewEvent>,
    role: &'static str,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    // small bounded channel between forwarder and response
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(16);

    tokio::spawn(async move {
        let mut degraded = state.degraded_watcher();
        let mut encoder = EventEncoder::new(state.config().clone());

        let hello = InfoEvent {
            message: "session stream connected".into(),
            degraded: *degraded.borrow_and_update(),
            role: role.into(),
        };
        if send(&tx, ServerEvent::json(Some("info".to_string()), &hello)).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                _ = tx.closed() => break,
                changed = degraded.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let notice = InfoEvent {
                        message: "storage status changed".into(),
                        degraded: *degraded.borrow_and_update(),
                        role: role.into(),
                    };
                    if send(&tx, ServerEvent::json(Some("info".to_string()), &notice)).await.is_err() {
                        break;
                    }
                }
                recv_result = receiver.recv() => match recv_result {
                    Ok(ViewEvent::Session(None)) => {
                        let notice = InfoEvent {
                            message: "session not found".into(),
                            degraded: state.is_degraded(),
                            role: role.into(),
                        };
                        let _ = send(&tx, ServerEvent::json(Some("info".to_string()), &notice)).await;
                        break;
                    }
                    Ok(event) => {
                        let Some(payload) = encoder.encode(&event) else {
                            continue;
                        };
                        if send(&tx, payload).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => break,
                    Err(RecvError::Lagged(skipped)) => {
                        // Skip lagged messages but keep the stream alive.
                        debug!(code = %view.code(), skipped, "session stream lagged");
                        continue;
                    }
                },
            }
        }

        drop(agent);
        view.close();
        info!(code = %view.code(), role, "session stream disconnected");
    });

    // response stream reads from mpsc; when client disconnects axum drops this stream
    let stream = ReceiverStream::new(rx);
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

async fn send(
    tx: &mpsc::Sender<Result<Event, Infallible>>,
    payload: serde_json::Result<ServerEvent>,
) -> Result<(), ()> {
    let payload = match payload {
        Ok(payload) => payload,
        Err(err) => {
            warn!(error = %err, "failed to serialise SSE payload");
            return Ok(());
        }
    };

    let mut event = Event::default().data(payload.data);
    if let Some(name) = payload.event {
        event = event.event(name);
    }
    tx.send(Ok(event)).await.map_err(|_| ())
}

/// Turns view events into SSE payloads. Countdown samples are only forwarded when the
/// displayed second changes.
struct EventEncoder {
    config: Arc<QuizConfig>,
    last_timer: Option<(u32, u64)>,
}

impl EventEncoder {
    fn new(config: Arc<QuizConfig>) -> Self {
        Self {
            config,
            last_timer: None,
        }
    }

    fn encode(&mut self, event: &ViewEvent) -> Option<serde_json::Result<ServerEvent>> {
        let payload = match event {
            ViewEvent::Session(Some(session)) => ServerEvent::json(
                Some("session".to_string()),
                &SessionSummary::new(session, &self.config),
            ),
            ViewEvent::Session(None) => return None,
            ViewEvent::Participants(participants) => ServerEvent::json(
                Some("participants".to_string()),
                &participants.iter().map(ParticipantSummary::from).collect::<Vec<_>>(),
            ),
            ViewEvent::Answers(answers) => ServerEvent::json(
                Some("answers".to_string()),
                &answers.iter().map(AnswerSummary::from).collect::<Vec<_>>(),
            ),
            ViewEvent::QuestionStarted(change) => ServerEvent::json(
                Some("question_started".to_string()),
                &QuestionStartedEvent {
                    question_index: change.question_index,
                    started_at: change.started_at.map(format_system_time),
                    question: self
                        .config
                        .question(change.question_index)
                        .map(|question| QuestionSummary::new(change.question_index, question)),
                },
            ),
            ViewEvent::Timer(tick) => return self.encode_timer(tick),
            ViewEvent::Quality(report) => ServerEvent::json(
                Some("quality".to_string()),
                &QualityEvent {
                    quality: report.overall,
                    degraded: report.degraded,
                    session: report.session,
                    participants: report.participants,
                    answers: report.answers,
                },
            ),
        };
        Some(payload)
    }

    fn encode_timer(&mut self, tick: &TimerTick) -> Option<serde_json::Result<ServerEvent>> {
        let shown_seconds = tick.remaining.as_millis().div_ceil(1_000);
        let shown = (tick.question_index, u64::try_from(shown_seconds).unwrap_or(u64::MAX));
        if self.last_timer == Some(shown) {
            return None;
        }
        self.last_timer = Some(shown);

        Some(ServerEvent::json(
            Some("timer".to_string()),
            &TimerEvent {
                question_index: tick.question_index,
                remaining_ms: u64::try_from(tick.remaining.as_millis()).unwrap_or(u64::MAX),
                time_limit_ms: u64::try_from(tick.time_limit.as_millis()).unwrap_or(u64::MAX),
            },
        ))
    }
}
