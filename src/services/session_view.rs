//! Live view of one session as a client sees it.
//!
//! A view reconciles three topics (the session record, its roster and the answers of the
//! running question), re-derives the countdown locally and fans everything out as
//! [`ViewEvent`]s. The answers topic is replaced whenever a new question opens: the old
//! subscription is closed before the new one is opened.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::{broadcast, watch},
    task::AbortHandle,
    time::{Instant, MissedTickBehavior, interval},
};
use tracing::{debug, info};

use crate::{
    clock::Clock,
    config::QuizConfig,
    dao::{
        models::{AnswerEntity, ParticipantEntity, SessionCode, SessionEntity, SessionStatus},
        quiz_store::QuizStore,
        topic::{Topic, TopicSnapshot},
    },
    state::{
        timer::QuestionTimer,
        tracker::{QuestionChange, QuestionTracker},
    },
    sync::{ConnectionQuality, SourceMode, TopicSubscription, reconciler},
};

const VIEW_CHANNEL_CAPACITY: usize = 64;
const QUALITY_INTERVAL: Duration = Duration::from_secs(1);

/// Countdown sample taken on the local tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerTick {
    /// Question being timed.
    pub question_index: u32,
    /// Time left.
    pub remaining: Duration,
    /// Time granted.
    pub time_limit: Duration,
}

/// Freshness of the view across its topics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QualityReport {
    /// Worst quality across the open topics.
    pub overall: ConnectionQuality,
    /// Whether any open topic is served by polling only.
    pub degraded: bool,
    /// Mode of the session topic.
    pub session: SourceMode,
    /// Mode of the roster topic, once open.
    pub participants: Option<SourceMode>,
    /// Mode of the answers topic, once open.
    pub answers: Option<SourceMode>,
}

/// Output of a [`SessionView`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewEvent {
    /// The session record changed. `None` when the code no longer resolves.
    Session(Option<SessionEntity>),
    /// The ranked roster changed.
    Participants(Vec<ParticipantEntity>),
    /// The answers of the running question changed.
    Answers(Vec<AnswerEntity>),
    /// A new question opened; per-question client state must reset.
    QuestionStarted(QuestionChange),
    /// Local countdown sample while a question is active.
    Timer(TimerTick),
    /// The view quality changed.
    Quality(QualityReport),
}

/// Owner of a running view. Dropping it tears down every subscription it holds.
#[derive(Debug)]
pub struct SessionView {
    code: SessionCode,
    events: broadcast::Sender<ViewEvent>,
    session: watch::Receiver<Option<SessionEntity>>,
    task: AbortHandle,
}

impl SessionView {
    /// Start a view of `code`. The returned receiver observes every event from the start.
    pub fn open(
        store: Arc<dyn QuizStore>,
        code: SessionCode,
        config: Arc<QuizConfig>,
        clock: Arc<dyn Clock>,
    ) -> (Self, broadcast::Receiver<ViewEvent>) {
        let (events, first_receiver) = broadcast::channel(VIEW_CHANNEL_CAPACITY);
        let (session_tx, session) = watch::channel(None);

        let worker = ViewWorker {
            session_topic: reconciler::open(
                store.clone(),
                Topic::Session { code: code.clone() },
                config.sync().reconciler(config.sync().session_poll_ms),
            ),
            store,
            config,
            clock,
            events: events.clone(),
            session: session_tx,
            participants: None,
            answers: None,
            tracker: QuestionTracker::default(),
            timer: None,
            last_quality: None,
        };
        let task = tokio::spawn(worker.run());

        (
            Self {
                code,
                events,
                session,
                task: task.abort_handle(),
            },
            first_receiver,
        )
    }

    /// Code of the viewed session.
    pub fn code(&self) -> &SessionCode {
        &self.code
    }

    /// Additional receiver; it only sees events emitted after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<ViewEvent> {
        self.events.subscribe()
    }

    /// Latest session record seen by the view.
    pub fn session(&self) -> watch::Receiver<Option<SessionEntity>> {
        self.session.clone()
    }

    /// Tear the view down. Idempotent.
    pub fn close(&self) {
        self.task.abort();
    }

    /// Whether the view has been torn down.
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for SessionView {
    fn drop(&mut self) {
        self.close();
    }
}

struct ViewWorker {
    store: Arc<dyn QuizStore>,
    config: Arc<QuizConfig>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<ViewEvent>,
    session: watch::Sender<Option<SessionEntity>>,
    session_topic: TopicSubscription,
    participants: Option<TopicSubscription>,
    answers: Option<TopicSubscription>,
    tracker: QuestionTracker,
    timer: Option<QuestionTimer>,
    last_quality: Option<QualityReport>,
}

/// Wait for the next content of an optional subscription; pending forever when absent.
async fn next_update(
    receiver: &mut Option<watch::Receiver<Option<TopicSnapshot>>>,
) -> Option<TopicSnapshot> {
    match receiver {
        Some(rx) => match rx.changed().await {
            Ok(()) => rx.borrow_and_update().clone(),
            Err(_) => {
                *receiver = None;
                None
            }
        },
        None => std::future::pending().await,
    }
}

impl ViewWorker {
    async fn run(mut self) {
        let mut session_rx = Some(self.session_topic.updates());
        let mut participants_rx = None;
        let mut answers_rx = None;

        let mut tick = interval(self.config.sync().timer_tick_ms);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut quality_tick = interval(QUALITY_INTERVAL);
        quality_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                snapshot = next_update(&mut session_rx) => {
                    if let Some(TopicSnapshot::Session(session)) = snapshot {
                        self.on_session(session, &mut participants_rx, &mut answers_rx);
                    }
                }
                snapshot = next_update(&mut participants_rx) => {
                    if let Some(TopicSnapshot::Participants(participants)) = snapshot {
                        self.emit(ViewEvent::Participants(participants));
                    }
                }
                snapshot = next_update(&mut answers_rx) => {
                    if let Some(TopicSnapshot::Answers(answers)) = snapshot {
                        self.emit(ViewEvent::Answers(answers));
                    }
                }
                _ = tick.tick() => self.on_tick(),
                _ = quality_tick.tick() => self.on_quality_tick(),
            }
        }
    }

    fn emit(&self, event: ViewEvent) {
        // No receivers is fine: the view keeps running until its owner closes it.
        let _ = self.events.send(event);
    }

    fn on_session(
        &mut self,
        session: Option<SessionEntity>,
        participants_rx: &mut Option<watch::Receiver<Option<TopicSnapshot>>>,
        answers_rx: &mut Option<watch::Receiver<Option<TopicSnapshot>>>,
    ) {
        self.session.send_replace(session.clone());
        let Some(record) = session else {
            self.timer = None;
            self.emit(ViewEvent::Session(None));
            return;
        };

        if self.participants.is_none() {
            let subscription = reconciler::open(
                self.store.clone(),
                Topic::Participants {
                    session_id: record.id,
                },
                self.config.sync().reconciler(self.config.sync().participants_poll_ms),
            );
            *participants_rx = Some(subscription.updates());
            self.participants = Some(subscription);
        }

        if let Some(change) = self.tracker.observe(&record) {
            if let Some(previous) = self.answers.take() {
                previous.close();
                debug!(topic = %previous.topic(), "closed superseded answers topic");
            }
            let subscription = reconciler::open(
                self.store.clone(),
                Topic::Answers {
                    session_id: record.id,
                    question_index: change.question_index,
                },
                self.config.sync().reconciler(self.config.sync().answers_poll_ms),
            );
            *answers_rx = Some(subscription.updates());
            self.answers = Some(subscription);
            // An empty list resets the answers view until the new topic reports.
            self.emit(ViewEvent::Answers(Vec::new()));

            info!(
                code = %record.code,
                question_index = change.question_index,
                "question started"
            );
            self.emit(ViewEvent::QuestionStarted(change));
        }

        self.timer = match (record.status, record.question_start_time) {
            (SessionStatus::Active, Some(started_at)) => self
                .config
                .question(record.current_question_index)
                .map(|question| QuestionTimer {
                    question_index: record.current_question_index,
                    started_at,
                    time_limit: question.time_limit(),
                }),
            _ => None,
        };

        self.emit(ViewEvent::Session(Some(record)));
    }

    fn on_tick(&self) {
        let Some(timer) = self.timer else {
            return;
        };
        self.emit(ViewEvent::Timer(TimerTick {
            question_index: timer.question_index,
            remaining: timer.remaining(self.clock.now()),
            time_limit: timer.time_limit,
        }));
    }

    fn on_quality_tick(&mut self) {
        let report = self.quality(Instant::now());
        if self.last_quality == Some(report) {
            return;
        }
        self.last_quality = Some(report);
        self.emit(ViewEvent::Quality(report));
    }

    fn quality(&self, now: Instant) -> QualityReport {
        let session = self.session_topic.current_health();
        let participants = self.participants.as_ref().map(TopicSubscription::current_health);
        let answers = self.answers.as_ref().map(TopicSubscription::current_health);

        let healths = [Some(session), participants, answers];
        let open = healths.iter().flatten();
        let overall = open
            .clone()
            .map(|health| health.quality(now))
            .max()
            .unwrap_or(ConnectionQuality::Good);
        let degraded = open.clone().any(|health| health.is_degraded());

        QualityReport {
            overall,
            degraded,
            session: session.mode,
            participants: participants.map(|health| health.mode),
            answers: answers.map(|health| health.mode),
        }
    }
}
