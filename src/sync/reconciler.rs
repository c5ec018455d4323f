//! Arbitration between the push feed and the poller of one topic.
//!
//! The reconciler task owns a [`SourceMode`] that only changes through the pure transition
//! functions below. While the feed is live, poll results are discarded; when the feed does
//! not come up within the grace period (or drops later), poll results become authoritative.
//! Every applied read stamps the topic's last-update instant, which drives the
//! [`ConnectionQuality`] classification.

use std::{fmt, sync::Arc, time::Duration};

use serde::Serialize;
use tokio::{
    sync::{mpsc, watch},
    task::AbortHandle,
    time::{Instant, sleep},
};
use tracing::{debug, info, warn};
use utoipa::ToSchema;

use super::{
    change_feed::{self, FeedMessage, FeedRetryPolicy, FeedStatus},
    poller::{self, PollUpdate},
};
use crate::dao::{
    quiz_store::QuizStore,
    topic::{Record, Topic, TopicShape, TopicSnapshot, fetch_topic},
};

/// Which channel is authoritative for a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Feed not confirmed yet; poll results are applied meanwhile.
    Connecting,
    /// Feed confirmed; poll results are discarded.
    Live,
    /// Feed unavailable; poll results are authoritative.
    Fallback,
}

/// Origin of an update offered to the reconciler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    /// Change feed.
    Push,
    /// Snapshot poller.
    Poll,
}

impl SourceMode {
    /// React to a status reported by the change feed.
    pub fn on_feed_status(self, status: FeedStatus) -> Self {
        match (self, status) {
            (_, FeedStatus::Live) => SourceMode::Live,
            (SourceMode::Live, FeedStatus::Degraded | FeedStatus::Failed) => SourceMode::Fallback,
            (SourceMode::Connecting, FeedStatus::Failed) => SourceMode::Fallback,
            (mode, _) => mode,
        }
    }

    /// A delivered event proves the feed works.
    pub fn on_push_event(self) -> Self {
        SourceMode::Live
    }

    /// The feed did not confirm within the grace period.
    pub fn on_grace_elapsed(self) -> Self {
        match self {
            SourceMode::Connecting => SourceMode::Fallback,
            other => other,
        }
    }

    /// Whether an update from `source` is applied in this mode.
    pub fn accepts(self, source: UpdateSource) -> bool {
        match source {
            UpdateSource::Push => true,
            UpdateSource::Poll => self != SourceMode::Live,
        }
    }

    /// Whether the topic is currently served by polling only.
    pub fn is_degraded(self) -> bool {
        self == SourceMode::Fallback
    }
}

impl fmt::Display for SourceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            SourceMode::Connecting => "connecting",
            SourceMode::Live => "live",
            SourceMode::Fallback => "fallback",
        };
        f.write_str(label)
    }
}

/// Freshness class shown to users. Ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionQuality {
    /// Push, updated less than 2 s ago.
    Excellent,
    /// Push under 5 s, or poll under 3 s.
    Good,
    /// Push at 5 s or more, or poll under 10 s.
    Poor,
    /// Poll at 10 s or more.
    Offline,
}

impl ConnectionQuality {
    const PUSH_EXCELLENT: Duration = Duration::from_secs(2);
    const PUSH_GOOD: Duration = Duration::from_secs(5);
    const POLL_GOOD: Duration = Duration::from_secs(3);
    const POLL_POOR: Duration = Duration::from_secs(10);

    /// Classify freshness. With no update yet, a live or connecting topic counts as
    /// good and a topic in fallback as offline.
    pub fn classify(mode: SourceMode, since_last_update: Option<Duration>) -> Self {
        let Some(age) = since_last_update else {
            return match mode {
                SourceMode::Fallback => ConnectionQuality::Offline,
                SourceMode::Connecting | SourceMode::Live => ConnectionQuality::Good,
            };
        };

        match mode {
            SourceMode::Live if age < Self::PUSH_EXCELLENT => ConnectionQuality::Excellent,
            SourceMode::Live if age < Self::PUSH_GOOD => ConnectionQuality::Good,
            SourceMode::Live => ConnectionQuality::Poor,
            _ if age < Self::POLL_GOOD => ConnectionQuality::Good,
            _ if age < Self::POLL_POOR => ConnectionQuality::Poor,
            _ => ConnectionQuality::Offline,
        }
    }
}

/// Observable health of one topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TopicHealth {
    /// Authoritative channel.
    pub mode: SourceMode,
    /// Instant of the last applied read, changed or not.
    pub last_update: Option<Instant>,
}

impl TopicHealth {
    fn new() -> Self {
        Self {
            mode: SourceMode::Connecting,
            last_update: None,
        }
    }

    /// Quality of the topic as of `now`.
    pub fn quality(&self, now: Instant) -> ConnectionQuality {
        let age = self
            .last_update
            .map(|stamp| now.saturating_duration_since(stamp));
        ConnectionQuality::classify(self.mode, age)
    }

    /// Whether the topic is served by polling only.
    pub fn is_degraded(&self) -> bool {
        self.mode.is_degraded()
    }
}

/// Timings of one reconciled topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSettings {
    /// Time the feed gets to go live before polling takes over.
    pub grace_period: Duration,
    /// Poll interval for this topic.
    pub poll_interval: Duration,
    /// Feed resubscription backoff.
    pub retry: FeedRetryPolicy,
}

/// Handle over a reconciled topic: the latest content and its health.
///
/// Closing is idempotent and also happens on drop; it stops the feed and the poller.
#[derive(Debug)]
pub struct TopicSubscription {
    topic: Topic,
    updates: watch::Receiver<Option<TopicSnapshot>>,
    health: watch::Receiver<TopicHealth>,
    task: AbortHandle,
}

impl TopicSubscription {
    /// Topic this subscription tracks.
    pub fn topic(&self) -> &Topic {
        &self.topic
    }

    /// Receiver notified once per distinct content. `None` until the first read.
    pub fn updates(&self) -> watch::Receiver<Option<TopicSnapshot>> {
        self.updates.clone()
    }

    /// Receiver over the topic health.
    pub fn health(&self) -> watch::Receiver<TopicHealth> {
        self.health.clone()
    }

    /// Latest known content.
    pub fn current(&self) -> Option<TopicSnapshot> {
        self.updates.borrow().clone()
    }

    /// Current health.
    pub fn current_health(&self) -> TopicHealth {
        *self.health.borrow()
    }

    /// Tear down the feed and the poller.
    pub fn close(&self) {
        self.task.abort();
    }

    /// Whether the subscription has been torn down.
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for TopicSubscription {
    fn drop(&mut self) {
        self.close();
    }
}

/// Start reconciling `topic`: the feed and the poller open immediately.
pub fn open(store: Arc<dyn QuizStore>, topic: Topic, settings: ReconcilerSettings) -> TopicSubscription {
    let (updates_tx, updates) = watch::channel(None);
    let (health_tx, health) = watch::channel(TopicHealth::new());

    let task = tokio::spawn(
        Reconciler {
            store,
            topic: topic.clone(),
            mode: SourceMode::Connecting,
            updates: updates_tx,
            health: health_tx,
        }
        .run(settings),
    );

    TopicSubscription {
        topic,
        updates,
        health,
        task: task.abort_handle(),
    }
}

struct Reconciler {
    store: Arc<dyn QuizStore>,
    topic: Topic,
    mode: SourceMode,
    updates: watch::Sender<Option<TopicSnapshot>>,
    health: watch::Sender<TopicHealth>,
}

impl Reconciler {
    async fn run(mut self, settings: ReconcilerSettings) {
        let (feed_tx, mut feed_rx) = mpsc::unbounded_channel();
        let (poll_tx, mut poll_rx) = mpsc::unbounded_channel();
        let _feed = change_feed::open(self.store.clone(), self.topic.clone(), settings.retry, feed_tx);
        let _poller = poller::start(
            self.store.clone(),
            self.topic.clone(),
            settings.poll_interval,
            poll_tx,
        );

        let grace = sleep(settings.grace_period);
        tokio::pin!(grace);
        let mut grace_pending = true;

        loop {
            tokio::select! {
                () = &mut grace, if grace_pending => {
                    grace_pending = false;
                    self.set_mode(self.mode.on_grace_elapsed());
                }
                Some(message) = feed_rx.recv() => match message {
                    FeedMessage::Status(status) => {
                        let previous = self.mode;
                        self.set_mode(previous.on_feed_status(status));
                        if previous != SourceMode::Live && self.mode == SourceMode::Live {
                            // Events may have been missed while the feed was down.
                            self.refetch().await;
                        }
                    }
                    FeedMessage::Event(event) => {
                        self.set_mode(self.mode.on_push_event());
                        self.on_push(event.record).await;
                    }
                },
                Some(update) = poll_rx.recv() => {
                    if self.mode.accepts(UpdateSource::Poll) {
                        match update {
                            PollUpdate::Changed(snapshot) => self.apply(snapshot),
                            PollUpdate::Unchanged => self.stamp(),
                        }
                    } else {
                        debug!(topic = %self.topic, "discarding poll result while push is live");
                    }
                }
                else => break,
            }
        }
    }

    fn set_mode(&mut self, next: SourceMode) {
        if next == self.mode {
            return;
        }
        match next {
            SourceMode::Live => info!(topic = %self.topic, from = %self.mode, "push feed is authoritative"),
            SourceMode::Fallback => warn!(topic = %self.topic, from = %self.mode, "falling back to polling"),
            SourceMode::Connecting => {}
        }
        self.mode = next;
        self.health.send_modify(|health| health.mode = next);
    }

    async fn on_push(&mut self, record: Record) {
        match (self.topic.shape(), record) {
            (TopicShape::Single, Record::Session(session)) => {
                self.apply(TopicSnapshot::Session(Some(session)));
            }
            (TopicShape::Collection, _) => self.refetch().await,
            (TopicShape::Single, other) => {
                debug!(topic = %self.topic, record = ?other, "ignoring unrelated push record");
            }
        }
    }

    async fn refetch(&mut self) {
        match fetch_topic(&self.store, &self.topic).await {
            Ok(snapshot) => self.apply(snapshot),
            Err(err) => warn!(topic = %self.topic, error = %err, "topic refetch failed"),
        }
    }

    fn apply(&mut self, snapshot: TopicSnapshot) {
        self.updates.send_if_modified(|current| {
            if current.as_ref() == Some(&snapshot) {
                false
            } else {
                *current = Some(snapshot);
                true
            }
        });
        self.stamp();
    }

    fn stamp(&mut self) {
        let now = Instant::now();
        self.health.send_modify(|health| health.last_update = Some(now));
    }
}
