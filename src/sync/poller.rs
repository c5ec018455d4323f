//! Periodic direct re-fetch of a topic.

use std::{sync::Arc, time::Duration};

use tokio::{
    sync::mpsc,
    task::AbortHandle,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, warn};

use crate::dao::{
    quiz_store::QuizStore,
    topic::{Topic, TopicShape, TopicSnapshot, fetch_topic},
};

/// Result of one successful poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollUpdate {
    /// Fresh content to apply.
    Changed(TopicSnapshot),
    /// The collection read back identical to the previous poll.
    Unchanged,
}

/// Owner of a running poller. Stopping is idempotent and also happens on drop.
#[derive(Debug)]
pub struct PollerHandle {
    task: AbortHandle,
}

impl PollerHandle {
    /// Cancel the poll interval.
    pub fn stop(&self) {
        self.task.abort();
    }

    /// Whether the poll task has stopped.
    pub fn is_stopped(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Fetch `topic` immediately, then every `every`, forwarding results to `sink`.
///
/// Single-entity topics are forwarded on every tick. Collection topics are compared with
/// the previous read and only forwarded when they differ.
pub fn start(
    store: Arc<dyn QuizStore>,
    topic: Topic,
    every: Duration,
    sink: mpsc::UnboundedSender<PollUpdate>,
) -> PollerHandle {
    let task = tokio::spawn(run_poller(store, topic, every, sink));
    PollerHandle {
        task: task.abort_handle(),
    }
}

async fn run_poller(
    store: Arc<dyn QuizStore>,
    topic: Topic,
    every: Duration,
    sink: mpsc::UnboundedSender<PollUpdate>,
) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut previous: Option<TopicSnapshot> = None;

    loop {
        ticker.tick().await;
        if sink.is_closed() {
            return;
        }

        let snapshot = match fetch_topic(&store, &topic).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!(topic = %topic, error = %err, "snapshot poll failed");
                continue;
            }
        };

        let update = match topic.shape() {
            TopicShape::Single => PollUpdate::Changed(snapshot),
            TopicShape::Collection if previous.as_ref() == Some(&snapshot) => {
                debug!(topic = %topic, "snapshot poll unchanged");
                PollUpdate::Unchanged
            }
            TopicShape::Collection => {
                previous = Some(snapshot.clone());
                PollUpdate::Changed(snapshot)
            }
        };

        if sink.send(update).is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use tokio::time::timeout;
    use uuid::Uuid;

    use super::*;
    use crate::dao::{
        models::{ParticipantEntity, SessionCode, SessionEntity},
        quiz_store::memory::InMemoryQuizStore,
    };

    #[tokio::test(start_paused = true)]
    async fn collection_polls_are_deduplicated() {
        let memory = InMemoryQuizStore::new();
        let store: Arc<dyn QuizStore> = Arc::new(memory);
        let session_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _poller = start(
            store.clone(),
            Topic::Participants { session_id },
            Duration::from_millis(2_000),
            tx,
        );

        assert_eq!(
            rx.recv().await,
            Some(PollUpdate::Changed(TopicSnapshot::Participants(vec![])))
        );
        assert_eq!(rx.recv().await, Some(PollUpdate::Unchanged));

        let joined = ParticipantEntity::new(session_id, "Ada".into(), SystemTime::now());
        store.insert_participant(joined.clone()).await.unwrap();

        assert_eq!(
            rx.recv().await,
            Some(PollUpdate::Changed(TopicSnapshot::Participants(vec![joined])))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn single_entity_polls_deliver_every_tick() {
        let memory = InMemoryQuizStore::new();
        let store: Arc<dyn QuizStore> = Arc::new(memory);
        let session = SessionEntity::new(SessionCode::generate(), "host".into(), SystemTime::now());
        store.insert_session(session.clone()).await.unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let _poller = start(
            store,
            Topic::Session {
                code: session.code.clone(),
            },
            Duration::from_millis(1_000),
            tx,
        );

        for _ in 0..3 {
            assert_eq!(
                rx.recv().await,
                Some(PollUpdate::Changed(TopicSnapshot::Session(Some(session.clone()))))
            );
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fetch_errors_skip_the_tick_and_polling_continues() {
        let memory = InMemoryQuizStore::new();
        memory.set_reads_failing(true);
        let store: Arc<dyn QuizStore> = Arc::new(memory.clone());
        let (tx, mut rx) = mpsc::unbounded_channel();

        let poller = start(
            store,
            Topic::Participants {
                session_id: Uuid::new_v4(),
            },
            Duration::from_millis(1_000),
            tx,
        );

        assert!(timeout(Duration::from_millis(3_500), rx.recv()).await.is_err());

        memory.set_reads_failing(false);
        assert!(matches!(rx.recv().await, Some(PollUpdate::Changed(_))));

        poller.stop();
        poller.stop();
        while rx.recv().await.is_some() {}
        assert!(poller.is_stopped());
    }
}
