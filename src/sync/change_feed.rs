//! Push subscription to one topic that reports its own health.

use std::{fmt, sync::Arc, time::Duration};

use futures::StreamExt;
use tokio::{sync::mpsc, task::AbortHandle, time::sleep};
use tracing::{debug, info, warn};

use crate::dao::{
    quiz_store::QuizStore,
    topic::{ChangeEvent, Topic},
};

/// Health reported by a change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedStatus {
    /// First subscription attempt in flight.
    Connecting,
    /// Subscribed and delivering events.
    Live,
    /// Subscription lost or refused; retrying.
    Degraded,
    /// Several consecutive attempts failed; still retrying at the capped delay.
    Failed,
}

impl fmt::Display for FeedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            FeedStatus::Connecting => "connecting",
            FeedStatus::Live => "live",
            FeedStatus::Degraded => "degraded",
            FeedStatus::Failed => "failed",
        };
        f.write_str(label)
    }
}

/// Output of a change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedMessage {
    /// The feed changed health.
    Status(FeedStatus),
    /// A row matching the topic changed.
    Event(ChangeEvent),
}

/// Resubscription backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedRetryPolicy {
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Upper bound of the doubling delay.
    pub max_delay: Duration,
    /// Consecutive failures after which the feed reports [`FeedStatus::Failed`].
    pub failure_threshold: u32,
}

impl FeedRetryPolicy {
    const INITIAL_DELAY_MS: u64 = 2_000;
    const MAX_DELAY_MS: u64 = 10_000;
    const FAILURE_THRESHOLD: u32 = 3;

    fn next_delay(&self, current: Duration) -> Duration {
        (current * 2).min(self.max_delay)
    }
}

impl Default for FeedRetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(Self::INITIAL_DELAY_MS),
            max_delay: Duration::from_millis(Self::MAX_DELAY_MS),
            failure_threshold: Self::FAILURE_THRESHOLD,
        }
    }
}

/// Owner of a running feed. Closing is idempotent and also happens on drop.
#[derive(Debug)]
pub struct ChangeFeedHandle {
    task: AbortHandle,
}

impl ChangeFeedHandle {
    /// Stop the feed and release its subscription.
    pub fn close(&self) {
        self.task.abort();
    }

    /// Whether the feed task has stopped.
    pub fn is_closed(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for ChangeFeedHandle {
    fn drop(&mut self) {
        self.close();
    }
}

/// Subscribe to `topic` and forward events and status changes to `sink`.
///
/// The feed stops on its own once `sink` is closed.
pub fn open(
    store: Arc<dyn QuizStore>,
    topic: Topic,
    retry: FeedRetryPolicy,
    sink: mpsc::UnboundedSender<FeedMessage>,
) -> ChangeFeedHandle {
    let task = tokio::spawn(run_feed(store, topic, retry, sink));
    ChangeFeedHandle {
        task: task.abort_handle(),
    }
}

async fn run_feed(
    store: Arc<dyn QuizStore>,
    topic: Topic,
    retry: FeedRetryPolicy,
    sink: mpsc::UnboundedSender<FeedMessage>,
) {
    let mut failures: u32 = 0;
    let mut delay = retry.initial_delay;

    if sink.send(FeedMessage::Status(FeedStatus::Connecting)).is_err() {
        return;
    }

    loop {
        match store.watch(topic.clone()).await {
            Ok(mut stream) => {
                if failures > 0 {
                    info!(topic = %topic, failures, "change feed resubscribed");
                } else {
                    debug!(topic = %topic, "change feed subscribed");
                }
                failures = 0;
                delay = retry.initial_delay;
                if sink.send(FeedMessage::Status(FeedStatus::Live)).is_err() {
                    return;
                }

                loop {
                    match stream.next().await {
                        Some(Ok(event)) => {
                            if sink.send(FeedMessage::Event(event)).is_err() {
                                return;
                            }
                        }
                        Some(Err(err)) => {
                            warn!(topic = %topic, error = %err, "change feed dropped");
                            break;
                        }
                        None => {
                            warn!(topic = %topic, "change feed ended");
                            break;
                        }
                    }
                }
            }
            Err(err) => {
                warn!(topic = %topic, attempt = failures + 1, error = %err, "change feed subscription failed");
            }
        }

        failures += 1;
        let status = if failures >= retry.failure_threshold {
            FeedStatus::Failed
        } else {
            FeedStatus::Degraded
        };
        if sink.send(FeedMessage::Status(status)).is_err() {
            return;
        }

        sleep(delay).await;
        delay = retry.next_delay(delay);
    }
}
