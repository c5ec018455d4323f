//! Keeps local views of store topics current over an unreliable push channel.
//!
//! Each topic gets one [`change_feed`] (push) and one [`poller`] (pull) whose outputs are
//! arbitrated by a [`reconciler`] into a single de-duplicated update stream.

pub mod change_feed;
pub mod poller;
pub mod reconciler;

pub use change_feed::{ChangeFeedHandle, FeedMessage, FeedRetryPolicy, FeedStatus};
pub use poller::{PollUpdate, PollerHandle};
pub use reconciler::{
    ConnectionQuality, ReconcilerSettings, SourceMode, TopicHealth, TopicSubscription,
    UpdateSource,
};
