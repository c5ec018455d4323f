//! Logical subsets of the store tracked by the sync layer, and the records they carry.

use std::{fmt, sync::Arc};

use uuid::Uuid;

use crate::dao::{
    models::{AnswerEntity, ParticipantEntity, SessionCode, SessionEntity},
    quiz_store::QuizStore,
    storage::StorageResult,
};

/// A filtered view over one entity collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    /// The session record carrying this code.
    Session {
        /// Normalised join code.
        code: SessionCode,
    },
    /// Every participant of a session.
    Participants {
        /// Owning session.
        session_id: Uuid,
    },
    /// Every answer given in a session for one question.
    Answers {
        /// Owning session.
        session_id: Uuid,
        /// Question the answers belong to.
        question_index: u32,
    },
}

/// Whether a topic resolves to one record or to a collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicShape {
    /// At most one record (the session).
    Single,
    /// A filtered list (participants, answers).
    Collection,
}

impl Topic {
    /// Shape of the data this topic resolves to.
    pub fn shape(&self) -> TopicShape {
        match self {
            Topic::Session { .. } => TopicShape::Single,
            Topic::Participants { .. } | Topic::Answers { .. } => TopicShape::Collection,
        }
    }

    /// Whether a changed record falls inside this topic's filter.
    pub fn matches(&self, record: &Record) -> bool {
        match (self, record) {
            (Topic::Session { code }, Record::Session(session)) => &session.code == code,
            (Topic::Participants { session_id }, Record::Participant(participant)) => {
                &participant.session_id == session_id
            }
            (
                Topic::Answers {
                    session_id,
                    question_index,
                },
                Record::Answer(answer),
            ) => &answer.session_id == session_id && &answer.question_index == question_index,
            _ => false,
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Session { code } => write!(f, "session:{code}"),
            Topic::Participants { session_id } => write!(f, "participants:{session_id}"),
            Topic::Answers {
                session_id,
                question_index,
            } => write!(f, "answers:{session_id}:{question_index}"),
        }
    }
}

/// Full content of a topic at the time of a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicSnapshot {
    /// The session record, `None` when the code does not resolve.
    Session(Option<SessionEntity>),
    /// Participants ranked by total score.
    Participants(Vec<ParticipantEntity>),
    /// Answers in submission order.
    Answers(Vec<AnswerEntity>),
}

/// A single row delivered by a change feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    /// A session row.
    Session(SessionEntity),
    /// A participant row.
    Participant(ParticipantEntity),
    /// An answer row.
    Answer(AnswerEntity),
}

/// Kind of mutation reported by a change feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    /// Row created.
    Insert,
    /// Row modified.
    Update,
    /// Row removed; the record is its last known value.
    Delete,
}

/// One row-level change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    /// Mutation kind.
    pub kind: ChangeKind,
    /// Affected row.
    pub record: Record,
}

/// Read the current content of a topic by direct query.
pub async fn fetch_topic(store: &Arc<dyn QuizStore>, topic: &Topic) -> StorageResult<TopicSnapshot> {
    let snapshot = match topic {
        Topic::Session { code } => {
            TopicSnapshot::Session(store.find_session_by_code(code.clone()).await?)
        }
        Topic::Participants { session_id } => {
            TopicSnapshot::Participants(store.list_participants(*session_id).await?)
        }
        Topic::Answers {
            session_id,
            question_index,
        } => TopicSnapshot::Answers(store.list_answers(*session_id, *question_index).await?),
    };
    Ok(snapshot)
}
