#[cfg(feature = "couch-store")]
pub mod couchdb;
pub mod memory;
#[cfg(feature = "mongo-store")]
pub mod mongodb;

use futures::{future::BoxFuture, stream::BoxStream};
use uuid::Uuid;

use crate::dao::{
    models::{
        AnswerEntity, AnswerKey, ParticipantEntity, SessionCode, SessionEntity, SessionGuard,
        SessionPatch,
    },
    storage::StorageResult,
    topic::{ChangeEvent, Topic},
};

/// Push stream of row changes matching one topic. Ends (or yields an error) when the
/// underlying subscription breaks.
pub type ChangeStream = BoxStream<'static, StorageResult<ChangeEvent>>;

/// Abstraction over the persistence layer holding sessions, participants and answers.
///
/// Uniqueness of session codes, participant names (per session) and answer triples is
/// enforced by the backend and reported as [`StorageError::Conflict`](crate::dao::storage::StorageError::Conflict).
pub trait QuizStore: Send + Sync {
    /// Store a new session; a taken code is a conflict.
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<SessionEntity>>;
    /// Resolve a session by its normalised code.
    fn find_session_by_code(
        &self,
        code: SessionCode,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;
    /// Compare-and-set write: applies `patch` only while the record still matches `guard`.
    /// Returns `None` when the record is missing or no longer matches.
    fn update_session(
        &self,
        id: Uuid,
        guard: SessionGuard,
        patch: SessionPatch,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>>;

    /// Store a new participant; a taken name within the session is a conflict.
    fn insert_participant(
        &self,
        participant: ParticipantEntity,
    ) -> BoxFuture<'static, StorageResult<ParticipantEntity>>;
    fn find_participant(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>>;
    fn find_participant_by_name(
        &self,
        session_id: Uuid,
        name: String,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>>;
    /// Participants of a session ranked by total score.
    fn list_participants(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>>;

    /// Store an answer; a second row for the same triple is a conflict.
    fn insert_answer(&self, answer: AnswerEntity) -> BoxFuture<'static, StorageResult<AnswerEntity>>;
    fn find_answer(&self, key: AnswerKey) -> BoxFuture<'static, StorageResult<Option<AnswerEntity>>>;
    /// Answers of one question in submission order.
    fn list_answers(
        &self,
        session_id: Uuid,
        question_index: u32,
    ) -> BoxFuture<'static, StorageResult<Vec<AnswerEntity>>>;
    /// Raise the points carried by an answer to `points` (never lower them) and set the
    /// owner's total to the sum of the points carried by their answers. Returns the points
    /// added to the answer.
    ///
    /// Repeating the call is harmless and repairs a total left behind by an earlier call that
    /// failed halfway.
    fn award_answer(&self, key: AnswerKey, points: u32) -> BoxFuture<'static, StorageResult<u32>>;

    /// Open a push subscription restricted to `topic`.
    fn watch(&self, topic: Topic) -> BoxFuture<'static, StorageResult<ChangeStream>>;

    /// Cheap round-trip proving the backend answers.
    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>>;
    /// Rebuild the underlying connection in place.
    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>>;
}
