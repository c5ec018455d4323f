use mongodb::bson::{DateTime, Document, doc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{MongoDaoError, MongoResult};
use crate::dao::{
    models::{AnswerEntity, AnswerKey, AnswerValue, ParticipantEntity, SessionCode, SessionEntity, SessionStatus},
    topic::{Record, Topic},
};

pub const SESSION_COLLECTION_NAME: &str = "sessions";
pub const PARTICIPANT_COLLECTION_NAME: &str = "participants";
pub const ANSWER_COLLECTION_NAME: &str = "answers";

/// Ids are stored as hyphenated strings to keep filters and change-stream matches plain.
fn parse_id(collection: &'static str, raw: &str) -> MongoResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| MongoDaoError::InvalidDocument {
        collection,
        id: raw.to_owned(),
        reason: err.to_string(),
    })
}

fn to_u32(collection: &'static str, id: &str, field: &str, value: i64) -> MongoResult<u32> {
    u32::try_from(value).map_err(|_| MongoDaoError::InvalidDocument {
        collection,
        id: id.to_owned(),
        reason: format!("`{field}` out of range: {value}"),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoSessionDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub code: String,
    pub host_token: String,
    pub status: SessionStatus,
    pub current_question_index: i64,
    pub question_start_time: Option<DateTime>,
    pub created_at: DateTime,
    pub updated_at: DateTime,
}

impl From<SessionEntity> for MongoSessionDocument {
    fn from(value: SessionEntity) -> Self {
        Self {
            id: value.id.to_string(),
            code: value.code.into(),
            host_token: value.host_token,
            status: value.status,
            current_question_index: i64::from(value.current_question_index),
            question_start_time: value.question_start_time.map(DateTime::from_system_time),
            created_at: DateTime::from_system_time(value.created_at),
            updated_at: DateTime::from_system_time(value.updated_at),
        }
    }
}

impl TryFrom<MongoSessionDocument> for SessionEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoSessionDocument) -> MongoResult<Self> {
        let code = SessionCode::parse(&value.code).map_err(|err| MongoDaoError::InvalidDocument {
            collection: SESSION_COLLECTION_NAME,
            id: value.id.clone(),
            reason: err.to_string(),
        })?;
        Ok(Self {
            id: parse_id(SESSION_COLLECTION_NAME, &value.id)?,
            code,
            host_token: value.host_token,
            status: value.status,
            current_question_index: to_u32(
                SESSION_COLLECTION_NAME,
                &value.id,
                "current_question_index",
                value.current_question_index,
            )?,
            question_start_time: value.question_start_time.map(DateTime::to_system_time),
            created_at: value.created_at.to_system_time(),
            updated_at: value.updated_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoParticipantDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub session_id: String,
    pub name: String,
    pub total_score: i64,
    pub joined_at: DateTime,
}

impl From<ParticipantEntity> for MongoParticipantDocument {
    fn from(value: ParticipantEntity) -> Self {
        Self {
            id: value.id.to_string(),
            session_id: value.session_id.to_string(),
            name: value.name,
            total_score: i64::from(value.total_score),
            joined_at: DateTime::from_system_time(value.joined_at),
        }
    }
}

impl TryFrom<MongoParticipantDocument> for ParticipantEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoParticipantDocument) -> MongoResult<Self> {
        Ok(Self {
            id: parse_id(PARTICIPANT_COLLECTION_NAME, &value.id)?,
            session_id: parse_id(PARTICIPANT_COLLECTION_NAME, &value.session_id)?,
            total_score: to_u32(
                PARTICIPANT_COLLECTION_NAME,
                &value.id,
                "total_score",
                value.total_score,
            )?,
            name: value.name,
            joined_at: value.joined_at.to_system_time(),
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MongoAnswerDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub session_id: String,
    pub participant_id: String,
    pub question_index: i64,
    pub value: AnswerValue,
    pub is_correct: bool,
    pub response_time_ms: i64,
    pub points_awarded: i64,
    pub submitted_at: DateTime,
}

impl From<AnswerEntity> for MongoAnswerDocument {
    fn from(value: AnswerEntity) -> Self {
        Self {
            id: value.id.to_string(),
            session_id: value.session_id.to_string(),
            participant_id: value.participant_id.to_string(),
            question_index: i64::from(value.question_index),
            value: value.value,
            is_correct: value.is_correct,
            response_time_ms: i64::try_from(value.response_time_ms).unwrap_or(i64::MAX),
            points_awarded: i64::from(value.points_awarded),
            submitted_at: DateTime::from_system_time(value.submitted_at),
        }
    }
}

impl TryFrom<MongoAnswerDocument> for AnswerEntity {
    type Error = MongoDaoError;

    fn try_from(value: MongoAnswerDocument) -> MongoResult<Self> {
        let collection = ANSWER_COLLECTION_NAME;
        Ok(Self {
            id: parse_id(collection, &value.id)?,
            session_id: parse_id(collection, &value.session_id)?,
            participant_id: parse_id(collection, &value.participant_id)?,
            question_index: to_u32(collection, &value.id, "question_index", value.question_index)?,
            value: value.value,
            is_correct: value.is_correct,
            response_time_ms: u64::try_from(value.response_time_ms).unwrap_or(0),
            points_awarded: to_u32(collection, &value.id, "points_awarded", value.points_awarded)?,
            submitted_at: value.submitted_at.to_system_time(),
        })
    }
}

/// Conversion of a stored document into a change-feed record.
pub trait IntoRecord {
    fn into_record(self) -> MongoResult<Record>;
}

impl IntoRecord for MongoSessionDocument {
    fn into_record(self) -> MongoResult<Record> {
        SessionEntity::try_from(self).map(Record::Session)
    }
}

impl IntoRecord for MongoParticipantDocument {
    fn into_record(self) -> MongoResult<Record> {
        ParticipantEntity::try_from(self).map(Record::Participant)
    }
}

impl IntoRecord for MongoAnswerDocument {
    fn into_record(self) -> MongoResult<Record> {
        AnswerEntity::try_from(self).map(Record::Answer)
    }
}

pub fn doc_id(id: Uuid) -> Document {
    doc! { "_id": id.to_string() }
}

pub fn answer_filter(key: &AnswerKey) -> Document {
    doc! {
        "session_id": key.session_id.to_string(),
        "participant_id": key.participant_id.to_string(),
        "question_index": i64::from(key.question_index),
    }
}

/// Filter over the documents of a topic.
pub fn topic_filter(topic: &Topic) -> Document {
    match topic {
        Topic::Session { code } => doc! { "code": code.as_str() },
        Topic::Participants { session_id } => doc! { "session_id": session_id.to_string() },
        Topic::Answers {
            session_id,
            question_index,
        } => doc! {
            "session_id": session_id.to_string(),
            "question_index": i64::from(*question_index),
        },
    }
}

/// `$match` stage for a change stream: the topic filter applied to `fullDocument`.
pub fn change_stream_match(topic: &Topic) -> Document {
    let filter = topic_filter(topic);
    let mut scoped = Document::new();
    for (key, value) in filter {
        scoped.insert(format!("fullDocument.{key}"), value);
    }
    doc! { "$match": scoped }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, SystemTime};

    use super::*;

    #[test]
    fn answer_document_keeps_sentinel_and_indices() {
        let answer = AnswerEntity {
            id: Uuid::new_v4(),
            session_id: Uuid::new_v4(),
            participant_id: Uuid::new_v4(),
            question_index: 4,
            value: AnswerValue::Timeout,
            is_correct: false,
            response_time_ms: 30_000,
            points_awarded: 0,
            submitted_at: SystemTime::UNIX_EPOCH + Duration::from_millis(1_500),
        };

        let document = MongoAnswerDocument::from(answer.clone());
        assert_eq!(document.question_index, 4);
        let restored = AnswerEntity::try_from(document).unwrap();
        assert_eq!(restored, answer);
    }

    #[test]
    fn change_stream_match_prefixes_full_document() {
        let session_id = Uuid::new_v4();
        let stage = change_stream_match(&Topic::Answers {
            session_id,
            question_index: 2,
        });
        let scoped = stage.get_document("$match").unwrap();
        assert_eq!(
            scoped.get_str("fullDocument.session_id").unwrap(),
            session_id.to_string()
        );
        assert_eq!(scoped.get_i64("fullDocument.question_index").unwrap(), 2);
    }

    #[test]
    fn malformed_id_is_reported() {
        let document = MongoParticipantDocument {
            id: "not-a-uuid".into(),
            session_id: Uuid::new_v4().to_string(),
            name: "Ada".into(),
            total_score: 0,
            joined_at: DateTime::now(),
        };
        assert!(matches!(
            ParticipantEntity::try_from(document),
            Err(MongoDaoError::InvalidDocument { .. })
        ));
    }
}
