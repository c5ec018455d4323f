use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use crate::dao::{
    models::{AnswerEntity, AnswerKey, ParticipantEntity, SessionCode, SessionEntity},
    topic::{ChangeKind, Record, Topic},
};

pub const SESSION_PREFIX: &str = "session::";
pub const PARTICIPANT_PREFIX: &str = "participant::";
pub const ANSWER_PREFIX: &str = "answer::";

/// Upper bound on rows returned by a single `_find` query.
pub const FIND_LIMIT: u32 = 10_000;

/// Every document stored by the quiz backend, tagged by `kind`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CouchDocument {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_rev", skip_serializing_if = "Option::is_none")]
    pub rev: Option<String>,
    #[serde(flatten)]
    pub body: CouchBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CouchBody {
    Session(SessionEntity),
    Participant(ParticipantEntity),
    Answer(AnswerEntity),
}

impl CouchDocument {
    pub fn session(session: SessionEntity, rev: Option<String>) -> Self {
        Self {
            id: session_doc_id(&session.code),
            rev,
            body: CouchBody::Session(session),
        }
    }

    pub fn participant(participant: ParticipantEntity, rev: Option<String>) -> Self {
        Self {
            id: participant_doc_id(participant.session_id, &participant.name),
            rev,
            body: CouchBody::Participant(participant),
        }
    }

    pub fn answer(answer: AnswerEntity, rev: Option<String>) -> Self {
        Self {
            id: answer_doc_id(&answer.key()),
            rev,
            body: CouchBody::Answer(answer),
        }
    }

    /// Infer the change kind from the revision counter: `1-…` is the first write.
    pub fn change_kind(&self, deleted: bool) -> ChangeKind {
        if deleted {
            ChangeKind::Delete
        } else if self.rev.as_deref().is_some_and(|rev| rev.starts_with("1-")) {
            ChangeKind::Insert
        } else {
            ChangeKind::Update
        }
    }
}

impl From<CouchBody> for Record {
    fn from(body: CouchBody) -> Self {
        match body {
            CouchBody::Session(session) => Record::Session(session),
            CouchBody::Participant(participant) => Record::Participant(participant),
            CouchBody::Answer(answer) => Record::Answer(answer),
        }
    }
}

/// Session ids embed the code so CouchDB enforces code uniqueness.
pub fn session_doc_id(code: &SessionCode) -> String {
    format!("{SESSION_PREFIX}{code}")
}

/// Participant ids embed the hex-encoded name so the name is unique per session.
pub fn participant_doc_id(session_id: Uuid, name: &str) -> String {
    let encoded: String = name.bytes().map(|b| format!("{b:02x}")).collect();
    format!("{PARTICIPANT_PREFIX}{}::{encoded}", session_id.simple())
}

pub fn answer_doc_id(key: &AnswerKey) -> String {
    format!(
        "{ANSWER_PREFIX}{}::{}::{}",
        key.session_id.simple(),
        key.participant_id.simple(),
        key.question_index
    )
}

/// Mango selector matching the documents of a topic.
pub fn topic_selector(topic: &Topic) -> Value {
    match topic {
        Topic::Session { code } => json!({ "kind": "session", "code": code.as_str() }),
        Topic::Participants { session_id } => {
            json!({ "kind": "participant", "session_id": session_id.to_string() })
        }
        Topic::Answers {
            session_id,
            question_index,
        } => json!({
            "kind": "answer",
            "session_id": session_id.to_string(),
            "question_index": question_index,
        }),
    }
}

#[derive(Debug, Serialize)]
pub struct FindRequest {
    pub selector: Value,
    pub limit: u32,
}

#[derive(Debug, Deserialize)]
pub struct FindResponse {
    pub docs: Vec<CouchDocument>,
}

#[derive(Debug, Deserialize)]
pub struct ChangesResponse {
    pub results: Vec<ChangeRow>,
    pub last_seq: Value,
}

#[derive(Debug, Deserialize)]
pub struct ChangeRow {
    pub id: String,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub doc: Option<Value>,
}
