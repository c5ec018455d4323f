use std::{fmt, str::FromStr, time::SystemTime};

use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use utoipa::ToSchema;
use uuid::Uuid;

/// Number of characters in a session join code.
pub const SESSION_CODE_LENGTH: usize = 6;
/// Alphabet session codes are drawn from.
const SESSION_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
/// Stored representation of the timeout sentinel answer.
const TIMEOUT_SENTINEL: &str = "timeout";

/// Short human-entry code identifying a session (6 uppercase letters or digits).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(try_from = "String", into = "String")]
#[schema(value_type = String, example = "K7Q2ZP")]
pub struct SessionCode(String);

/// Raised when user input cannot be normalised into a [`SessionCode`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid session code `{0}`: expected 6 letters or digits")]
pub struct InvalidSessionCode(pub String);

impl SessionCode {
    /// Normalise user input: surrounding whitespace is ignored and letters are upper-cased.
    pub fn parse(input: &str) -> Result<Self, InvalidSessionCode> {
        let normalized = input.trim().to_ascii_uppercase();
        let valid = normalized.len() == SESSION_CODE_LENGTH
            && normalized.bytes().all(|b| SESSION_CODE_ALPHABET.contains(&b));
        if valid {
            Ok(Self(normalized))
        } else {
            Err(InvalidSessionCode(input.to_owned()))
        }
    }

    /// Draw a fresh random code.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let code = (0..SESSION_CODE_LENGTH)
            .map(|_| {
                let idx = rng.random_range(0..SESSION_CODE_ALPHABET.len());
                SESSION_CODE_ALPHABET[idx] as char
            })
            .collect();
        Self(code)
    }

    /// Borrow the normalised code.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for SessionCode {
    type Err = InvalidSessionCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for SessionCode {
    type Error = InvalidSessionCode;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<SessionCode> for String {
    fn from(value: SessionCode) -> Self {
        value.0
    }
}

/// Lifecycle status persisted on the session record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Lobby: participants may join, no question is running.
    Waiting,
    /// A question is running and accepts answers.
    Active,
    /// The rankings for the current question are displayed.
    ShowingResults,
    /// Terminal state after the last question.
    Finished,
}

impl SessionStatus {
    /// Stable wire name, identical to the serialised form.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Waiting => "waiting",
            SessionStatus::Active => "active",
            SessionStatus::ShowingResults => "showing_results",
            SessionStatus::Finished => "finished",
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Value submitted for a question: a chosen option or the timeout sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AnswerValue {
    /// Index of the option picked by the participant.
    Choice(u32),
    /// No answer before the deadline.
    Timeout,
}

/// Raised when a stored answer value is neither an index nor the sentinel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid answer value `{0}`")]
pub struct InvalidAnswerValue(pub String);

impl AnswerValue {
    /// Build the value from an optional option index, `None` meaning timeout.
    pub fn from_option(option: Option<u32>) -> Self {
        option.map_or(AnswerValue::Timeout, AnswerValue::Choice)
    }

    /// Whether this is the timeout sentinel.
    pub fn is_timeout(self) -> bool {
        matches!(self, AnswerValue::Timeout)
    }
}

impl fmt::Display for AnswerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AnswerValue::Choice(index) => write!(f, "{index}"),
            AnswerValue::Timeout => f.write_str(TIMEOUT_SENTINEL),
        }
    }
}

impl TryFrom<String> for AnswerValue {
    type Error = InvalidAnswerValue;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value == TIMEOUT_SENTINEL {
            return Ok(AnswerValue::Timeout);
        }
        value
            .parse::<u32>()
            .map(AnswerValue::Choice)
            .map_err(|_| InvalidAnswerValue(value))
    }
}

impl From<AnswerValue> for String {
    fn from(value: AnswerValue) -> Self {
        value.to_string()
    }
}

/// Root record of a quiz session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionEntity {
    /// Opaque primary key.
    pub id: Uuid,
    /// Join code shown to participants.
    pub code: SessionCode,
    /// Opaque identifier the host presents on every host command.
    pub host_token: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Zero-based index of the current question.
    pub current_question_index: u32,
    /// Shared start instant of the current question, set once per activation.
    pub question_start_time: Option<SystemTime>,
    /// Creation timestamp.
    pub created_at: SystemTime,
    /// Last time the record was written.
    pub updated_at: SystemTime,
}

impl SessionEntity {
    /// Build a fresh session in the waiting lobby.
    pub fn new(code: SessionCode, host_token: String, now: SystemTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            code,
            host_token,
            status: SessionStatus::Waiting,
            current_question_index: 0,
            question_start_time: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether `guard` still describes this record.
    pub fn matches_guard(&self, guard: &SessionGuard) -> bool {
        self.status == guard.status && self.current_question_index == guard.current_question_index
    }

    /// Apply a phase patch, leaving the start time untouched when the patch carries none.
    pub fn apply_patch(&mut self, patch: &SessionPatch, now: SystemTime) {
        self.status = patch.status;
        self.current_question_index = patch.current_question_index;
        if let Some(start) = patch.question_start_time {
            self.question_start_time = Some(start);
        }
        self.updated_at = now;
    }
}

/// Expected phase of a session record for a compare-and-set write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionGuard {
    /// Status the record must still have.
    pub status: SessionStatus,
    /// Question index the record must still have.
    pub current_question_index: u32,
}

/// Fields written by a host transition in one atomic update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPatch {
    /// New status.
    pub status: SessionStatus,
    /// New question index.
    pub current_question_index: u32,
    /// New start instant; `None` keeps the stored one.
    pub question_start_time: Option<SystemTime>,
}

/// A player registered in a session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ParticipantEntity {
    /// Opaque primary key.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// Display name, unique within the session.
    pub name: String,
    /// Accumulated points.
    pub total_score: u32,
    /// Join timestamp, used to order equal scores.
    pub joined_at: SystemTime,
}

impl ParticipantEntity {
    /// Build a participant with a zero score.
    pub fn new(session_id: Uuid, name: String, now: SystemTime) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            name,
            total_score: 0,
            joined_at: now,
        }
    }
}

/// Composite identity of an answer row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AnswerKey {
    /// Owning session.
    pub session_id: Uuid,
    /// Answering participant.
    pub participant_id: Uuid,
    /// Question the answer belongs to.
    pub question_index: u32,
}

/// One participant's answer to one question.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnswerEntity {
    /// Opaque primary key.
    pub id: Uuid,
    /// Owning session.
    pub session_id: Uuid,
    /// Answering participant.
    pub participant_id: Uuid,
    /// Question the answer belongs to.
    pub question_index: u32,
    /// Submitted option or the timeout sentinel.
    pub value: AnswerValue,
    /// Computed at submission time against the answer key.
    pub is_correct: bool,
    /// Elapsed time from question start to submission.
    pub response_time_ms: u64,
    /// Points granted by scoring, zero until awarded.
    pub points_awarded: u32,
    /// Write timestamp, used as the tie-break between equal response times.
    pub submitted_at: SystemTime,
}

impl AnswerEntity {
    /// Composite identity of this answer.
    pub fn key(&self) -> AnswerKey {
        AnswerKey {
            session_id: self.session_id,
            participant_id: self.participant_id,
            question_index: self.question_index,
        }
    }
}

/// Order participants the way rankings display them: score descending, then join order.
pub fn rank_participants(participants: &mut [ParticipantEntity]) {
    participants.sort_by(|a, b| {
        b.total_score
            .cmp(&a.total_score)
            .then_with(|| a.joined_at.cmp(&b.joined_at))
            .then_with(|| a.id.cmp(&b.id))
    });
}
