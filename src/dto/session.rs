use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::{
    config::{Question, QuizConfig},
    dao::models::{AnswerEntity, ParticipantEntity, SessionCode, SessionEntity, SessionStatus},
    dto::{epoch_millis, format_system_time, validation::validate_display_name},
};

/// Returned once to the host when a session is created.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSessionResponse {
    pub session_id: Uuid,
    pub code: SessionCode,
    /// Opaque identifier to present as `X-Host-Token` on host commands.
    pub host_token: String,
}

/// Public projection of a question: the answer key is never included.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct QuestionSummary {
    pub index: u32,
    pub prompt: String,
    pub options: Vec<String>,
    pub time_limit_secs: u64,
}

impl QuestionSummary {
    /// Project the question at `index`.
    pub fn new(index: u32, question: &Question) -> Self {
        Self {
            index,
            prompt: question.prompt.clone(),
            options: question.options.clone(),
            time_limit_secs: question.time_limit_secs,
        }
    }
}

/// Public projection of a session record.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SessionSummary {
    pub id: Uuid,
    pub code: SessionCode,
    pub status: SessionStatus,
    pub current_question_index: u32,
    pub question_count: u32,
    /// RFC 3339 start instant of the current question.
    pub question_start_time: Option<String>,
    /// Same instant as milliseconds since the Unix epoch, for client-side countdowns.
    pub question_start_epoch_ms: Option<u64>,
    /// The running or last shown question; absent in the lobby.
    pub current_question: Option<QuestionSummary>,
    pub created_at: String,
    pub updated_at: String,
}

impl SessionSummary {
    /// Project `session`, resolving the current question from the bank.
    pub fn new(session: &SessionEntity, config: &QuizConfig) -> Self {
        let current_question = match session.status {
            SessionStatus::Waiting => None,
            _ => config
                .question(session.current_question_index)
                .map(|question| QuestionSummary::new(session.current_question_index, question)),
        };

        Self {
            id: session.id,
            code: session.code.clone(),
            status: session.status,
            current_question_index: session.current_question_index,
            question_count: config.question_count(),
            question_start_time: session.question_start_time.map(format_system_time),
            question_start_epoch_ms: session.question_start_time.map(epoch_millis),
            current_question,
            created_at: format_system_time(session.created_at),
            updated_at: format_system_time(session.updated_at),
        }
    }
}

/// Payload used to join a session.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct JoinSessionRequest {
    /// Display name, unique within the session once trimmed.
    #[validate(custom(function = "validate_display_name"))]
    pub name: String,
}

/// Public projection of a participant.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ParticipantSummary {
    pub id: Uuid,
    pub name: String,
    pub total_score: u32,
    pub joined_at: String,
}

impl From<&ParticipantEntity> for ParticipantSummary {
    fn from(participant: &ParticipantEntity) -> Self {
        Self {
            id: participant.id,
            name: participant.name.clone(),
            total_score: participant.total_score,
            joined_at: format_system_time(participant.joined_at),
        }
    }
}

/// Returned to a participant after joining.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct JoinSessionResponse {
    pub participant_id: Uuid,
    pub participant: ParticipantSummary,
}

/// Payload used to answer the running question.
#[derive(Debug, Deserialize, ToSchema, Validate)]
pub struct SubmitAnswerRequest {
    pub participant_id: Uuid,
    pub question_index: u32,
    /// Chosen option index; omitted or `null` records a timeout.
    #[serde(default)]
    #[validate(range(max = 63))]
    pub option: Option<u32>,
}

/// Public projection of an answer. The submitted option and its correctness stay hidden.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AnswerSummary {
    pub participant_id: Uuid,
    pub question_index: u32,
    pub timed_out: bool,
    pub response_time_ms: u64,
    pub points_awarded: u32,
}

impl From<&AnswerEntity> for AnswerSummary {
    fn from(answer: &AnswerEntity) -> Self {
        Self {
            participant_id: answer.participant_id,
            question_index: answer.question_index,
            timed_out: answer.value.is_timeout(),
            response_time_ms: answer.response_time_ms,
            points_awarded: answer.points_awarded,
        }
    }
}

/// Whether a submission created the answer row or found one already there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SubmissionStatus {
    Recorded,
    AlreadyRecorded,
}

/// Returned after a submission.
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SubmitAnswerResponse {
    pub status: SubmissionStatus,
    pub answer: AnswerSummary,
}
