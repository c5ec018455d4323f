//! Rank-ordered point awards for a finished question.

use std::{cmp::Ordering, sync::Arc};

use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    dao::{
        models::{AnswerEntity, AnswerKey},
        quiz_store::QuizStore,
    },
    error::ServiceError,
};

/// Points granted to the fastest correct answers, in rank order.
pub const AWARD_POINTS: [u32; 3] = [10, 7, 5];

/// Target award of one answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Award {
    /// Answer receiving the points.
    pub key: AnswerKey,
    /// Points the answer should carry.
    pub points: u32,
}

/// An award actually folded into a participant total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppliedAward {
    /// Participant whose total grew.
    pub participant_id: Uuid,
    /// Points added by this run.
    pub delta: u32,
}

fn by_speed(a: &&AnswerEntity, b: &&AnswerEntity) -> Ordering {
    a.response_time_ms
        .cmp(&b.response_time_ms)
        .then_with(|| a.submitted_at.cmp(&b.submitted_at))
        .then_with(|| a.id.cmp(&b.id))
}

/// Rank the correct answers and pair the fastest ones with [`AWARD_POINTS`].
///
/// Incorrect answers and timeouts never rank.
pub fn rank_awards(answers: &[AnswerEntity]) -> Vec<Award> {
    let mut correct: Vec<&AnswerEntity> = answers
        .iter()
        .filter(|answer| answer.is_correct && !answer.value.is_timeout())
        .collect();
    correct.sort_by(by_speed);

    correct
        .into_iter()
        .zip(AWARD_POINTS)
        .map(|(answer, points)| Award {
            key: answer.key(),
            points,
        })
        .collect()
}

/// Score one question of a session.
///
/// Every ranked answer is handed to [`QuizStore::award_answer`], which only adds the gap
/// between the target award and the points already recorded, so scoring the same question
/// twice awards once. Running it again after a failure also repairs totals the failed run
/// left behind.
pub async fn score_question(
    store: &Arc<dyn QuizStore>,
    session_id: Uuid,
    question_index: u32,
) -> Result<Vec<AppliedAward>, ServiceError> {
    let answers = store.list_answers(session_id, question_index).await?;
    let awards = rank_awards(&answers);
    let mut applied = Vec::with_capacity(awards.len());

    for award in awards {
        let delta = store.award_answer(award.key, award.points).await?;
        if delta == 0 {
            debug!(
                %session_id,
                question_index,
                participant_id = %award.key.participant_id,
                "award already recorded"
            );
            continue;
        }
        applied.push(AppliedAward {
            participant_id: award.key.participant_id,
            delta,
        });
    }

    info!(
        %session_id,
        question_index,
        answers = answers.len(),
        awarded = applied.len(),
        "question scored"
    );

    Ok(applied)
}
