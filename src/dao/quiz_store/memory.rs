//! In-process store used for local runs and tests.
//!
//! Change events are fanned out over a broadcast channel. The push channel, the read path
//! and the award path can be broken at runtime to rehearse backend failures.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU32, Ordering},
    },
    time::SystemTime,
};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use thiserror::Error;
use tokio::sync::{
    RwLock,
    broadcast::{self, error::RecvError},
    watch,
};
use tracing::warn;
use uuid::Uuid;

use super::{ChangeStream, QuizStore};
use crate::dao::{
    models::{
        AnswerEntity, AnswerKey, ParticipantEntity, SessionCode, SessionEntity, SessionGuard,
        SessionPatch, rank_participants,
    },
    storage::{StorageError, StorageResult},
    topic::{ChangeEvent, ChangeKind, Record, Topic},
};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Failure raised on purpose by the fault switches.
#[derive(Debug, Error)]
#[error("injected {0} fault")]
pub struct InjectedFault(&'static str);

#[derive(Clone)]
pub struct InMemoryQuizStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    data: RwLock<MemoryData>,
    changes: broadcast::Sender<ChangeEvent>,
    push_gate: watch::Sender<bool>,
    reads_failing: AtomicBool,
    interrupt_next_award: AtomicBool,
    stale_answer_reads: AtomicU32,
    watch_calls: AtomicU32,
}

#[derive(Default)]
struct MemoryData {
    sessions: IndexMap<Uuid, SessionEntity>,
    participants: IndexMap<Uuid, ParticipantEntity>,
    answers: IndexMap<AnswerKey, AnswerEntity>,
}

impl Default for InMemoryQuizStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQuizStore {
    /// Build an empty store with the push channel available.
    pub fn new() -> Self {
        let (changes, _receiver) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let (push_gate, _gate_rx) = watch::channel(true);
        Self {
            inner: Arc::new(MemoryInner {
                data: RwLock::new(MemoryData::default()),
                changes,
                push_gate,
                reads_failing: AtomicBool::new(false),
                interrupt_next_award: AtomicBool::new(false),
                stale_answer_reads: AtomicU32::new(0),
                watch_calls: AtomicU32::new(0),
            }),
        }
    }

    /// Enable or cut the push channel. Cutting it ends every open change stream with an error
    /// and makes new subscriptions fail until it is enabled again.
    pub fn set_push_available(&self, available: bool) {
        self.inner.push_gate.send_replace(available);
    }

    /// Make every read operation fail (writes keep working).
    pub fn set_reads_failing(&self, failing: bool) {
        self.inner.reads_failing.store(failing, Ordering::SeqCst);
    }

    /// Make the next award stop after raising the answer's points, leaving the participant
    /// total untouched, the way a backend fails between its two writes.
    pub fn interrupt_next_award(&self) {
        self.inner.interrupt_next_award.store(true, Ordering::SeqCst);
    }

    /// Make the next `count` answer lookups report nothing, like a replica lagging behind
    /// the writes. Inserts still see every row.
    pub fn set_stale_answer_reads(&self, count: u32) {
        self.inner.stale_answer_reads.store(count, Ordering::SeqCst);
    }

    /// Number of subscription attempts seen so far.
    pub fn watch_calls(&self) -> u32 {
        self.inner.watch_calls.load(Ordering::SeqCst)
    }

    /// Every answer row stored for a session, all questions included.
    pub async fn all_answers(&self, session_id: Uuid) -> Vec<AnswerEntity> {
        let data = self.inner.data.read().await;
        data.answers
            .values()
            .filter(|answer| answer.session_id == session_id)
            .cloned()
            .collect()
    }
}

impl MemoryInner {
    fn check_reads(&self) -> StorageResult<()> {
        if self.reads_failing.load(Ordering::SeqCst) {
            return Err(StorageError::unavailable(
                "memory store reads disabled".into(),
                InjectedFault("read"),
            ));
        }
        Ok(())
    }

    fn publish(&self, kind: ChangeKind, record: Record) {
        // No receivers simply means nobody is subscribed right now.
        let _ = self.changes.send(ChangeEvent { kind, record });
    }
}

enum Step {
    Gate(bool),
    Change(Result<ChangeEvent, RecvError>),
}

impl QuizStore for InMemoryQuizStore {
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<SessionEntity>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut data = inner.data.write().await;
            if data.sessions.values().any(|existing| existing.code == session.code) {
                return Err(StorageError::conflict(format!(
                    "session code `{}` already in use",
                    session.code
                )));
            }
            data.sessions.insert(session.id, session.clone());
            inner.publish(ChangeKind::Insert, Record::Session(session.clone()));
            Ok(session)
        })
    }

    fn find_session_by_code(
        &self,
        code: SessionCode,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.check_reads()?;
            let data = inner.data.read().await;
            Ok(data.sessions.values().find(|s| s.code == code).cloned())
        })
    }

    fn update_session(
        &self,
        id: Uuid,
        guard: SessionGuard,
        patch: SessionPatch,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut data = inner.data.write().await;
            let Some(session) = data.sessions.get_mut(&id) else {
                return Ok(None);
            };
            if !session.matches_guard(&guard) {
                return Ok(None);
            }
            session.apply_patch(&patch, SystemTime::now());
            let updated = session.clone();
            inner.publish(ChangeKind::Update, Record::Session(updated.clone()));
            Ok(Some(updated))
        })
    }

    fn insert_participant(
        &self,
        participant: ParticipantEntity,
    ) -> BoxFuture<'static, StorageResult<ParticipantEntity>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut data = inner.data.write().await;
            let taken = data.participants.values().any(|existing| {
                existing.session_id == participant.session_id && existing.name == participant.name
            });
            if taken {
                return Err(StorageError::conflict(format!(
                    "name `{}` already taken",
                    participant.name
                )));
            }
            data.participants.insert(participant.id, participant.clone());
            inner.publish(ChangeKind::Insert, Record::Participant(participant.clone()));
            Ok(participant)
        })
    }

    fn find_participant(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.check_reads()?;
            let data = inner.data.read().await;
            Ok(data.participants.get(&id).cloned())
        })
    }

    fn find_participant_by_name(
        &self,
        session_id: Uuid,
        name: String,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.check_reads()?;
            let data = inner.data.read().await;
            Ok(data
                .participants
                .values()
                .find(|p| p.session_id == session_id && p.name == name)
                .cloned())
        })
    }

    fn list_participants(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.check_reads()?;
            let data = inner.data.read().await;
            let mut participants: Vec<_> = data
                .participants
                .values()
                .filter(|p| p.session_id == session_id)
                .cloned()
                .collect();
            rank_participants(&mut participants);
            Ok(participants)
        })
    }

    fn insert_answer(&self, answer: AnswerEntity) -> BoxFuture<'static, StorageResult<AnswerEntity>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut data = inner.data.write().await;
            let key = answer.key();
            if data.answers.contains_key(&key) {
                return Err(StorageError::conflict(format!(
                    "answer already recorded for participant `{}` on question {}",
                    key.participant_id, key.question_index
                )));
            }
            data.answers.insert(key, answer.clone());
            inner.publish(ChangeKind::Insert, Record::Answer(answer.clone()));
            Ok(answer)
        })
    }

    fn find_answer(&self, key: AnswerKey) -> BoxFuture<'static, StorageResult<Option<AnswerEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.check_reads()?;
            let stale = inner
                .stale_answer_reads
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
                .is_ok();
            if stale {
                return Ok(None);
            }
            let data = inner.data.read().await;
            Ok(data.answers.get(&key).cloned())
        })
    }

    fn list_answers(
        &self,
        session_id: Uuid,
        question_index: u32,
    ) -> BoxFuture<'static, StorageResult<Vec<AnswerEntity>>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.check_reads()?;
            let data = inner.data.read().await;
            Ok(data
                .answers
                .values()
                .filter(|a| a.session_id == session_id && a.question_index == question_index)
                .cloned()
                .collect())
        })
    }

    fn award_answer(&self, key: AnswerKey, points: u32) -> BoxFuture<'static, StorageResult<u32>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut data = inner.data.write().await;
            let Some(answer) = data.answers.get_mut(&key) else {
                return Ok(0);
            };
            let added = points.saturating_sub(answer.points_awarded);
            if added > 0 {
                answer.points_awarded = points;
                let updated = answer.clone();
                inner.publish(ChangeKind::Update, Record::Answer(updated));
            }

            if inner.interrupt_next_award.swap(false, Ordering::SeqCst) {
                return Err(StorageError::unavailable(
                    "memory store award interrupted".into(),
                    InjectedFault("award"),
                ));
            }

            let total = data
                .answers
                .values()
                .filter(|answer| answer.participant_id == key.participant_id)
                .fold(0u32, |sum, answer| sum.saturating_add(answer.points_awarded));
            if let Some(participant) = data.participants.get_mut(&key.participant_id) {
                if participant.total_score != total {
                    participant.total_score = total;
                    let updated = participant.clone();
                    inner.publish(ChangeKind::Update, Record::Participant(updated));
                }
            }
            Ok(added)
        })
    }

    fn watch(&self, topic: Topic) -> BoxFuture<'static, StorageResult<ChangeStream>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            inner.watch_calls.fetch_add(1, Ordering::SeqCst);
            let mut gate = inner.push_gate.subscribe();
            if !*gate.borrow_and_update() {
                return Err(StorageError::unavailable(
                    format!("push channel unavailable for {topic}"),
                    InjectedFault("push"),
                ));
            }
            let mut changes = inner.changes.subscribe();

            let stream = async_stream::stream! {
                loop {
                    let step = tokio::select! {
                        changed = gate.changed() => Step::Gate(changed.is_ok()),
                        received = changes.recv() => Step::Change(received),
                    };
                    match step {
                        Step::Gate(alive) => {
                            if !alive || !*gate.borrow_and_update() {
                                yield Err(StorageError::unavailable(
                                    format!("push channel dropped for {topic}"),
                                    InjectedFault("push"),
                                ));
                                break;
                            }
                        }
                        Step::Change(Ok(event)) => {
                            if topic.matches(&event.record) {
                                yield Ok(event);
                            }
                        }
                        Step::Change(Err(RecvError::Lagged(skipped))) => {
                            warn!(%topic, skipped, "memory change feed lagged");
                        }
                        Step::Change(Err(RecvError::Closed)) => break,
                    }
                }
            };

            Ok(Box::pin(stream) as ChangeStream)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let inner = self.inner.clone();
        Box::pin(async move { inner.check_reads() })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        Box::pin(async move { Ok(()) })
    }
}
