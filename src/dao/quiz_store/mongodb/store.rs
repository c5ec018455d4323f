use std::{sync::Arc, time::SystemTime};

use futures::{StreamExt, TryStreamExt, future::BoxFuture};
use mongodb::{
    Client, Collection, Database, IndexModel,
    bson::{DateTime, doc},
    change_stream::{
        ChangeStream as MongoChangeStream,
        event::{ChangeStreamEvent, OperationType},
    },
    options::{FullDocumentType, IndexOptions, ReturnDocument},
};
use serde::de::DeserializeOwned;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    config::MongoConfig,
    connection::establish_connection,
    error::{MongoDaoError, MongoResult},
    models::{
        ANSWER_COLLECTION_NAME, IntoRecord, MongoAnswerDocument, MongoParticipantDocument,
        MongoSessionDocument, PARTICIPANT_COLLECTION_NAME, SESSION_COLLECTION_NAME, answer_filter,
        change_stream_match, doc_id, topic_filter,
    },
};
use crate::dao::{
    models::{
        AnswerEntity, AnswerKey, ParticipantEntity, SessionCode, SessionEntity, SessionGuard,
        SessionPatch, rank_participants,
    },
    quiz_store::{ChangeStream, QuizStore},
    storage::{StorageError, StorageResult},
    topic::{ChangeEvent, ChangeKind, Topic},
};

#[derive(Clone)]
pub struct MongoQuizStore {
    inner: Arc<MongoInner>,
}

struct MongoInner {
    state: RwLock<MongoState>,
    config: MongoConfig,
}

struct MongoState {
    #[allow(dead_code)]
    client: Client,
    database: Database,
}

impl MongoInner {
    async fn ping(&self) -> MongoResult<()> {
        let database = {
            let guard = self.state.read().await;
            guard.database.clone()
        };

        database
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|source| MongoDaoError::HealthPing { source })?;
        Ok(())
    }

    async fn reconnect(&self) -> MongoResult<()> {
        let (client, database) =
            establish_connection(&self.config.options, &self.config.database_name).await?;
        let mut guard = self.state.write().await;
        guard.client = client;
        guard.database = database;
        Ok(())
    }
}

impl MongoQuizStore {
    /// Establish a connection to MongoDB and ensure the unique indexes are present.
    pub async fn connect(config: MongoConfig) -> MongoResult<Self> {
        let (client, database) =
            establish_connection(&config.options, &config.database_name).await?;

        let inner = Arc::new(MongoInner {
            state: RwLock::new(MongoState { client, database }),
            config,
        });

        let store = Self { inner };
        store.ensure_indexes().await?;
        Ok(store)
    }

    async fn ensure_indexes(&self) -> MongoResult<()> {
        let database = self.database().await;
        let unique_indexes = [
            (SESSION_COLLECTION_NAME, "code", "session_code_idx", doc! { "code": 1 }),
            (
                PARTICIPANT_COLLECTION_NAME,
                "session_id,name",
                "participant_name_idx",
                doc! { "session_id": 1, "name": 1 },
            ),
            (
                ANSWER_COLLECTION_NAME,
                "session_id,participant_id,question_index",
                "answer_triple_idx",
                doc! { "session_id": 1, "participant_id": 1, "question_index": 1 },
            ),
        ];

        for (collection, index, name, keys) in unique_indexes {
            let model = IndexModel::builder()
                .keys(keys)
                .options(
                    IndexOptions::builder()
                        .name(Some(name.to_owned()))
                        .unique(Some(true))
                        .build(),
                )
                .build();

            database
                .collection::<mongodb::bson::Document>(collection)
                .create_index(model)
                .await
                .map_err(|source| MongoDaoError::EnsureIndex {
                    collection,
                    index,
                    source,
                })?;
        }

        Ok(())
    }

    async fn database(&self) -> Database {
        let guard = self.inner.state.read().await;
        guard.database.clone()
    }

    async fn sessions(&self) -> Collection<MongoSessionDocument> {
        self.database().await.collection(SESSION_COLLECTION_NAME)
    }

    async fn participants(&self) -> Collection<MongoParticipantDocument> {
        self.database().await.collection(PARTICIPANT_COLLECTION_NAME)
    }

    async fn answers(&self) -> Collection<MongoAnswerDocument> {
        self.database().await.collection(ANSWER_COLLECTION_NAME)
    }

    async fn insert_session(&self, session: SessionEntity) -> MongoResult<SessionEntity> {
        let document = MongoSessionDocument::from(session.clone());
        self.sessions()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| MongoDaoError::insert(SESSION_COLLECTION_NAME, "code", source))?;
        Ok(session)
    }

    async fn find_session_by_code(&self, code: SessionCode) -> MongoResult<Option<SessionEntity>> {
        let document = self
            .sessions()
            .await
            .find_one(doc! { "code": code.as_str() })
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: SESSION_COLLECTION_NAME,
                source,
            })?;
        document.map(SessionEntity::try_from).transpose()
    }

    /// Compare-and-set on (status, index): the filter only matches while the guard holds.
    async fn update_session(
        &self,
        id: Uuid,
        guard: SessionGuard,
        patch: SessionPatch,
    ) -> MongoResult<Option<SessionEntity>> {
        let mut filter = doc_id(id);
        filter.insert("status", guard.status.as_str());
        filter.insert("current_question_index", i64::from(guard.current_question_index));

        let mut set = doc! {
            "status": patch.status.as_str(),
            "current_question_index": i64::from(patch.current_question_index),
            "updated_at": DateTime::from_system_time(SystemTime::now()),
        };
        if let Some(start) = patch.question_start_time {
            set.insert("question_start_time", DateTime::from_system_time(start));
        }

        let updated = self
            .sessions()
            .await
            .find_one_and_update(filter, doc! { "$set": set })
            .return_document(ReturnDocument::After)
            .await
            .map_err(|source| MongoDaoError::Update {
                collection: SESSION_COLLECTION_NAME,
                source,
            })?;
        updated.map(SessionEntity::try_from).transpose()
    }

    async fn insert_participant(&self, participant: ParticipantEntity) -> MongoResult<ParticipantEntity> {
        let document = MongoParticipantDocument::from(participant.clone());
        self.participants()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| MongoDaoError::insert(PARTICIPANT_COLLECTION_NAME, "name", source))?;
        Ok(participant)
    }

    async fn find_participant(&self, filter: mongodb::bson::Document) -> MongoResult<Option<ParticipantEntity>> {
        let document = self
            .participants()
            .await
            .find_one(filter)
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: PARTICIPANT_COLLECTION_NAME,
                source,
            })?;
        document.map(ParticipantEntity::try_from).transpose()
    }

    async fn list_participants(&self, session_id: Uuid) -> MongoResult<Vec<ParticipantEntity>> {
        let documents: Vec<MongoParticipantDocument> = self
            .participants()
            .await
            .find(topic_filter(&Topic::Participants { session_id }))
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: PARTICIPANT_COLLECTION_NAME,
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: PARTICIPANT_COLLECTION_NAME,
                source,
            })?;

        let mut participants = documents
            .into_iter()
            .map(ParticipantEntity::try_from)
            .collect::<MongoResult<Vec<_>>>()?;
        rank_participants(&mut participants);
        Ok(participants)
    }

    async fn insert_answer(&self, answer: AnswerEntity) -> MongoResult<AnswerEntity> {
        let document = MongoAnswerDocument::from(answer.clone());
        self.answers()
            .await
            .insert_one(&document)
            .await
            .map_err(|source| {
                MongoDaoError::insert(ANSWER_COLLECTION_NAME, "answer for this question", source)
            })?;
        Ok(answer)
    }

    async fn find_answer(&self, key: AnswerKey) -> MongoResult<Option<AnswerEntity>> {
        let document = self
            .answers()
            .await
            .find_one(answer_filter(&key))
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: ANSWER_COLLECTION_NAME,
                source,
            })?;
        document.map(AnswerEntity::try_from).transpose()
    }

    async fn list_answers(&self, session_id: Uuid, question_index: u32) -> MongoResult<Vec<AnswerEntity>> {
        let documents: Vec<MongoAnswerDocument> = self
            .answers()
            .await
            .find(topic_filter(&Topic::Answers {
                session_id,
                question_index,
            }))
            .sort(doc! { "submitted_at": 1, "_id": 1 })
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: ANSWER_COLLECTION_NAME,
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: ANSWER_COLLECTION_NAME,
                source,
            })?;

        documents.into_iter().map(AnswerEntity::try_from).collect()
    }

    /// Raise the points of one answer with `$max`, then refold the owner's total.
    ///
    /// The total is recomputed from the answers instead of incremented, so repeating the
    /// award repairs a total left behind by a failed second write.
    async fn award(&self, key: AnswerKey, points: u32) -> MongoResult<u32> {
        let previous = self
            .answers()
            .await
            .find_one_and_update(
                answer_filter(&key),
                doc! { "$max": { "points_awarded": i64::from(points) } },
            )
            .return_document(ReturnDocument::Before)
            .await
            .map_err(|source| MongoDaoError::Update {
                collection: ANSWER_COLLECTION_NAME,
                source,
            })?;
        let Some(previous) = previous else {
            return Ok(0);
        };
        let before = AnswerEntity::try_from(previous)?.points_awarded;

        let documents: Vec<MongoAnswerDocument> = self
            .answers()
            .await
            .find(doc! { "participant_id": key.participant_id.to_string() })
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: ANSWER_COLLECTION_NAME,
                source,
            })?
            .try_collect()
            .await
            .map_err(|source| MongoDaoError::Query {
                collection: ANSWER_COLLECTION_NAME,
                source,
            })?;
        let total = documents
            .iter()
            .fold(0i64, |sum, answer| sum.saturating_add(answer.points_awarded));

        self.participants()
            .await
            .update_one(
                doc_id(key.participant_id),
                doc! { "$set": { "total_score": total } },
            )
            .await
            .map_err(|source| MongoDaoError::Update {
                collection: PARTICIPANT_COLLECTION_NAME,
                source,
            })?;

        Ok(points.saturating_sub(before))
    }

    async fn watch(&self, topic: Topic) -> MongoResult<ChangeStream> {
        let pipeline = vec![change_stream_match(&topic)];
        let stream = match topic {
            Topic::Session { .. } => {
                let stream = self
                    .sessions()
                    .await
                    .watch()
                    .pipeline(pipeline)
                    .full_document(FullDocumentType::UpdateLookup)
                    .await
                    .map_err(|source| MongoDaoError::Watch {
                        collection: SESSION_COLLECTION_NAME,
                        source,
                    })?;
                record_stream(SESSION_COLLECTION_NAME, stream)
            }
            Topic::Participants { .. } => {
                let stream = self
                    .participants()
                    .await
                    .watch()
                    .pipeline(pipeline)
                    .full_document(FullDocumentType::UpdateLookup)
                    .await
                    .map_err(|source| MongoDaoError::Watch {
                        collection: PARTICIPANT_COLLECTION_NAME,
                        source,
                    })?;
                record_stream(PARTICIPANT_COLLECTION_NAME, stream)
            }
            Topic::Answers { .. } => {
                let stream = self
                    .answers()
                    .await
                    .watch()
                    .pipeline(pipeline)
                    .full_document(FullDocumentType::UpdateLookup)
                    .await
                    .map_err(|source| MongoDaoError::Watch {
                        collection: ANSWER_COLLECTION_NAME,
                        source,
                    })?;
                record_stream(ANSWER_COLLECTION_NAME, stream)
            }
        };
        Ok(stream)
    }
}

/// Map raw change events to records. Events without a full document (deletes) are skipped.
fn record_stream<D>(
    collection: &'static str,
    stream: MongoChangeStream<ChangeStreamEvent<D>>,
) -> ChangeStream
where
    D: IntoRecord + DeserializeOwned + Unpin + Send + Sync + 'static,
{
    stream
        .filter_map(move |event| async move {
            let event = match event {
                Ok(event) => event,
                Err(source) => {
                    return Some(Err(StorageError::from(MongoDaoError::Watch {
                        collection,
                        source,
                    })));
                }
            };
            let kind = match event.operation_type {
                OperationType::Insert => ChangeKind::Insert,
                OperationType::Update | OperationType::Replace => ChangeKind::Update,
                OperationType::Delete => ChangeKind::Delete,
                _ => return None,
            };
            let document = event.full_document?;
            Some(
                document
                    .into_record()
                    .map(|record| ChangeEvent { kind, record })
                    .map_err(StorageError::from),
            )
        })
        .boxed()
}

impl QuizStore for MongoQuizStore {
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<SessionEntity>> {
        let store = self.clone();
        Box::pin(async move { store.insert_session(session).await.map_err(Into::into) })
    }

    fn find_session_by_code(
        &self,
        code: SessionCode,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_session_by_code(code).await.map_err(Into::into) })
    }

    fn update_session(
        &self,
        id: Uuid,
        guard: SessionGuard,
        patch: SessionPatch,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.update_session(id, guard, patch).await.map_err(Into::into) })
    }

    fn insert_participant(
        &self,
        participant: ParticipantEntity,
    ) -> BoxFuture<'static, StorageResult<ParticipantEntity>> {
        let store = self.clone();
        Box::pin(async move { store.insert_participant(participant).await.map_err(Into::into) })
    }

    fn find_participant(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_participant(doc_id(id)).await.map_err(Into::into) })
    }

    fn find_participant_by_name(
        &self,
        session_id: Uuid,
        name: String,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .find_participant(doc! { "session_id": session_id.to_string(), "name": name })
                .await
                .map_err(Into::into)
        })
    }

    fn list_participants(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.list_participants(session_id).await.map_err(Into::into) })
    }

    fn insert_answer(&self, answer: AnswerEntity) -> BoxFuture<'static, StorageResult<AnswerEntity>> {
        let store = self.clone();
        Box::pin(async move { store.insert_answer(answer).await.map_err(Into::into) })
    }

    fn find_answer(&self, key: AnswerKey) -> BoxFuture<'static, StorageResult<Option<AnswerEntity>>> {
        let store = self.clone();
        Box::pin(async move { store.find_answer(key).await.map_err(Into::into) })
    }

    fn list_answers(
        &self,
        session_id: Uuid,
        question_index: u32,
    ) -> BoxFuture<'static, StorageResult<Vec<AnswerEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            store
                .list_answers(session_id, question_index)
                .await
                .map_err(Into::into)
        })
    }

    fn award_answer(&self, key: AnswerKey, points: u32) -> BoxFuture<'static, StorageResult<u32>> {
        let store = self.clone();
        Box::pin(async move { store.award(key, points).await.map_err(Into::into) })
    }

    fn watch(&self, topic: Topic) -> BoxFuture<'static, StorageResult<ChangeStream>> {
        let store = self.clone();
        Box::pin(async move { store.watch(topic).await.map_err(Into::into) })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.ping().await.map_err(Into::into) })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.inner.reconnect().await.map_err(Into::into) })
    }
}
