use std::{sync::Arc, time::SystemTime};

use async_stream::try_stream;
use futures::{Stream, future::BoxFuture};
use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::{Value, from_value, json};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dao::{
    models::{
        AnswerEntity, AnswerKey, ParticipantEntity, SessionCode, SessionEntity, SessionGuard,
        SessionPatch, rank_participants,
    },
    quiz_store::{ChangeStream, QuizStore},
    storage::StorageResult,
    topic::{ChangeEvent, Topic},
};

use super::{
    config::CouchConfig,
    error::{CouchDaoError, CouchResult},
    models::{
        ChangesResponse, CouchBody, CouchDocument, FIND_LIMIT, FindRequest, FindResponse,
        answer_doc_id, participant_doc_id, session_doc_id, topic_selector,
    },
};

/// Attempts for optimistic read-modify-write before giving up.
const MAX_UPDATE_ATTEMPTS: u32 = 5;
/// Server-side wait of one `_changes` long-poll request, in milliseconds.
const LONGPOLL_TIMEOUT_MS: u64 = 30_000;
const CHANGES: &str = "_changes";
const FIND: &str = "_find";

#[derive(Clone)]
pub struct CouchQuizStore {
    client: Client,
    base_url: Arc<str>,
    database: Arc<str>,
    auth: Option<(Arc<str>, Arc<str>)>,
}

impl CouchQuizStore {
    /// Establish a connection to CouchDB and ensure the database and its index exist.
    pub async fn connect(config: CouchConfig) -> CouchResult<Self> {
        let client = Client::builder()
            .build()
            .map_err(|source| CouchDaoError::ClientBuilder { source })?;

        let base_url = Arc::<str>::from(config.base_url.trim_end_matches('/'));
        let database = Arc::<str>::from(config.database);
        let auth = config
            .username
            .zip(config.password)
            .map(|(u, p)| (Arc::<str>::from(u), Arc::<str>::from(p)));

        let store = Self {
            client,
            base_url,
            database,
            auth,
        };

        store.ensure_database().await?;
        Ok(store)
    }

    fn request(&self, method: Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}/{}/{}", self.base_url, self.database, path);
        let builder = self.client.request(method, url);
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    fn database_request(&self, method: Method) -> reqwest::RequestBuilder {
        let url = format!("{}/{}", self.base_url, self.database);
        let builder = self.client.request(method, url);
        if let Some((ref user, ref pass)) = self.auth {
            builder.basic_auth(user.as_ref(), Some(pass.as_ref()))
        } else {
            builder
        }
    }

    async fn ensure_database(&self) -> CouchResult<()> {
        let database = self.database.to_string();
        let response = self
            .database_request(Method::GET)
            .send()
            .await
            .map_err(|source| CouchDaoError::DatabaseQuery {
                database: database.clone(),
                source,
            })?;

        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => {
                let create = self
                    .database_request(Method::PUT)
                    .send()
                    .await
                    .map_err(|source| CouchDaoError::DatabaseCreate {
                        database: database.clone(),
                        source,
                    })?;
                // 412: another instance created it first.
                if !create.status().is_success() && create.status() != StatusCode::PRECONDITION_FAILED {
                    return Err(CouchDaoError::DatabaseStatus {
                        database,
                        status: create.status(),
                    });
                }
            }
            other => {
                return Err(CouchDaoError::DatabaseStatus {
                    database,
                    status: other,
                });
            }
        }

        self.ensure_index().await
    }

    async fn ensure_index(&self) -> CouchResult<()> {
        const INDEX: &str = "_index";
        let body = json!({
            "index": { "fields": ["kind", "session_id"] },
            "name": "kind-session-idx",
            "type": "json",
        });
        let response = self
            .request(Method::POST, INDEX)
            .json(&body)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: INDEX.to_string(),
                source,
            })?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(CouchDaoError::RequestStatus {
                path: INDEX.to_string(),
                status: response.status(),
            })
        }
    }

    async fn get_document(&self, doc_id: &str) -> CouchResult<Option<CouchDocument>> {
        let response = self
            .request(Method::GET, doc_id)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => response
                .json::<CouchDocument>()
                .await
                .map(Some)
                .map_err(|source| CouchDaoError::DecodeResponse {
                    path: doc_id.to_string(),
                    source,
                }),
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    /// PUT a document. A missing `_rev` creates it; a stale or duplicate id is reported
    /// as [`CouchDaoError::DocumentConflict`].
    async fn put_document<T>(&self, doc_id: &str, document: &T) -> CouchResult<()>
    where
        T: ?Sized + Serialize,
    {
        let response = self
            .request(Method::PUT, doc_id)
            .json(document)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: doc_id.to_string(),
                source,
            })?;

        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::CONFLICT => Err(CouchDaoError::DocumentConflict {
                path: doc_id.to_string(),
            }),
            other => Err(CouchDaoError::RequestStatus {
                path: doc_id.to_string(),
                status: other,
            }),
        }
    }

    async fn find_documents(&self, selector: Value) -> CouchResult<Vec<CouchDocument>> {
        let request = FindRequest {
            selector,
            limit: FIND_LIMIT,
        };
        let response = self
            .request(Method::POST, FIND)
            .json(&request)
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: FIND.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: FIND.to_string(),
                status: response.status(),
            });
        }

        let payload = response
            .json::<FindResponse>()
            .await
            .map_err(|source| CouchDaoError::DecodeResponse {
                path: FIND.to_string(),
                source,
            })?;
        Ok(payload.docs)
    }

    async fn find_session_document(&self, id: Uuid) -> CouchResult<Option<CouchDocument>> {
        let docs = self
            .find_documents(json!({ "kind": "session", "id": id.to_string() }))
            .await?;
        Ok(docs.into_iter().next())
    }

    async fn find_participant_document(&self, id: Uuid) -> CouchResult<Option<CouchDocument>> {
        let docs = self
            .find_documents(json!({ "kind": "participant", "id": id.to_string() }))
            .await?;
        Ok(docs.into_iter().next())
    }

    async fn update_session(
        &self,
        id: Uuid,
        guard: SessionGuard,
        patch: SessionPatch,
    ) -> CouchResult<Option<SessionEntity>> {
        let Some(doc) = self.find_session_document(id).await? else {
            return Ok(None);
        };
        let CouchBody::Session(mut session) = doc.body else {
            return Ok(None);
        };
        if !session.matches_guard(&guard) {
            return Ok(None);
        }
        session.apply_patch(&patch, SystemTime::now());

        let updated = CouchDocument::session(session.clone(), doc.rev);
        match self.put_document(&updated.id, &updated).await {
            Ok(()) => Ok(Some(session)),
            // Someone else wrote the record in between: the guard no longer holds.
            Err(CouchDaoError::DocumentConflict { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Raise the points of one answer, then refold the owner's total from their answers.
    ///
    /// The two documents cannot be written atomically, so the total is recomputed rather
    /// than incremented: running the award again repairs a total left behind by a failed
    /// second write.
    async fn award(&self, key: AnswerKey, points: u32) -> CouchResult<u32> {
        let added = self.raise_points(key, points).await?;
        self.refold_total(key.participant_id).await?;
        Ok(added)
    }

    async fn raise_points(&self, key: AnswerKey, points: u32) -> CouchResult<u32> {
        let doc_id = answer_doc_id(&key);
        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(doc) = self.get_document(&doc_id).await? else {
                return Ok(0);
            };
            let CouchBody::Answer(mut answer) = doc.body else {
                return Ok(0);
            };
            let added = points.saturating_sub(answer.points_awarded);
            if added == 0 {
                return Ok(0);
            }
            answer.points_awarded = points;
            let updated = CouchDocument::answer(answer, doc.rev);
            match self.put_document(&doc_id, &updated).await {
                Ok(()) => return Ok(added),
                Err(CouchDaoError::DocumentConflict { .. }) => {
                    debug!(path = %doc_id, "points update lost a revision race, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(CouchDaoError::UpdateContention {
            path: doc_id,
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    async fn refold_total(&self, participant_id: Uuid) -> CouchResult<()> {
        let docs = self
            .find_documents(json!({ "kind": "answer", "participant_id": participant_id.to_string() }))
            .await?;
        let total = answers_of(docs)
            .iter()
            .fold(0u32, |sum, answer| sum.saturating_add(answer.points_awarded));

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let Some(doc) = self.find_participant_document(participant_id).await? else {
                return Ok(());
            };
            let CouchBody::Participant(mut participant) = doc.body else {
                return Ok(());
            };
            if participant.total_score == total {
                return Ok(());
            }
            participant.total_score = total;
            let updated = CouchDocument::participant(participant, doc.rev);
            match self.put_document(&updated.id, &updated).await {
                Ok(()) => return Ok(()),
                Err(CouchDaoError::DocumentConflict { path }) => {
                    debug!(path = %path, "score update lost a revision race, retrying");
                }
                Err(err) => return Err(err),
            }
        }
        Err(CouchDaoError::UpdateContention {
            path: format!("participant {participant_id}"),
            attempts: MAX_UPDATE_ATTEMPTS,
        })
    }

    /// Current update sequence, used as the starting point of a change feed.
    async fn current_seq(&self) -> CouchResult<Value> {
        let response = self
            .request(Method::GET, CHANGES)
            .query(&[("since", "now"), ("limit", "0")])
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: CHANGES.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: CHANGES.to_string(),
                status: response.status(),
            });
        }

        let payload = response
            .json::<ChangesResponse>()
            .await
            .map_err(|source| CouchDaoError::DecodeResponse {
                path: CHANGES.to_string(),
                source,
            })?;
        Ok(payload.last_seq)
    }

    async fn longpoll_changes(&self, since: &Value, selector: &Value) -> CouchResult<ChangesResponse> {
        let since = match since {
            Value::String(seq) => seq.clone(),
            other => other.to_string(),
        };
        let query = [
            ("feed", "longpoll".to_string()),
            ("include_docs", "true".to_string()),
            ("filter", "_selector".to_string()),
            ("timeout", LONGPOLL_TIMEOUT_MS.to_string()),
            ("since", since),
        ];
        let response = self
            .request(Method::POST, CHANGES)
            .query(&query)
            .json(&json!({ "selector": selector }))
            .send()
            .await
            .map_err(|source| CouchDaoError::RequestSend {
                path: CHANGES.to_string(),
                source,
            })?;

        if !response.status().is_success() {
            return Err(CouchDaoError::RequestStatus {
                path: CHANGES.to_string(),
                status: response.status(),
            });
        }

        response
            .json::<ChangesResponse>()
            .await
            .map_err(|source| CouchDaoError::DecodeResponse {
                path: CHANGES.to_string(),
                source,
            })
    }
}

/// Long-poll `_changes` from `since`, yielding the decoded rows matching `selector`.
fn change_stream(
    store: CouchQuizStore,
    mut since: Value,
    selector: Value,
) -> impl Stream<Item = StorageResult<ChangeEvent>> + Send + 'static {
    try_stream! {
        loop {
            let changes = store.longpoll_changes(&since, &selector).await?;
            for row in changes.results {
                let Some(raw) = row.doc else {
                    continue;
                };
                let doc: CouchDocument = match from_value(raw) {
                    Ok(doc) => doc,
                    Err(err) => {
                        warn!(doc_id = %row.id, error = %err, "skipping undecodable CouchDB change");
                        continue;
                    }
                };
                let kind = doc.change_kind(row.deleted);
                yield ChangeEvent {
                    kind,
                    record: doc.body.into(),
                };
            }
            since = changes.last_seq;
        }
    }
}

fn sessions_of(docs: Vec<CouchDocument>) -> impl Iterator<Item = SessionEntity> {
    docs.into_iter().filter_map(|doc| match doc.body {
        CouchBody::Session(session) => Some(session),
        _ => None,
    })
}

fn participants_of(docs: Vec<CouchDocument>) -> Vec<ParticipantEntity> {
    docs.into_iter()
        .filter_map(|doc| match doc.body {
            CouchBody::Participant(participant) => Some(participant),
            _ => None,
        })
        .collect()
}

fn answers_of(docs: Vec<CouchDocument>) -> Vec<AnswerEntity> {
    docs.into_iter()
        .filter_map(|doc| match doc.body {
            CouchBody::Answer(answer) => Some(answer),
            _ => None,
        })
        .collect()
}

impl QuizStore for CouchQuizStore {
    fn insert_session(&self, session: SessionEntity) -> BoxFuture<'static, StorageResult<SessionEntity>> {
        let store = self.clone();
        Box::pin(async move {
            let doc = CouchDocument::session(session.clone(), None);
            store.put_document(&doc.id, &doc).await?;
            Ok(session)
        })
    }

    fn find_session_by_code(
        &self,
        code: SessionCode,
    ) -> BoxFuture<'static, StorageResult<Option<SessionEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let doc = store.get_document(&session_doc_id(&code)).await?;
            Ok(doc.and_then(|doc| sessions_of(vec![doc]).next()))
        })
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
        Box::pin(async move {
            let doc = CouchDocument::participant(participant.clone(), None);
            store.put_document(&doc.id, &doc).await?;
            Ok(participant)
        })
    }

    fn find_participant(&self, id: Uuid) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let doc = store.find_participant_document(id).await?;
            Ok(doc.and_then(|doc| participants_of(vec![doc]).pop()))
        })
    }

    fn find_participant_by_name(
        &self,
        session_id: Uuid,
        name: String,
    ) -> BoxFuture<'static, StorageResult<Option<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let doc = store
                .get_document(&participant_doc_id(session_id, &name))
                .await?;
            Ok(doc.and_then(|doc| participants_of(vec![doc]).pop()))
        })
    }

    fn list_participants(
        &self,
        session_id: Uuid,
    ) -> BoxFuture<'static, StorageResult<Vec<ParticipantEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let docs = store
                .find_documents(topic_selector(&Topic::Participants { session_id }))
                .await?;
            let mut participants = participants_of(docs);
            rank_participants(&mut participants);
            Ok(participants)
        })
    }

    fn insert_answer(&self, answer: AnswerEntity) -> BoxFuture<'static, StorageResult<AnswerEntity>> {
        let store = self.clone();
        Box::pin(async move {
            let doc = CouchDocument::answer(answer.clone(), None);
            store.put_document(&doc.id, &doc).await?;
            Ok(answer)
        })
    }

    fn find_answer(&self, key: AnswerKey) -> BoxFuture<'static, StorageResult<Option<AnswerEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let doc = store.get_document(&answer_doc_id(&key)).await?;
            Ok(doc.and_then(|doc| answers_of(vec![doc]).pop()))
        })
    }

    fn list_answers(
        &self,
        session_id: Uuid,
        question_index: u32,
    ) -> BoxFuture<'static, StorageResult<Vec<AnswerEntity>>> {
        let store = self.clone();
        Box::pin(async move {
            let docs = store
                .find_documents(topic_selector(&Topic::Answers {
                    session_id,
                    question_index,
                }))
                .await?;
            let mut answers = answers_of(docs);
            answers.sort_by(|a, b| {
                a.submitted_at
                    .cmp(&b.submitted_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            Ok(answers)
        })
    }

    fn award_answer(&self, key: AnswerKey, points: u32) -> BoxFuture<'static, StorageResult<u32>> {
        let store = self.clone();
        Box::pin(async move { store.award(key, points).await.map_err(Into::into) })
    }

    fn watch(&self, topic: Topic) -> BoxFuture<'static, StorageResult<ChangeStream>> {
        let store = self.clone();
        Box::pin(async move {
            let since = store.current_seq().await?;
            let selector = topic_selector(&topic);

            let stream = change_stream(store, since, selector);
            Ok(Box::pin(stream) as ChangeStream)
        })
    }

    fn health_check(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move {
            let url = format!("{}/{}", store.base_url, store.database);
            let response = store
                .database_request(Method::GET)
                .send()
                .await
                .map_err(|source| CouchDaoError::RequestSend {
                    path: url.clone(),
                    source,
                })?;

            if response.status().is_success() {
                Ok(())
            } else {
                Err(CouchDaoError::RequestStatus {
                    path: url,
                    status: response.status(),
                }
                .into())
            }
        })
    }

    fn try_reconnect(&self) -> BoxFuture<'static, StorageResult<()>> {
        let store = self.clone();
        Box::pin(async move { store.ensure_database().await.map_err(Into::into) })
    }
}
