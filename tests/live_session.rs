//! End-to-end flows over the in-memory store with paused time.

use std::{sync::Arc, time::Duration};

use live_quiz_back::{
    clock::TokioClock,
    config::{Question, QuizConfig},
    dao::{
        models::{AnswerValue, SessionCode, SessionStatus},
        quiz_store::{QuizStore, memory::InMemoryQuizStore},
        topic::{Topic, TopicSnapshot},
    },
    dto::session::{CreateSessionResponse, JoinSessionRequest, SubmitAnswerRequest},
    error::ServiceError,
    services::{
        agents::{self, AgentRole},
        host_service, session_service,
        session_service::SubmitOutcome,
        session_view::SessionView,
    },
    state::{AppState, SharedState},
    sync::{SourceMode, reconciler},
};
use tokio::time::sleep;
use uuid::Uuid;

fn question(correct_option: u32, time_limit_secs: u64) -> Question {
    Question {
        prompt: "Pick one".into(),
        options: vec!["a".into(), "b".into(), "c".into(), "d".into()],
        correct_option,
        time_limit_secs,
    }
}

async fn setup(config: QuizConfig) -> (SharedState, InMemoryQuizStore) {
    let state = AppState::with_clock(config, Arc::new(TokioClock::new()));
    let store = InMemoryQuizStore::new();
    state.set_store(Arc::new(store.clone()) as Arc<dyn QuizStore>).await;
    (state, store)
}

async fn join(state: &SharedState, code: &SessionCode, name: &str) -> Uuid {
    session_service::join_session(state, code, JoinSessionRequest { name: name.into() })
        .await
        .unwrap()
        .participant_id
}

async fn answer(state: &SharedState, code: &SessionCode, participant_id: Uuid, option: u32) -> SubmitOutcome {
    session_service::submit_answer(
        state,
        code,
        SubmitAnswerRequest {
            participant_id,
            question_index: 0,
            option: Some(option),
        },
    )
    .await
    .unwrap()
}

async fn score_of(state: &SharedState, code: &SessionCode, participant_id: Uuid) -> u32 {
    session_service::list_participants(state, code)
        .await
        .unwrap()
        .into_iter()
        .find(|participant| participant.id == participant_id)
        .map(|participant| participant.total_score)
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn fastest_correct_answers_are_ranked_and_scored_once() {
    let config = QuizConfig::default().with_questions(vec![question(1, 30), question(0, 30)]);
    let (state, _store) = setup(config).await;
    let CreateSessionResponse { code, host_token, .. } =
        session_service::create_session(&state).await.unwrap();

    let a = join(&state, &code, "A").await;
    let b = join(&state, &code, "B").await;
    let c = join(&state, &code, "C").await;
    let d = join(&state, &code, "D").await;

    host_service::start_quiz(&state, &code, &host_token).await.unwrap();

    sleep(Duration::from_millis(90)).await;
    answer(&state, &code, c, 1).await;
    sleep(Duration::from_millis(30)).await;
    answer(&state, &code, a, 1).await;
    sleep(Duration::from_millis(220)).await;
    answer(&state, &code, b, 1).await;
    sleep(Duration::from_millis(160)).await;
    answer(&state, &code, d, 3).await;

    let summary = host_service::reveal_rankings(&state, &code, &host_token).await.unwrap();
    assert_eq!(summary.status, SessionStatus::ShowingResults);

    assert_eq!(score_of(&state, &code, c).await, 10);
    assert_eq!(score_of(&state, &code, a).await, 7);
    assert_eq!(score_of(&state, &code, b).await, 5);
    assert_eq!(score_of(&state, &code, d).await, 0);

    let ranked = session_service::list_participants(&state, &code).await.unwrap();
    assert_eq!(ranked.first().map(|participant| participant.id), Some(c));

    // Advancing after the reveal scores the same question again without new points.
    let summary = host_service::advance_question(&state, &code, &host_token).await.unwrap();
    assert_eq!(summary.status, SessionStatus::Active);
    assert_eq!(summary.current_question_index, 1);
    assert_eq!(score_of(&state, &code, c).await, 10);

    let summary = host_service::advance_question(&state, &code, &host_token).await.unwrap();
    assert_eq!(summary.status, SessionStatus::Finished);
    assert_eq!(summary.current_question_index, 1);

    let err = host_service::advance_question(&state, &code, &host_token).await.unwrap_err();
    assert!(matches!(err, ServiceError::InvalidState(_)));
}

#[tokio::test(start_paused = true)]
async fn resubmission_keeps_the_first_answer() {
    let config = QuizConfig::default().with_questions(vec![question(2, 30)]);
    let (state, _store) = setup(config).await;
    let created = session_service::create_session(&state).await.unwrap();
    let ada = join(&state, &created.code, "Ada").await;
    host_service::start_quiz(&state, &created.code, &created.host_token).await.unwrap();

    sleep(Duration::from_millis(400)).await;
    let first = answer(&state, &created.code, ada, 2).await;
    let second = answer(&state, &created.code, ada, 0).await;

    assert!(matches!(first, SubmitOutcome::Recorded(_)));
    match second {
        SubmitOutcome::AlreadyRecorded(stored) => {
            assert_eq!(stored.value, AnswerValue::Choice(2));
            assert_eq!(stored.response_time_ms, 400);
        }
        other => panic!("expected the stored answer, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn participants_that_run_out_of_time_get_exactly_one_timeout() {
    let config = QuizConfig::default().with_questions(vec![question(0, 5), question(1, 5)]);
    let (state, store) = setup(config).await;
    let created = session_service::create_session(&state).await.unwrap();
    let quick = join(&state, &created.code, "Quick").await;
    let slow = join(&state, &created.code, "Slow").await;

    host_service::start_quiz(&state, &created.code, &created.host_token).await.unwrap();

    let store_handle = state.require_store().await.unwrap();
    let mut agents_held = Vec::new();
    let mut views = Vec::new();
    for participant_id in [quick, slow] {
        let (view, _events) = SessionView::open(
            store_handle.clone(),
            created.code.clone(),
            state.config().clone(),
            state.clock().clone(),
        );
        agents_held.push(agents::spawn(
            state.clone(),
            created.code.clone(),
            AgentRole::Participant { participant_id },
            view.subscribe(),
            view.session(),
        ));
        views.push(view);
    }

    sleep(Duration::from_secs(1)).await;
    answer(&state, &created.code, quick, 0).await;

    // Well past the deadline, with many ticks after expiry.
    sleep(Duration::from_secs(10)).await;

    let answers = store.all_answers(created.session_id).await;
    assert_eq!(answers.len(), 2);
    let quick_answer = answers.iter().find(|answer| answer.participant_id == quick).unwrap();
    assert_eq!(quick_answer.value, AnswerValue::Choice(0));
    let slow_answers: Vec<_> = answers.iter().filter(|answer| answer.participant_id == slow).collect();
    assert_eq!(slow_answers.len(), 1);
    assert_eq!(slow_answers[0].value, AnswerValue::Timeout);
    assert!(!slow_answers[0].is_correct);

    // The next question re-arms the agents.
    host_service::advance_question(&state, &created.code, &created.host_token)
        .await
        .unwrap();
    sleep(Duration::from_secs(10)).await;

    let answers = store.all_answers(created.session_id).await;
    let second_round = answers.iter().filter(|answer| answer.question_index == 1).count();
    assert_eq!(second_round, 2);
    assert!(
        answers
            .iter()
            .filter(|answer| answer.question_index == 1)
            .all(|answer| answer.value == AnswerValue::Timeout)
    );

    drop(agents_held);
    for view in &views {
        view.close();
    }
}

#[tokio::test(start_paused = true)]
async fn host_stream_advances_on_deadline_when_enabled() {
    let config = QuizConfig::default()
        .with_questions(vec![question(0, 3), question(1, 3)])
        .with_auto_advance(true);
    let (state, _store) = setup(config).await;
    let created = session_service::create_session(&state).await.unwrap();
    join(&state, &created.code, "Solo").await;
    host_service::start_quiz(&state, &created.code, &created.host_token).await.unwrap();

    let (view, _events) = SessionView::open(
        state.require_store().await.unwrap(),
        created.code.clone(),
        state.config().clone(),
        state.clock().clone(),
    );
    let _host = agents::spawn(
        state.clone(),
        created.code.clone(),
        AgentRole::Host {
            host_token: created.host_token.clone(),
        },
        view.subscribe(),
        view.session(),
    );

    sleep(Duration::from_secs(5)).await;
    let session = session_service::find_session(&state, &created.code).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.current_question_index, 1);

    sleep(Duration::from_secs(5)).await;
    let session = session_service::find_session(&state, &created.code).await.unwrap();
    assert_eq!(session.status, SessionStatus::Finished);
}

#[tokio::test(start_paused = true)]
async fn two_host_streams_advance_each_deadline_once() {
    let config = QuizConfig::default()
        .with_questions((0..4).map(|i| question(i % 4, 3)).collect())
        .with_auto_advance(true);
    let (state, store) = setup(config).await;
    let created = session_service::create_session(&state).await.unwrap();
    join(&state, &created.code, "Solo").await;
    host_service::start_quiz(&state, &created.code, &created.host_token).await.unwrap();

    let mut views = Vec::new();
    let mut hosts = Vec::new();
    for _ in 0..2 {
        let (view, _events) = SessionView::open(
            state.require_store().await.unwrap(),
            created.code.clone(),
            state.config().clone(),
            state.clock().clone(),
        );
        hosts.push(agents::spawn(
            state.clone(),
            created.code.clone(),
            AgentRole::Host {
                host_token: created.host_token.clone(),
            },
            view.subscribe(),
            view.session(),
        ));
        views.push(view);
    }

    sleep(Duration::from_secs(4)).await;
    let session = session_service::find_session(&state, &created.code).await.unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.current_question_index, 1);

    sleep(Duration::from_secs(3)).await;
    let session = session_service::find_session(&state, &created.code).await.unwrap();
    assert_eq!(session.current_question_index, 2);
    assert!(store.all_answers(created.session_id).await.is_empty());

    drop(hosts);
    for view in &views {
        view.close();
    }
}

#[tokio::test(start_paused = true)]
async fn polling_takes_over_when_the_push_channel_is_down() {
    let config = QuizConfig::default();
    let (state, store) = setup(config).await;
    store.set_push_available(false);
    let created = session_service::create_session(&state).await.unwrap();
    join(&state, &created.code, "Ada").await;

    let settings = state.config().sync().reconciler(Duration::from_millis(1_000));
    let subscription = reconciler::open(
        state.require_store().await.unwrap(),
        Topic::Session {
            code: created.code.clone(),
        },
        settings,
    );

    sleep(Duration::from_secs(3)).await;
    assert_eq!(subscription.current_health().mode, SourceMode::Fallback);

    host_service::start_quiz(&state, &created.code, &created.host_token).await.unwrap();
    sleep(settings.poll_interval + Duration::from_millis(100)).await;

    match subscription.current() {
        Some(TopicSnapshot::Session(Some(session))) => {
            assert_eq!(session.status, SessionStatus::Active);
        }
        other => panic!("unexpected snapshot {other:?}"),
    }

    // Once push comes back the feed is promoted again.
    store.set_push_available(true);
    sleep(Duration::from_secs(15)).await;
    assert_eq!(subscription.current_health().mode, SourceMode::Live);
    subscription.close();
}
