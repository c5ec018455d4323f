//! HTTP surface exercised through the router without binding a socket.

use std::{sync::Arc, time::Duration};

use axum::{
    Router,
    body::Body,
    http::{Request, StatusCode, header},
};
use http_body_util::BodyExt;
use live_quiz_back::{
    config::QuizConfig,
    dao::quiz_store::{QuizStore, memory::InMemoryQuizStore},
    routes,
    state::AppState,
};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn app() -> Router {
    let state = AppState::new(QuizConfig::default());
    state
        .set_store(Arc::new(InMemoryQuizStore::new()) as Arc<dyn QuizStore>)
        .await;
    routes::router(state)
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::post(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn create(app: &Router) -> (String, String) {
    let (status, body) = send(app, Request::post("/sessions").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::CREATED);
    (
        body["code"].as_str().unwrap().to_owned(),
        body["host_token"].as_str().unwrap().to_owned(),
    )
}

#[tokio::test]
async fn healthcheck_reports_ok_once_the_store_is_installed() {
    let app = app().await;
    let (status, body) = send(&app, Request::get("/healthcheck").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn degraded_backend_is_reported_as_unavailable() {
    let app = routes::router(AppState::new(QuizConfig::default()));

    let (status, body) = send(&app, Request::get("/healthcheck").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");

    let (status, _) = send(&app, Request::post("/sessions").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn created_session_is_public_without_secrets() {
    let app = app().await;
    let (code, host_token) = create(&app).await;

    let uri = format!("/sessions/{}", code.to_ascii_lowercase());
    let (status, body) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], code.as_str());
    assert_eq!(body["status"], "waiting");
    assert!(!body.to_string().contains(&host_token));
}

#[tokio::test]
async fn unknown_and_malformed_codes_are_rejected() {
    let app = app().await;

    let (status, _) = send(&app, Request::get("/sessions/ZZZZZZ").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(&app, Request::get("/sessions/abc").body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_names_conflict_after_trimming() {
    let app = app().await;
    let (code, _) = create(&app).await;
    let uri = format!("/sessions/{code}/participants");

    let (status, body) = send(&app, post_json(&uri, json!({ "name": "Ada" }))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert!(body["participant_id"].is_string());

    let (status, _) = send(&app, post_json(&uri, json!({ "name": "  Ada " }))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, _) = send(&app, post_json(&uri, json!({ "name": "   " }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = send(&app, Request::get(&uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));
}

#[tokio::test]
async fn host_commands_require_the_session_token() {
    let app = app().await;
    let (code, host_token) = create(&app).await;
    let start = format!("/sessions/{code}/start");

    let (status, _) = send(&app, Request::post(&start).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let wrong = Request::post(&start)
        .header("X-Host-Token", "not-the-token")
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, wrong).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let authorised = Request::post(&start)
        .header("X-Host-Token", host_token.as_str())
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, authorised).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "active");
    assert_eq!(body["current_question_index"], 0);
    assert!(body["question_start_time"].is_string());

    let again = Request::post(&start)
        .header("X-Host-Token", host_token.as_str())
        .body(Body::empty())
        .unwrap();
    let (status, _) = send(&app, again).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn answers_are_recorded_once() {
    let app = app().await;
    let (code, host_token) = create(&app).await;

    let (_, joined) = send(
        &app,
        post_json(&format!("/sessions/{code}/participants"), json!({ "name": "Ada" })),
    )
    .await;
    let participant_id = joined["participant_id"].clone();

    let start = Request::post(format!("/sessions/{code}/start"))
        .header("X-Host-Token", host_token.as_str())
        .body(Body::empty())
        .unwrap();
    send(&app, start).await;

    let uri = format!("/sessions/{code}/answers");
    let submission = json!({ "participant_id": participant_id, "question_index": 0, "option": 1 });
    let (status, body) = send(&app, post_json(&uri, submission.clone())).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["status"], "recorded");
    assert!(body["answer"].get("is_correct").is_none());

    let (status, body) = send(&app, post_json(&uri, submission)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "already_recorded");

    let stale = json!({ "participant_id": participant_id, "question_index": 3, "option": 1 });
    let (status, _) = send(&app, post_json(&uri, stale)).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn stream_rejects_a_wrong_host_token() {
    let app = app().await;
    let (code, _) = create(&app).await;

    let uri = format!("/sessions/{code}/events?host_token=nope");
    let (status, _) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let uri = "/sessions/ZZZZZZ/events";
    let (status, _) = send(&app, Request::get(uri).body(Body::empty()).unwrap()).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn host_stream_opens_with_info_then_session_frames() {
    let app = app().await;
    let (code, host_token) = create(&app).await;

    let uri = format!("/sessions/{code}/events?host_token={host_token}");
    let response = app
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );

    // The stream never ends on its own: read frames until the session snapshot shows up.
    let mut body = response.into_body();
    let mut text = String::new();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !text.contains("event: session") {
            let frame = body.frame().await.unwrap().unwrap();
            if let Ok(data) = frame.into_data() {
                text.push_str(&String::from_utf8_lossy(&data));
            }
        }
    })
    .await
    .expect("no session frame within 5s");

    let info = text.find("event: info").unwrap();
    let session = text.find("event: session").unwrap();
    assert!(info < session);
    assert!(text.contains(r#""role":"host""#));
    assert!(text.contains(&format!(r#""code":"{code}""#)));
    assert!(!text.contains(&host_token));
}
