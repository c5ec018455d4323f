/// Deadline agents reacting to the question countdown.
pub mod agents;
/// OpenAPI documentation generation.
pub mod documentation;
/// Health check service.
pub mod health_service;
/// Host commands driving the session lifecycle.
pub mod host_service;
/// Ranked point allocation for a closed question.
pub mod scoring;
/// Session creation, joining and answer submission.
pub mod session_service;
/// Live composition of the session, participant and answer topics.
pub mod session_view;
/// Server-Sent Events streaming of a live session.
pub mod sse_service;
/// Store connection supervisor toggling degraded mode.
pub mod storage_supervisor;
