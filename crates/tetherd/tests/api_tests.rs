//! API integration tests.

use axum::http::StatusCode;
use serde_json::json;

mod common;
use common::{ECHO_AGENT, SILENT_AGENT, get, post_json, test_app};

/// Health endpoint works without authentication.
#[tokio::test]
async fn test_health_endpoint() {
    let harness = test_app(true, SILENT_AGENT);

    let (status, body) = get(&harness.app, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "stopped");
    assert_eq!(body["restart_count"], 0);

    harness.state.supervisor.dispose().await;
}

#[tokio::test]
async fn test_pairing_status_offers_code() {
    let harness = test_app(true, SILENT_AGENT);

    let (status, body) = get(&harness.app, "/pair", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["pairing_required"], true);
    assert_eq!(body["paired"], false);
    let code = body["pairing_code"].as_str().unwrap();
    assert_eq!(code.len(), 6);

    harness.state.supervisor.dispose().await;
}

#[tokio::test]
async fn test_pair_then_call_agent() {
    let harness = test_app(true, ECHO_AGENT);

    let (_, body) = get(&harness.app, "/pair", None).await;
    let code = body["pairing_code"].as_str().unwrap().to_string();

    let (status, body) = post_json(&harness.app, "/pair", &json!({ "code": code }), None).await;
    assert_eq!(status, StatusCode::OK);
    let token = body["token"].as_str().unwrap().to_string();
    assert!(token.starts_with("tk_"));

    // The token is never shown again.
    let (_, body) = get(&harness.app, "/pair", None).await;
    assert_eq!(body["paired"], true);
    assert!(body["pairing_code"].is_null());

    // And it unlocks the agent routes.
    let (status, body) = get(&harness.app, "/agent/state", Some(&token)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "stub");

    harness.state.supervisor.dispose().await;
}

#[tokio::test]
async fn test_pair_with_wrong_code() {
    let harness = test_app(true, SILENT_AGENT);
    let _ = get(&harness.app, "/pair", None).await;

    let (status, body) =
        post_json(&harness.app, "/pair", &json!({ "code": "000000" }), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    harness.state.supervisor.dispose().await;
}

#[tokio::test]
async fn test_second_pair_attempt_conflicts() {
    let harness = test_app(true, SILENT_AGENT);

    let (_, body) = get(&harness.app, "/pair", None).await;
    let code = body["pairing_code"].as_str().unwrap().to_string();
    let (status, _) = post_json(&harness.app, "/pair", &json!({ "code": code }), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = post_json(&harness.app, "/pair", &json!({ "code": code }), None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "CONFLICT");

    harness.state.supervisor.dispose().await;
}

#[tokio::test]
async fn test_lockout_after_repeated_wrong_codes() {
    let harness = test_app(true, SILENT_AGENT);
    let _ = get(&harness.app, "/pair", None).await;

    for _ in 0..4 {
        let (status, _) =
            post_json(&harness.app, "/pair", &json!({ "code": "000000" }), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    // Fifth failure locks the client out.
    let (status, body) =
        post_json(&harness.app, "/pair", &json!({ "code": "000000" }), None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["retry_after_secs"].as_u64().unwrap() > 0);

    // Even the correct code is refused while locked.
    let (_, pair_body) = get(&harness.app, "/pair", None).await;
    let code = pair_body["pairing_code"].as_str().unwrap().to_string();
    let (status, body) = post_json(&harness.app, "/pair", &json!({ "code": code }), None).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["retry_after_secs"].as_u64().unwrap() > 0);

    harness.state.supervisor.dispose().await;
}

#[tokio::test]
async fn test_agent_routes_require_token() {
    let harness = test_app(true, ECHO_AGENT);

    let (status, body) = get(&harness.app, "/agent/state", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "UNAUTHORIZED");

    let (status, _) = get(&harness.app, "/agent/state", Some("tk_forged")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    harness.state.supervisor.dispose().await;
}

#[tokio::test]
async fn test_token_accepted_via_query_parameter() {
    let harness = test_app(true, ECHO_AGENT);

    let (_, body) = get(&harness.app, "/pair", None).await;
    let code = body["pairing_code"].as_str().unwrap().to_string();
    let (_, body) = post_json(&harness.app, "/pair", &json!({ "code": code }), None).await;
    let token = body["token"].as_str().unwrap().to_string();

    let uri = format!("/agent/state?token={token}");
    let (status, body) = get(&harness.app, &uri, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "stub");

    harness.state.supervisor.dispose().await;
}

#[tokio::test]
async fn test_pairing_disabled_opens_routes() {
    let harness = test_app(false, ECHO_AGENT);

    let (_, body) = get(&harness.app, "/pair", None).await;
    assert_eq!(body["pairing_required"], false);
    assert!(body["pairing_code"].is_null());

    let (status, body) = get(&harness.app, "/agent/state", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["model"], "stub");

    let (status, body) =
        post_json(&harness.app, "/pair", &json!({ "code": "123456" }), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");

    harness.state.supervisor.dispose().await;
}

#[tokio::test]
async fn test_prompt_validation_before_agent() {
    let harness = test_app(false, ECHO_AGENT);

    let (status, body) =
        post_json(&harness.app, "/agent/prompt", &json!({ "message": "  " }), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "BAD_REQUEST");
    // The agent was never spawned for an invalid request.
    assert_eq!(harness.state.supervisor.health().await.restart_count, 0);

    let (status, _) =
        post_json(&harness.app, "/agent/prompt", &json!({ "message": "hi" }), None).await;
    assert_eq!(status, StatusCode::OK);

    harness.state.supervisor.dispose().await;
}

#[tokio::test]
async fn test_set_model_validation() {
    let harness = test_app(false, ECHO_AGENT);

    let (status, _) = post_json(
        &harness.app,
        "/agent/model",
        &json!({ "provider": "", "model_id": "m" }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = post_json(
        &harness.app,
        "/agent/model",
        &json!({ "provider": "anthropic", "model_id": "claude" }),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    harness.state.supervisor.dispose().await;
}
