//! Shared helpers for integration tests.
//!
//! The agent process is stood in for by small `/bin/sh` scripts speaking
//! the newline-delimited JSON protocol on stdio.

use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use tetherd::agent::{AgentSupervisor, SupervisorConfig};
use tetherd::api::{AppState, create_router};
use tetherd::pairing::{PairingGuard, TokenStore};

/// Answers every request with a successful response echoing the request id.
pub const ECHO_AGENT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  printf '{"id":"%s","type":"response","success":true,"data":{"model":"stub"}}\n' "$id"
done
"#;

/// Answers every request with an explicit failure.
pub const FAILING_AGENT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  printf '{"id":"%s","type":"response","success":false,"error":"boom"}\n' "$id"
done
"#;

/// Stays alive but never responds.
pub const SILENT_AGENT: &str = r#"
while IFS= read -r line; do :; done
"#;

/// Reads one request, then dies without answering.
pub const ONE_SHOT_EXIT_AGENT: &str = r#"
IFS= read -r line
exit 7
"#;

/// Emits two chatter events before every response.
pub const CHATTY_AGENT: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s\n' "$line" | sed -n 's/^{"id":"\([^"]*\)".*/\1/p')
  printf '{"type":"chatter","data":{"n":1}}\n'
  printf '{"type":"chatter","data":{"n":2}}\n'
  printf '{"id":"%s","type":"response","success":true,"data":{"ok":true}}\n' "$id"
done
"#;

/// Prints one event, one malformed line, and one stderr line at startup.
pub const NOISY_AGENT: &str = r#"
printf '{"type":"warmup","data":{"step":1}}\n'
printf 'not json\n'
echo 'oops from stderr' 1>&2
while IFS= read -r line; do :; done
"#;

/// Supervisor wired to a `/bin/sh` stub agent with test-friendly timings.
pub fn stub_supervisor(script: &str) -> AgentSupervisor {
    AgentSupervisor::new(SupervisorConfig {
        binary: "/bin/sh".into(),
        args: vec!["-c".to_string(), script.to_string()],
        workdir: None,
        call_timeout: Duration::from_secs(5),
        backoff_cap: Duration::from_secs(30),
        kill_grace: Duration::from_millis(200),
    })
}

pub struct TestApp {
    pub app: Router,
    pub state: AppState,
    _store_dir: TempDir,
}

/// Build an app over a stub agent with a tempdir-backed token store.
pub fn test_app(pairing_required: bool, script: &str) -> TestApp {
    let store_dir = TempDir::new().expect("tempdir");
    let store = TokenStore::new(store_dir.path().join("tokens.json"));
    let state = AppState::new(
        stub_supervisor(script),
        PairingGuard::new(pairing_required, store),
    );
    TestApp {
        app: create_router(state.clone()),
        state,
        _store_dir: store_dir,
    }
}

pub async fn get(app: &Router, uri: &str, token: Option<&str>) -> (StatusCode, Value) {
    let mut builder = Request::builder().uri(uri).method(Method::GET);
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    send(app, builder.body(Body::empty()).unwrap()).await
}

pub async fn post_json(
    app: &Router,
    uri: &str,
    body: &Value,
    token: Option<&str>,
) -> (StatusCode, Value) {
    let mut builder = Request::builder()
        .uri(uri)
        .method(Method::POST)
        .header(header::CONTENT_TYPE, "application/json");
    if let Some(token) = token {
        builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = builder
        .body(Body::from(serde_json::to_string(body).unwrap()))
        .unwrap();
    send(app, request).await
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, json)
}
