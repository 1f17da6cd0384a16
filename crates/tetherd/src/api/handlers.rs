//! Request handlers for the bridge surface.
//!
//! Each authenticated agent route maps 1:1 onto one supervisor call;
//! parameter validation happens here, before the agent is reached.

use axum::{Json, extract::State};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use super::auth::ClientIdentity;
use super::error::{ApiError, ApiResult};
use super::state::AppState;
use crate::agent::AgentHealth;
use crate::pairing::PairingStatus;

// ============================================================================
// Public routes
// ============================================================================

/// GET /health — always available, unauthenticated by design.
pub async fn health(State(state): State<AppState>) -> Json<AgentHealth> {
    Json(state.supervisor.health().await)
}

/// GET /pair
pub async fn pairing_status(State(state): State<AppState>) -> Json<PairingStatus> {
    Json(state.pairing.status().await)
}

#[derive(Debug, Deserialize)]
pub struct PairRequest {
    pub code: String,
}

/// POST /pair — exchange the pairing code for a bearer token.
pub async fn pair(
    State(state): State<AppState>,
    ClientIdentity(client): ClientIdentity,
    Json(request): Json<PairRequest>,
) -> ApiResult<Json<Value>> {
    let token = state.pairing.try_pair(&request.code, &client).await?;
    Ok(Json(json!({ "token": token })))
}

// ============================================================================
// Authenticated agent routes
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct PromptRequest {
    pub message: String,
}

/// POST /agent/prompt
pub async fn agent_prompt(
    State(state): State<AppState>,
    Json(request): Json<PromptRequest>,
) -> ApiResult<Json<Value>> {
    let message = request.message.trim();
    if message.is_empty() {
        return Err(ApiError::bad_request("message must not be empty"));
    }

    let mut params = Map::new();
    params.insert("message".to_string(), json!(message));
    let data = state.supervisor.call("prompt", params, None).await?;
    Ok(Json(data))
}

/// POST /agent/abort
pub async fn agent_abort(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let data = state.supervisor.call("abort", Map::new(), None).await?;
    Ok(Json(data))
}

/// GET /agent/state
pub async fn agent_state(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let data = state.supervisor.call("get_state", Map::new(), None).await?;
    Ok(Json(data))
}

/// GET /agent/messages
pub async fn agent_messages(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let data = state
        .supervisor
        .call("get_messages", Map::new(), None)
        .await?;
    Ok(Json(data))
}

#[derive(Debug, Deserialize)]
pub struct SetModelRequest {
    pub provider: String,
    pub model_id: String,
}

/// POST /agent/model
pub async fn agent_set_model(
    State(state): State<AppState>,
    Json(request): Json<SetModelRequest>,
) -> ApiResult<Json<Value>> {
    if request.provider.trim().is_empty() || request.model_id.trim().is_empty() {
        return Err(ApiError::bad_request("provider and model_id are required"));
    }

    let mut params = Map::new();
    params.insert("provider".to_string(), json!(request.provider));
    params.insert("model_id".to_string(), json!(request.model_id));
    let data = state.supervisor.call("set_model", params, None).await?;
    Ok(Json(data))
}

/// GET /agent/models
pub async fn agent_models(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let data = state
        .supervisor
        .call("get_available_models", Map::new(), None)
        .await?;
    Ok(Json(data))
}

/// POST /agent/session/new
pub async fn agent_new_session(State(state): State<AppState>) -> ApiResult<Json<Value>> {
    let data = state
        .supervisor
        .call("new_session", Map::new(), None)
        .await?;
    Ok(Json(data))
}
