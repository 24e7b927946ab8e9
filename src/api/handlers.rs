// API request handlers

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, HeaderName, HeaderValue},
    response::{sse::Sse, IntoResponse, Json, Response},
};
use serde_json::{json, Value};

use super::error::ApiError;
use super::AppState;
use crate::api::openai::{ModelInfo, ModelsResponse};
use crate::proxy::streaming;
use crate::proxy::ChatReply;

pub const CONVERSATION_HEADER: &str = "x-conversation-id";

// Root endpoint
pub async fn root() -> Json<Value> {
    Json(json!({
        "message": "Vertigo - OpenAI-compatible proxy for Gemini",
        "endpoints": [
            "POST /v1/chat/completions",
            "POST /v1/completions",
            "POST /v1/embeddings",
            "GET /v1/models",
            "GET /v1/models/{id}",
            "DELETE /v1/conversations/{id}"
        ]
    }))
}

pub async fn list_models(State(state): State<AppState>) -> Json<ModelsResponse> {
    Json(state.proxy.list_models())
}

pub async fn get_model(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ModelInfo>, ApiError> {
    state
        .proxy
        .get_model(&id)
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("The model '{}' does not exist", id)))
}

pub async fn chat_completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let reply = state.proxy.chat(&body, conversation_header(&headers)).await?;
    Ok(reply_response(reply))
}

pub async fn completions(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let reply = state
        .proxy
        .completions(&body, conversation_header(&headers))
        .await?;
    Ok(reply_response(reply))
}

pub async fn embeddings(State(state): State<AppState>, body: Bytes) -> Result<Json<Value>, ApiError> {
    Ok(Json(state.proxy.embeddings(&body).await?))
}

pub async fn delete_conversation(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    if state.proxy.delete_conversation(&id).await? {
        Ok(Json(json!({ "id": id, "object": "conversation", "deleted": true })).into_response())
    } else {
        Err(ApiError::NotFound(format!("Conversation '{}' does not exist", id)))
    }
}

fn conversation_header(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(CONVERSATION_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.trim().is_empty())
}

fn reply_response(reply: ChatReply) -> Response {
    let conversation_id = reply.conversation_id().to_string();
    let mut response = match reply {
        ChatReply::Complete { body, .. } => Json(body).into_response(),
        ChatReply::Stream { stream, .. } => Sse::new(streaming::into_events(stream)).into_response(),
    };

    match HeaderValue::from_str(&conversation_id) {
        Ok(value) => {
            response
                .headers_mut()
                .insert(HeaderName::from_static(CONVERSATION_HEADER), value);
        }
        Err(_) => tracing::warn!("Conversation id {:?} is not a valid header value", conversation_id),
    }
    response
}
