// Request/Response translator between OpenAI and Gemini formats

use serde_json::{json, Value};

use super::error::ProxyError;
use crate::api::gemini::{
    BatchEmbedContentsResponse, EmbedContentResponse, GeminiContent, GeminiGenerationConfig,
    GeminiPart, GenerateContentRequest, GenerateContentResponse,
};
use crate::api::openai::{ChatCompletionRequest, Usage};
use crate::store::{Message, Role};

/// Which client schema a response is encoded in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientFormat {
    /// `chat.completion` / `chat.completion.chunk`
    Chat,
    /// Legacy `text_completion`
    Completion,
}

impl ClientFormat {
    pub fn new_response_id(&self) -> String {
        let id = uuid::Uuid::new_v4().simple().to_string();
        match self {
            ClientFormat::Chat => format!("chatcmpl-{}", id),
            ClientFormat::Completion => format!("cmpl-{}", id),
        }
    }
}

/// Outbound message list plus the turns that become history on success.
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledMessages {
    pub outbound: Vec<Message>,
    pub new_turns: Vec<Message>,
}

/// Merge stored history with what the client sent.
///
/// An empty history is seeded with the full client message list. Otherwise
/// the stored history supersedes the client's copy and only the newly
/// arrived user turn (the last client message) is appended to it.
pub fn assemble_messages(history: &[Message], incoming: &[Message]) -> AssembledMessages {
    if history.is_empty() {
        return AssembledMessages {
            outbound: incoming.to_vec(),
            new_turns: incoming.to_vec(),
        };
    }

    let new_turns: Vec<Message> = incoming
        .last()
        .filter(|m| m.role == Role::User)
        .cloned()
        .into_iter()
        .collect();

    let mut outbound = history.to_vec();
    outbound.extend(new_turns.iter().cloned());

    AssembledMessages {
        outbound,
        new_turns,
    }
}

/// Gemini rejects a request without any text to answer. A conversation
/// with no usable content is refused instead of being sent.
pub fn ensure_sendable(messages: &[Message]) -> Result<(), ProxyError> {
    if messages.iter().any(|m| !m.content.trim().is_empty()) {
        Ok(())
    } else {
        Err(ProxyError::MalformedRequest(
            "messages must contain at least one non-empty message".to_string(),
        ))
    }
}

/// Build the native generate request. `request.model` and the effort hint
/// are not part of the body: the model travels in the URL path.
pub fn to_upstream(request: &ChatCompletionRequest, messages: &[Message]) -> GenerateContentRequest {
    let has_turns = messages.iter().any(|m| m.role != Role::System);

    let mut contents = Vec::with_capacity(messages.len());
    let mut system_parts = Vec::new();

    for msg in messages {
        match msg.role {
            Role::System if has_turns => system_parts.push(GeminiPart {
                text: msg.content.clone(),
            }),
            // A lone system prompt still has to be sent as a turn.
            Role::System | Role::User => {
                contents.push(GeminiContent::text(Some("user"), msg.content.clone()))
            }
            Role::Assistant => {
                contents.push(GeminiContent::text(Some("model"), msg.content.clone()))
            }
        }
    }

    let system_instruction = if system_parts.is_empty() {
        None
    } else {
        Some(GeminiContent {
            role: None,
            parts: system_parts,
        })
    };

    let generation_config = GeminiGenerationConfig {
        temperature: request.temperature,
        max_output_tokens: request.output_token_limit(),
        top_p: request.top_p,
        stop_sequences: request.stop.clone().map(|s| s.into_vec()),
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: if generation_config.is_empty() {
            None
        } else {
            Some(generation_config)
        },
    }
}

/// Completion tokens are derived as `total - prompt`, clamped at zero.
pub fn derive_usage(prompt_tokens: u64, total_tokens: u64) -> Usage {
    Usage {
        prompt_tokens,
        completion_tokens: total_tokens.saturating_sub(prompt_tokens),
        total_tokens,
    }
}

#[derive(Debug, Clone)]
pub struct TranslatedResponse {
    /// Client-format body, ready to send.
    pub body: Value,
    /// Assistant text, for the conversation history.
    pub text: String,
}

/// Convert a successful non-streaming upstream body into the client format.
pub fn from_upstream(
    raw: &[u8],
    model: &str,
    format: ClientFormat,
) -> Result<TranslatedResponse, ProxyError> {
    let response: GenerateContentResponse = serde_json::from_slice(raw).map_err(|e| {
        tracing::debug!(
            "Untranslatable Gemini response: {}",
            String::from_utf8_lossy(raw)
        );
        ProxyError::TranslationFailure(e.to_string())
    })?;

    let text = response
        .candidates
        .first()
        .map(|c| c.text())
        .unwrap_or_default();

    let usage = response
        .usage_metadata
        .as_ref()
        .map(|u| derive_usage(u.prompt_token_count, u.total_token_count))
        .unwrap_or_default();

    let body = encode_response(&format.new_response_id(), model, &text, usage, format);
    Ok(TranslatedResponse { body, text })
}

fn encode_response(id: &str, model: &str, text: &str, usage: Usage, format: ClientFormat) -> Value {
    let created = chrono::Utc::now().timestamp();
    match format {
        ClientFormat::Chat => json!({
            "id": id,
            "object": "chat.completion",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "message": {
                    "role": "assistant",
                    "content": text
                },
                "finish_reason": "stop"
            }],
            "usage": usage
        }),
        ClientFormat::Completion => json!({
            "id": id,
            "object": "text_completion",
            "created": created,
            "model": model,
            "choices": [{
                "text": text,
                "index": 0,
                "logprobs": null,
                "finish_reason": "stop"
            }],
            "usage": usage
        }),
    }
}

/// Convert an embed (single) or batchEmbed (multiple) response to the client list format.
pub fn embeddings_from_upstream(raw: &[u8], batch: bool, model: &str) -> Result<Value, ProxyError> {
    let parse_failure = |e: serde_json::Error| {
        tracing::debug!(
            "Untranslatable Gemini embedding response: {}",
            String::from_utf8_lossy(raw)
        );
        ProxyError::TranslationFailure(e.to_string())
    };

    let vectors: Vec<Vec<f32>> = if batch {
        let parsed: BatchEmbedContentsResponse = serde_json::from_slice(raw).map_err(parse_failure)?;
        parsed.embeddings.into_iter().map(|e| e.values).collect()
    } else {
        let parsed: EmbedContentResponse = serde_json::from_slice(raw).map_err(parse_failure)?;
        vec![parsed.embedding.values]
    };

    let data: Vec<Value> = vectors
        .into_iter()
        .enumerate()
        .map(|(index, embedding)| {
            json!({
                "object": "embedding",
                "embedding": embedding,
                "index": index
            })
        })
        .collect();

    // Gemini does not report token usage for embeddings.
    Ok(json!({
        "object": "list",
        "data": data,
        "model": model,
        "usage": {
            "prompt_tokens": 0,
            "total_tokens": 0
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::openai::StopSequences;

    fn chat_request(extra: Value) -> ChatCompletionRequest {
        let mut body = json!({
            "model": "gemini-2.5-flash",
            "messages": [{ "role": "user", "content": "hi" }]
        });
        if let (Some(obj), Some(extra)) = (body.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                obj.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(body).unwrap()
    }

    #[test]
    fn test_assemble_seeds_empty_history() {
        let incoming = vec![
            Message::new(Role::System, "be brief"),
            Message::new(Role::User, "hi"),
        ];
        let assembled = assemble_messages(&[], &incoming);
        assert_eq!(assembled.outbound, incoming);
        assert_eq!(assembled.new_turns, incoming);
    }

    #[test]
    fn test_assemble_history_supersedes_client_copy() {
        let history = vec![
            Message::new(Role::User, "first"),
            Message::new(Role::Assistant, "answer"),
        ];
        let incoming = vec![
            Message::new(Role::User, "stale client copy"),
            Message::new(Role::User, "second"),
        ];
        let assembled = assemble_messages(&history, &incoming);
        assert_eq!(
            assembled.outbound,
            vec![
                Message::new(Role::User, "first"),
                Message::new(Role::Assistant, "answer"),
                Message::new(Role::User, "second"),
            ]
        );
        assert_eq!(assembled.new_turns, vec![Message::new(Role::User, "second")]);
    }

    #[test]
    fn test_assemble_does_not_dedupe() {
        let history = vec![Message::new(Role::User, "same")];
        let incoming = vec![Message::new(Role::User, "same")];
        let assembled = assemble_messages(&history, &incoming);
        assert_eq!(assembled.outbound.len(), 2);
    }

    #[test]
    fn test_ensure_sendable() {
        assert!(matches!(ensure_sendable(&[]), Err(ProxyError::MalformedRequest(_))));
        assert!(ensure_sendable(&[Message::new(Role::System, " \n")]).is_err());
        assert!(ensure_sendable(&[Message::new(Role::Assistant, "")]).is_err());
        assert!(ensure_sendable(&[Message::new(Role::System, "rules")]).is_ok());
        assert!(ensure_sendable(&[
            Message::new(Role::User, ""),
            Message::new(Role::Assistant, "earlier answer"),
        ])
        .is_ok());
    }

    #[test]
    fn test_to_upstream_roles_and_order() {
        let request = chat_request(json!({}));
        let messages = vec![
            Message::new(Role::System, "rules"),
            Message::new(Role::User, "q1"),
            Message::new(Role::Assistant, "a1"),
            Message::new(Role::User, "q2"),
        ];
        let upstream = to_upstream(&request, &messages);

        let roles: Vec<&str> = upstream
            .contents
            .iter()
            .map(|c| c.role.as_deref().unwrap_or(""))
            .collect();
        assert_eq!(roles, vec!["user", "model", "user"]);
        assert_eq!(upstream.contents[2].parts[0].text, "q2");
        assert_eq!(upstream.system_instruction.unwrap().parts[0].text, "rules");
        assert!(upstream.generation_config.is_none());
    }

    #[test]
    fn test_lone_system_message_sent_as_user_turn() {
        let request = chat_request(json!({}));
        let upstream = to_upstream(&request, &[Message::new(Role::System, "only")]);
        assert!(upstream.system_instruction.is_none());
        assert_eq!(upstream.contents[0].role.as_deref(), Some("user"));
    }

    #[test]
    fn test_generation_params_mapped_and_absent_omitted() {
        let request = chat_request(json!({
            "temperature": 0.3,
            "max_tokens": 128,
            "stop": "END",
            "reasoning_effort": "high"
        }));
        let upstream = to_upstream(&request, &[Message::new(Role::User, "hi")]);
        let body = serde_json::to_value(&upstream).unwrap();

        assert_eq!(
            body["generationConfig"],
            json!({ "temperature": 0.3, "maxOutputTokens": 128, "stopSequences": ["END"] })
        );
        assert!(body.get("reasoning_effort").is_none());
        assert!(body.get("model").is_none());
        assert!(body["generationConfig"].get("topP").is_none());
    }

    #[test]
    fn test_max_completion_tokens_preferred() {
        let mut request = chat_request(json!({ "max_tokens": 10, "max_completion_tokens": 20 }));
        request.stop = Some(StopSequences::Many(vec!["a".into(), "b".into()]));
        let upstream = to_upstream(&request, &[Message::new(Role::User, "hi")]);
        let config = upstream.generation_config.unwrap();
        assert_eq!(config.max_output_tokens, Some(20));
        assert_eq!(config.stop_sequences, Some(vec!["a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_from_upstream_chat() {
        let raw = json!({
            "candidates": [{ "content": { "parts": [{ "text": "Hi there" }], "role": "model" } }],
            "usageMetadata": { "promptTokenCount": 10, "totalTokenCount": 15 }
        })
        .to_string();

        let translated = from_upstream(raw.as_bytes(), "gemini-2.5-pro", ClientFormat::Chat).unwrap();
        let body = translated.body;
        assert_eq!(translated.text, "Hi there");
        assert_eq!(body["object"], "chat.completion");
        assert_eq!(body["model"], "gemini-2.5-pro");
        assert!(body["id"].as_str().unwrap().starts_with("chatcmpl-"));
        assert_eq!(body["choices"].as_array().unwrap().len(), 1);
        assert_eq!(body["choices"][0]["message"]["content"], "Hi there");
        assert_eq!(body["choices"][0]["finish_reason"], "stop");
        assert_eq!(
            body["usage"],
            json!({ "prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15 })
        );
    }

    #[test]
    fn test_from_upstream_completion_format() {
        let raw = json!({ "candidates": [{ "content": { "parts": [{ "text": "done" }] } }] }).to_string();
        let body = from_upstream(raw.as_bytes(), "m", ClientFormat::Completion).unwrap().body;
        assert_eq!(body["object"], "text_completion");
        assert_eq!(body["choices"][0]["text"], "done");
        assert!(body["choices"][0]["logprobs"].is_null());
        assert!(body["id"].as_str().unwrap().starts_with("cmpl-"));
    }

    #[test]
    fn test_from_upstream_without_candidates() {
        let translated = from_upstream(b"{}", "m", ClientFormat::Chat).unwrap();
        assert_eq!(translated.text, "");
        assert_eq!(translated.body["choices"][0]["message"]["content"], "");
        assert_eq!(translated.body["usage"]["total_tokens"], 0);
    }

    #[test]
    fn test_from_upstream_bad_shape_is_translation_failure() {
        let result = from_upstream(b"{\"candidates\": 7}", "m", ClientFormat::Chat);
        assert!(matches!(result, Err(ProxyError::TranslationFailure(_))));
        let result = from_upstream(b"not json", "m", ClientFormat::Chat);
        assert!(matches!(result, Err(ProxyError::TranslationFailure(_))));
    }

    #[test]
    fn test_usage_never_negative() {
        assert_eq!(derive_usage(10, 15).completion_tokens, 5);
        assert_eq!(derive_usage(20, 15).completion_tokens, 0);
        assert_eq!(derive_usage(0, 0), Usage::default());
    }

    #[test]
    fn test_embeddings_single_and_batch() {
        let single = json!({ "embedding": { "values": [0.1, 0.2] } }).to_string();
        let body = embeddings_from_upstream(single.as_bytes(), false, "text-embedding-ada-002").unwrap();
        assert_eq!(body["object"], "list");
        assert_eq!(body["model"], "text-embedding-ada-002");
        assert_eq!(body["data"][0]["index"], 0);
        assert_eq!(body["data"][0]["embedding"].as_array().unwrap().len(), 2);

        let batch = json!({ "embeddings": [{ "values": [1.0] }, { "values": [2.0] }] }).to_string();
        let body = embeddings_from_upstream(batch.as_bytes(), true, "m").unwrap();
        assert_eq!(body["data"][1]["index"], 1);
        assert_eq!(body["data"][1]["embedding"][0], 2.0);
    }
}
