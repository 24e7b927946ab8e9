// Proxy module - per-request orchestration of the translation pipeline

pub mod credentials;
pub mod error;
pub mod model_selector;
pub mod streaming;
pub mod translator;

use futures::stream::{BoxStream, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

use crate::api::gemini::{GeminiClient, UpstreamError};
use crate::api::openai::{
    ChatCompletionRequest, CompletionRequest, EmbeddingInput, EmbeddingRequest, ModelInfo,
    ModelsResponse,
};
use crate::config::{AppConfig, ModelsConfig};
use crate::store::{generate_conversation_id, ConversationStore, Message, Role, StoreError, StoreResult};

use credentials::{Credential, CredentialPool};
use error::ProxyError;
use model_selector::ModelSelector;
use streaming::{ChunkEncoder, CompletionHook};
use translator::ClientFormat;

/// Extra model advertised in the catalogue next to the tier models.
const LITE_MODEL: &str = "gemini-2.5-flash-lite";

/// Pipeline states, in order. A request stops at the first failing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    ResolveConversation,
    SelectModel,
    AcquireCredential,
    TranslateOutbound,
    CallUpstream,
    TranslateInbound,
    Persist,
    Respond,
}

/// Result of a chat or legacy completion request.
pub enum ChatReply {
    Complete {
        body: Value,
        conversation_id: String,
    },
    /// Client event payloads, ending with `[DONE]`.
    Stream {
        stream: BoxStream<'static, String>,
        conversation_id: String,
    },
}

impl ChatReply {
    pub fn conversation_id(&self) -> &str {
        match self {
            ChatReply::Complete { conversation_id, .. } => conversation_id,
            ChatReply::Stream { conversation_id, .. } => conversation_id,
        }
    }
}

pub struct ProxyManager {
    pool: CredentialPool,
    selector: ModelSelector,
    store: Arc<dyn ConversationStore>,
    client: GeminiClient,
    cooldown: Duration,
    persist_streamed_turns: bool,
    models: ModelsConfig,
}

impl ProxyManager {
    pub fn new(config: &AppConfig, store: Arc<dyn ConversationStore>) -> Result<Self, UpstreamError> {
        let client = GeminiClient::new(&config.gemini.base_url, config.gemini.request_timeout())?;
        let pool = CredentialPool::new(config.gemini.api_keys.iter().cloned());
        tracing::info!("Credential pool initialized with {} credentials", pool.len());

        Ok(Self {
            pool,
            selector: ModelSelector::from_config(&config.models),
            store,
            client,
            cooldown: config.gemini.quarantine(),
            persist_streamed_turns: config.store.persist_streamed_turns,
            models: config.models.clone(),
        })
    }

    pub fn pool(&self) -> &CredentialPool {
        &self.pool
    }

    pub fn selector(&self) -> &ModelSelector {
        &self.selector
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    // ===== Chat =====

    /// `POST /chat/completions`. `header_id` is the `X-Conversation-ID`
    /// header; a `conversation_id` in the body takes precedence.
    pub async fn chat(&self, body: &[u8], header_id: Option<&str>) -> Result<ChatReply, ProxyError> {
        let request: ChatCompletionRequest = serde_json::from_slice(body)
            .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
        self.run_chat(request, header_id, ClientFormat::Chat).await
    }

    /// `POST /completions`, mapped onto the chat pipeline.
    pub async fn completions(&self, body: &[u8], header_id: Option<&str>) -> Result<ChatReply, ProxyError> {
        let request: CompletionRequest = serde_json::from_slice(body)
            .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;

        let model = self
            .models
            .legacy
            .get(&request.model)
            .cloned()
            .unwrap_or_else(|| request.model.clone());
        if model != request.model {
            tracing::debug!("Legacy model {} mapped to {}", request.model, model);
        }

        self.run_chat(request.into_chat(model), header_id, ClientFormat::Completion)
            .await
    }

    async fn run_chat(
        &self,
        request: ChatCompletionRequest,
        header_id: Option<&str>,
        format: ClientFormat,
    ) -> Result<ChatReply, ProxyError> {
        // An empty body id falls back to the header.
        let requested_id = request
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .or(header_id.map(str::trim))
            .unwrap_or_default()
            .to_string();

        enter(Stage::ResolveConversation, &requested_id);
        let (conversation_id, history) = self.resolve_conversation(requested_id).await;

        // Rejected before a credential is involved, so it cannot be quarantined.
        let incoming: Vec<Message> = request.messages.iter().cloned().map(Message::from).collect();
        let assembled = translator::assemble_messages(&history, &incoming);
        translator::ensure_sendable(&assembled.outbound)?;

        enter(Stage::SelectModel, &conversation_id);
        let model = self
            .selector
            .select(&request.model, request.reasoning_effort.as_deref());

        enter(Stage::AcquireCredential, &conversation_id);
        let credential = self.pool.acquire().map_err(|e| {
            tracing::warn!("[{}] {:?} failed: {}", conversation_id, Stage::AcquireCredential, e);
            ProxyError::from(e)
        })?;

        enter(Stage::TranslateOutbound, &conversation_id);
        let payload = translator::to_upstream(&request, &assembled.outbound);

        enter(Stage::CallUpstream, &conversation_id);
        tracing::info!(
            "[{}] {} -> {} (stream: {}, credential {})",
            conversation_id,
            request.model,
            model,
            request.stream,
            credential
        );

        if request.stream {
            let response = self
                .client
                .stream_generate_content(&credential, &model, &payload)
                .await
                .map_err(|e| self.upstream_failed(&conversation_id, &credential, e))?;

            enter(Stage::TranslateInbound, &conversation_id);
            let hook = if self.persist_streamed_turns {
                Some(self.persist_hook(conversation_id.clone(), assembled.new_turns))
            } else {
                None
            };
            let encoder = ChunkEncoder::new(model, format);
            let stream = streaming::transcode(response.bytes_stream(), encoder, hook).boxed();

            enter(Stage::Respond, &conversation_id);
            return Ok(ChatReply::Stream {
                stream,
                conversation_id,
            });
        }

        let raw = self
            .client
            .generate_content(&credential, &model, &payload)
            .await
            .map_err(|e| self.upstream_failed(&conversation_id, &credential, e))?;

        enter(Stage::TranslateInbound, &conversation_id);
        let translated = translator::from_upstream(&raw, &model, format).map_err(|e| {
            tracing::warn!("[{}] {:?} failed: {}", conversation_id, Stage::TranslateInbound, e);
            e
        })?;

        enter(Stage::Persist, &conversation_id);
        self.persist(&conversation_id, assembled.new_turns, translated.text)
            .await;

        enter(Stage::Respond, &conversation_id);
        Ok(ChatReply::Complete {
            body: translated.body,
            conversation_id,
        })
    }

    /// Store failures are not fatal: the request continues with an empty history.
    async fn resolve_conversation(&self, requested_id: String) -> (String, Vec<Message>) {
        let store = self.store.clone();
        let lookup_id = requested_id.clone();
        let result = blocking(move || store.get(&lookup_id)).await;

        match result {
            Ok(conversation) => (conversation.id, conversation.messages),
            Err(e) => {
                let id = if requested_id.is_empty() {
                    generate_conversation_id()
                } else {
                    requested_id
                };
                tracing::warn!("[{}] Conversation lookup failed, continuing without history: {}", id, e);
                (id, Vec::new())
            }
        }
    }

    async fn persist(&self, conversation_id: &str, new_turns: Vec<Message>, reply: String) {
        let store = self.store.clone();
        let id = conversation_id.to_string();
        if let Err(e) = blocking(move || append_turns(store.as_ref(), &id, &new_turns, &reply)).await {
            tracing::warn!("[{}] Failed to persist turns: {}", conversation_id, e);
        }
    }

    fn persist_hook(&self, conversation_id: String, new_turns: Vec<Message>) -> CompletionHook {
        let store = self.store.clone();
        Box::new(move |reply: String| {
            tokio::task::spawn_blocking(move || {
                if let Err(e) = append_turns(store.as_ref(), &conversation_id, &new_turns, &reply) {
                    tracing::warn!("[{}] Failed to persist streamed turns: {}", conversation_id, e);
                }
            });
        })
    }

    fn upstream_failed(&self, conversation_id: &str, credential: &Credential, err: UpstreamError) -> ProxyError {
        tracing::warn!("[{}] {:?} failed: {}", conversation_id, Stage::CallUpstream, err);
        self.pool.quarantine(credential, self.cooldown);
        ProxyError::UpstreamFailure(err)
    }

    // ===== Embeddings =====

    /// `POST /embeddings`. A string input uses a single embed call, an
    /// array uses one batch call.
    pub async fn embeddings(&self, body: &[u8]) -> Result<Value, ProxyError> {
        let request: EmbeddingRequest = serde_json::from_slice(body)
            .map_err(|e| ProxyError::MalformedRequest(e.to_string()))?;
        if matches!(&request.input, EmbeddingInput::Many(items) if items.is_empty()) {
            return Err(ProxyError::MalformedRequest("input must not be empty".to_string()));
        }

        let model = self.embedding_model(&request.model).to_string();
        let credential = self.pool.acquire()?;
        tracing::info!("Embedding via {} (credential {})", model, credential);

        let (raw, batch) = match &request.input {
            EmbeddingInput::One(text) => (self.client.embed_content(&credential, &model, text).await, false),
            EmbeddingInput::Many(texts) => (
                self.client.batch_embed_contents(&credential, &model, texts).await,
                true,
            ),
        };
        let raw = raw.map_err(|e| self.upstream_failed("embeddings", &credential, e))?;

        translator::embeddings_from_upstream(&raw, batch, &model)
    }

    /// OpenAI embedding model names map to the configured Gemini embedding model.
    pub fn embedding_model<'a>(&'a self, requested: &'a str) -> &'a str {
        if requested == "text-embedding-ada-002" || requested.starts_with("text-embedding-3-") {
            &self.models.embedding
        } else {
            requested
        }
    }

    // ===== Models =====

    pub fn list_models(&self) -> ModelsResponse {
        let created = chrono::Utc::now().timestamp();
        let mut data = vec![ModelInfo {
            id: self.selector.alias().to_string(),
            object: "model".to_string(),
            created,
            owned_by: "vertigo".to_string(),
        }];

        let mut upstream_models = self.selector.tier_models();
        if !upstream_models.contains(&LITE_MODEL) {
            upstream_models.push(LITE_MODEL);
        }
        for id in upstream_models {
            if data.iter().any(|m| m.id == id) {
                continue;
            }
            data.push(ModelInfo {
                id: id.to_string(),
                object: "model".to_string(),
                created,
                owned_by: "google".to_string(),
            });
        }

        ModelsResponse {
            object: "list".to_string(),
            data,
        }
    }

    pub fn get_model(&self, id: &str) -> Option<ModelInfo> {
        self.list_models().data.into_iter().find(|m| m.id == id)
    }

    // ===== Conversations =====

    pub async fn delete_conversation(&self, id: &str) -> Result<bool, ProxyError> {
        let store = self.store.clone();
        let id = id.to_string();
        Ok(blocking(move || store.delete(&id)).await?)
    }
}

fn enter(stage: Stage, conversation_id: &str) {
    tracing::debug!("[{}] {:?}", conversation_id, stage);
}

/// Store backends are synchronous; keep them off the async workers.
async fn blocking<T, F>(f: F) -> StoreResult<T>
where
    F: FnOnce() -> StoreResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(StoreError::from)?
}

/// Append the new client turns, then the assistant reply.
fn append_turns(
    store: &dyn ConversationStore,
    conversation_id: &str,
    new_turns: &[Message],
    reply: &str,
) -> StoreResult<()> {
    for turn in new_turns {
        store.append(conversation_id, turn.role, &turn.content)?;
    }
    store.append(conversation_id, Role::Assistant, reply)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager(models: ModelsConfig) -> ProxyManager {
        let mut config = AppConfig::default();
        config.gemini.api_keys = vec!["only-key".to_string()];
        config.gemini.base_url = "http://127.0.0.1:9".to_string();
        config.models = models;
        ProxyManager::new(&config, Arc::new(MemoryStore::new())).unwrap()
    }

    #[test]
    fn test_catalogue_contents() {
        let manager = manager(ModelsConfig::default());
        let models = manager.list_models();
        let ids: Vec<&str> = models.data.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "vertigo-1.0-blast",
                "gemini-2.0-flash",
                "gemini-2.5-flash",
                "gemini-2.5-pro",
                "gemini-2.5-flash-lite"
            ]
        );
        assert_eq!(models.data[0].owned_by, "vertigo");
        assert_eq!(models.data[1].owned_by, "google");
        assert!(manager.get_model("gemini-2.5-pro").is_some());
        assert!(manager.get_model("gpt-4").is_none());
    }

    #[test]
    fn test_catalogue_dedupes_lite_tier() {
        let manager = manager(ModelsConfig {
            fast: LITE_MODEL.to_string(),
            ..ModelsConfig::default()
        });
        let count = manager
            .list_models()
            .data
            .iter()
            .filter(|m| m.id == LITE_MODEL)
            .count();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_embedding_model_mapping() {
        let manager = manager(ModelsConfig::default());
        assert_eq!(manager.embedding_model("text-embedding-ada-002"), "text-embedding-004");
        assert_eq!(manager.embedding_model("text-embedding-3-small"), "text-embedding-004");
        assert_eq!(manager.embedding_model("gemini-embedding-001"), "gemini-embedding-001");
    }

    #[tokio::test]
    async fn test_malformed_body_never_touches_pool() {
        let manager = manager(ModelsConfig::default());
        let result = manager.chat(b"{not json", None).await;
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));

        let result = manager.chat(br#"{"model":"m"}"#, None).await;
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));

        let result = manager.embeddings(br#"{"model":"m","input":[]}"#).await;
        assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));

        assert!(manager.pool().status().iter().all(|s| s.quarantined_until.is_none()));
    }

    #[tokio::test]
    async fn test_empty_conversation_rejected_before_credential_use() {
        let mut config = AppConfig::default();
        config.gemini.api_keys = vec!["k1".to_string(), "k2".to_string()];
        config.gemini.base_url = "http://127.0.0.1:9".to_string();
        let manager = ProxyManager::new(&config, Arc::new(MemoryStore::new())).unwrap();

        let bodies: [&[u8]; 3] = [
            br#"{"model":"gemini-2.5-flash","messages":[]}"#,
            br#"{"model":"gemini-2.5-flash","messages":[{"role":"system","content":"  "}]}"#,
            br#"{"model":"vertigo-1.0-blast","messages":[{"role":"assistant","content":null}]}"#,
        ];
        for _ in 0..3 {
            for body in bodies {
                let result = manager.chat(body, Some("conv-empty")).await;
                assert!(matches!(result, Err(ProxyError::MalformedRequest(_))));
            }
        }

        assert!(manager.pool().status().iter().all(|s| s.quarantined_until.is_none()));
        assert!(manager.pool().acquire().is_ok());
    }

    #[tokio::test]
    async fn test_exhausted_pool_fails_without_upstream_call() {
        let manager = manager(ModelsConfig::default());
        let credential = manager.pool().acquire().unwrap();
        manager.pool().quarantine(&credential, Duration::from_secs(60));

        let body = br#"{"model":"vertigo-1.0-blast","messages":[{"role":"user","content":"hi"}]}"#;
        let result = manager.chat(body, Some("conv-1")).await;
        assert!(matches!(result, Err(ProxyError::NoCredentialAvailable)));
        assert!(manager.store().get("conv-1").unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_upstream_quarantines_credential() {
        let manager = manager(ModelsConfig::default());
        let body = br#"{"model":"gemini-2.5-flash","messages":[{"role":"user","content":"hi"}]}"#;

        let result = manager.chat(body, Some("conv-2")).await;
        assert!(matches!(result, Err(ProxyError::UpstreamFailure(_))));

        let credential = Credential::new("only-key");
        assert!(manager.pool().is_quarantined(&credential));
        assert!(manager.store().get("conv-2").unwrap().messages.is_empty());
    }

    #[tokio::test]
    async fn test_delete_conversation() {
        let manager = manager(ModelsConfig::default());
        manager.store().append("gone", Role::User, "x").unwrap();
        assert!(manager.delete_conversation("gone").await.unwrap());
        assert!(!manager.delete_conversation("gone").await.unwrap());
    }

    #[test]
    fn test_append_turns_order() {
        let store = MemoryStore::new();
        let turns = vec![
            Message::new(Role::System, "s"),
            Message::new(Role::User, "u"),
        ];
        append_turns(&store, "c", &turns, "a").unwrap();
        let roles: Vec<Role> = store.get("c").unwrap().messages.iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::System, Role::User, Role::Assistant]);
    }
}
