//! Conversation engine
//!
//! Turn-by-turn chat state over the cache, retrieval-augmented prompt
//! construction, and the LLM back end in both synchronous and streaming
//! form. When no LLM credentials are configured a canned reply is
//! synthesized, streamed word-by-word so the UI behaves identically.

use crate::cache::{self, Cache};
use crate::config::SharedConfig;
use crate::db::Repository;
use crate::errors::{AppError, Result};
use crate::services::search::SearchService;
use crate::vector::ScoredChunk;
use async_stream::try_stream;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const SYSTEM_PROMPT: &str = "你是一个有帮助的AI助手。";
const RAG_PROMPT: &str = "请基于以下检索到的文档内容回答用户的问题：";
const FALLBACK_NO_MODEL: &str = "抱歉，AI模型未配置。请在环境变量中设置OPENAI_API_KEY。";
const FALLBACK_RAG_PREFIX: &str = "基于检索到的文档内容，这是我的回答：";
const FALLBACK_RAG_SUFFIX: &str = "（注：这是模拟回复，请配置OpenAI API以获得真实的AI回答）";

/// RAG context stops growing once it passes this many bytes
const MAX_CONTEXT_LEN: usize = 3000;

/// The canned reply quotes at most this much of the context
const MAX_KEY_POINTS_LEN: usize = 1500;

/// Conversation history sent to the model is capped at this many messages
const HISTORY_WINDOW: usize = 10;

/// Chat history titles keep this many characters of the first message
const TITLE_LEN: usize = 50;

/// Pace of the fallback token stream
const FALLBACK_WORD_DELAY: Duration = Duration::from_millis(100);

/// One message within a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// user or assistant
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn assistant(content: &str) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// An in-flight conversation; the cache is authoritative for these
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub user_id: i64,
    pub messages: Vec<ChatMessage>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    fn new(id: String, user_id: i64) -> Self {
        let now = Utc::now();
        Self {
            id,
            user_id,
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }
}

/// Message shape sent to the LLM back end
#[derive(Debug, Clone, Serialize)]
pub struct LlmMessage {
    pub role: String,
    pub content: String,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatCompletionChoice>,
}

#[derive(Deserialize)]
struct ChatCompletionChoice {
    message: ChatCompletionMessage,
}

#[derive(Deserialize)]
struct ChatCompletionMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Deserialize, Default)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize, Default)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// Client for an OpenAI-compatible chat completions endpoint
pub struct LlmClient {
    http: reqwest::Client,
    chat_url: String,
    api_key: String,
    model: String,
}

impl LlmClient {
    /// Build the client when an API key is configured
    pub fn from_config(config: &crate::config::AppConfig) -> Option<Self> {
        if config.openai_api_key.is_empty() {
            return None;
        }

        let base = if config.openai_base_url.is_empty() {
            "https://api.openai.com/v1"
        } else {
            config.openai_base_url.trim_end_matches('/')
        };

        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .ok()?;

        Some(Self {
            http,
            chat_url: format!("{base}/chat/completions"),
            api_key: config.openai_api_key.clone(),
            model: config.openai_model.clone(),
        })
    }

    /// Synchronous completion
    pub async fn generate(&self, messages: &[LlmMessage]) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
        });

        let request = self
            .http
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send();

        let response = tokio::time::timeout(Duration::from_secs(60), request)
            .await
            .map_err(|_| AppError::Internal("model request timed out".to_string()))?
            .map_err(|e| AppError::Internal(format!("model request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(AppError::Internal(format!("model returned {status}")));
        }

        let completion: ChatCompletionResponse = response
            .json()
            .await
            .map_err(|e| AppError::Internal(format!("bad model response: {e}")))?;

        let content = completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .unwrap_or_default();

        if content.is_empty() {
            return Err(AppError::Internal("empty response from model".to_string()));
        }

        Ok(content)
    }

    /// Streaming completion; yields content deltas as they arrive
    pub fn stream(&self, messages: Vec<LlmMessage>) -> BoxStream<'static, Result<String>> {
        let http = self.http.clone();
        let chat_url = self.chat_url.clone();
        let api_key = self.api_key.clone();
        let model = self.model.clone();

        let stream = try_stream! {
            let body = serde_json::json!({
                "model": model,
                "messages": messages,
                "stream": true,
            });

            let response = http
                .post(&chat_url)
                .bearer_auth(&api_key)
                .json(&body)
                .send()
                .await
                .map_err(|e| AppError::Internal(format!("model request failed: {e}")))?;

            if !response.status().is_success() {
                let status = response.status();
                Err(AppError::Internal(format!("model returned {status}")))?;
            }

            let mut body = response.bytes_stream();
            let mut buffer = String::new();
            let mut done = false;

            while let Some(chunk) = body.next().await {
                let chunk = chunk
                    .map_err(|e| AppError::Internal(format!("model stream error: {e}")))?;
                buffer.push_str(&String::from_utf8_lossy(&chunk));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data.is_empty() {
                        continue;
                    }
                    if data == "[DONE]" {
                        done = true;
                        break;
                    }

                    let parsed: StreamChunk = serde_json::from_str(data)
                        .map_err(|e| AppError::Internal(format!("bad stream payload: {e}")))?;

                    for choice in parsed.choices {
                        if let Some(content) = choice.delta.content {
                            if !content.is_empty() {
                                yield content;
                            }
                        }
                    }
                }

                if done {
                    break;
                }
            }
        };

        Box::pin(stream)
    }
}

/// Build the RAG context string from retrieved chunks, capped in size
pub fn build_rag_context(docs: &[ScoredChunk]) -> String {
    let mut context = String::new();

    for (i, doc) in docs.iter().enumerate() {
        context.push_str(&format!("文档 {}:\n", i + 1));
        context.push_str(&doc.content);
        context.push_str("\n\n");

        if context.len() > MAX_CONTEXT_LEN {
            break;
        }
    }

    context.trim().to_string()
}

/// System preamble plus the last messages of the conversation
pub fn build_llm_messages(rag_context: &str, history: &[ChatMessage]) -> Vec<LlmMessage> {
    let mut system_prompt = SYSTEM_PROMPT.to_string();
    if !rag_context.is_empty() {
        system_prompt.push_str(&format!("\n\n{RAG_PROMPT}\n\n{rag_context}"));
    }

    let mut messages = Vec::with_capacity(history.len().min(HISTORY_WINDOW) + 1);
    messages.push(LlmMessage {
        role: "system".to_string(),
        content: system_prompt,
    });

    let start = history.len().saturating_sub(HISTORY_WINDOW);
    for message in &history[start..] {
        messages.push(LlmMessage {
            role: message.role.clone(),
            content: message.content.clone(),
        });
    }

    messages
}

/// The canned reply used when no model is configured
pub fn fallback_reply(rag_context: &str) -> String {
    if rag_context.is_empty() {
        return FALLBACK_NO_MODEL.to_string();
    }

    let key_points: String = if rag_context.len() > MAX_KEY_POINTS_LEN {
        let truncated: String = rag_context
            .char_indices()
            .take_while(|(i, _)| *i < MAX_KEY_POINTS_LEN)
            .map(|(_, c)| c)
            .collect();
        format!("{truncated}...")
    } else {
        rag_context.to_string()
    };

    format!("{FALLBACK_RAG_PREFIX}\n\n{key_points}\n\n{FALLBACK_RAG_SUFFIX}")
}

/// First characters of the first user message, for the history listing
pub fn conversation_title(message: &str) -> String {
    if message.chars().count() > TITLE_LEN {
        let truncated: String = message.chars().take(TITLE_LEN).collect();
        format!("{truncated}...")
    } else {
        message.to_string()
    }
}

/// Stream a canned reply word-by-word, pacing like a live model
fn fallback_stream(reply: String) -> BoxStream<'static, Result<String>> {
    let stream = try_stream! {
        let words: Vec<String> = reply.split_whitespace().map(str::to_string).collect();
        let count = words.len();

        for (i, word) in words.into_iter().enumerate() {
            tokio::time::sleep(FALLBACK_WORD_DELAY).await;
            if i + 1 < count {
                yield format!("{word} ");
            } else {
                yield word;
            }
        }
    };

    Box::pin(stream)
}

pub struct ChatService {
    repo: Repository,
    cache: Arc<Cache>,
    search: Arc<SearchService>,
    config: SharedConfig,
    llm: Option<LlmClient>,
}

impl ChatService {
    pub fn new(
        repo: Repository,
        cache: Arc<Cache>,
        search: Arc<SearchService>,
        config: SharedConfig,
        llm: Option<LlmClient>,
    ) -> Self {
        if llm.is_none() {
            warn!("No LLM credentials configured, chat will use the canned fallback");
        }
        Self {
            repo,
            cache,
            search,
            config,
            llm,
        }
    }

    /// Synchronous chat turn. Returns the reply, the conversation id, and
    /// the RAG context that grounded it.
    pub async fn chat(
        &self,
        message: &str,
        conversation_id: Option<String>,
        user_id: i64,
        kb_id: i64,
        use_rag: bool,
    ) -> Result<(String, String, String)> {
        let conversation_id = conversation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut conversation = self
            .get_or_create_conversation(&conversation_id, user_id)
            .await?;
        conversation.messages.push(ChatMessage::user(message));

        let (rag_context, _) = self.retrieve_context(message, kb_id, use_rag).await;

        let reply = match &self.llm {
            Some(llm) => {
                let llm_messages = build_llm_messages(&rag_context, &conversation.messages);
                llm.generate(&llm_messages).await?
            }
            None => fallback_reply(&rag_context),
        };

        conversation.messages.push(ChatMessage::assistant(&reply));
        conversation.updated_at = Utc::now();

        self.save_conversation(&conversation).await;

        // A brand-new conversation has exactly the first exchange now
        if conversation.messages.len() == 2 {
            self.save_history_row(user_id, &conversation_id, message).await;
        }

        Ok((reply, conversation_id, rag_context))
    }

    /// Streaming chat turn. Returns the token stream, the conversation id,
    /// the RAG context, and the retrieved chunks. Persisting the completed
    /// exchange is the caller's job, after clean end-of-stream.
    pub async fn chat_stream(
        &self,
        message: &str,
        conversation_id: Option<String>,
        user_id: i64,
        kb_id: i64,
        use_rag: bool,
    ) -> Result<(
        BoxStream<'static, Result<String>>,
        String,
        String,
        Vec<ScoredChunk>,
    )> {
        let conversation_id = conversation_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut conversation = self
            .get_or_create_conversation(&conversation_id, user_id)
            .await?;
        conversation.messages.push(ChatMessage::user(message));

        let (rag_context, retrieved) = self.retrieve_context(message, kb_id, use_rag).await;

        let stream = match &self.llm {
            Some(llm) => {
                let llm_messages = build_llm_messages(&rag_context, &conversation.messages);
                llm.stream(llm_messages)
            }
            None => fallback_stream(fallback_reply(&rag_context)),
        };

        Ok((stream, conversation_id, rag_context, retrieved))
    }

    /// Persist a completed streaming exchange: the user turn, the buffered
    /// assistant reply, and (for a new conversation) the history row
    pub async fn persist_exchange(
        &self,
        user_id: i64,
        conversation_id: &str,
        user_message: &str,
        assistant_reply: &str,
    ) {
        let existing = match self
            .cache
            .get::<Conversation>(&cache::keys::conversation(conversation_id))
            .await
        {
            Ok(conversation) => conversation,
            Err(e) => {
                error!(error = %e, conversation_id, "Failed to load conversation for saving");
                return;
            }
        };

        let mut conversation = match existing {
            Some(conversation) => conversation,
            None => {
                self.save_history_row(user_id, conversation_id, user_message)
                    .await;
                Conversation::new(conversation_id.to_string(), user_id)
            }
        };

        conversation.messages.push(ChatMessage::user(user_message));
        conversation
            .messages
            .push(ChatMessage::assistant(assistant_reply));
        conversation.updated_at = Utc::now();

        self.save_conversation(&conversation).await;
    }

    /// Paginated conversation listing for a user
    pub async fn list_conversations(
        &self,
        user_id: i64,
        page: u64,
        page_size: u64,
    ) -> Result<(Vec<crate::db::models::ChatHistory>, u64)> {
        self.repo.list_chat_histories(user_id, page, page_size).await
    }

    /// Messages of one conversation, with an ownership check
    pub async fn conversation_messages(
        &self,
        conversation_id: &str,
        user_id: i64,
    ) -> Result<Vec<ChatMessage>> {
        let conversation = self
            .cache
            .get::<Conversation>(&cache::keys::conversation(conversation_id))
            .await?
            .ok_or_else(|| AppError::not_found("conversation", conversation_id))?;

        if conversation.user_id != user_id {
            return Err(AppError::Forbidden(
                "you don't have permission to access this conversation".to_string(),
            ));
        }

        Ok(conversation.messages)
    }

    async fn get_or_create_conversation(
        &self,
        conversation_id: &str,
        user_id: i64,
    ) -> Result<Conversation> {
        let cached = self
            .cache
            .get::<Conversation>(&cache::keys::conversation(conversation_id))
            .await?;

        Ok(cached.unwrap_or_else(|| Conversation::new(conversation_id.to_string(), user_id)))
    }

    /// RAG retrieval is best-effort: failures are logged and chat proceeds
    /// with an empty context
    async fn retrieve_context(
        &self,
        message: &str,
        kb_id: i64,
        use_rag: bool,
    ) -> (String, Vec<ScoredChunk>) {
        if !use_rag || kb_id <= 0 {
            return (String::new(), Vec::new());
        }

        let top_k = self.config.snapshot().await.top_k as i64;
        match self.search.search(message, kb_id, top_k).await {
            Ok(docs) if !docs.is_empty() => {
                let context = build_rag_context(&docs);
                debug!(kb_id, docs = docs.len(), context_len = context.len(), "Built RAG context");
                (context, docs)
            }
            Ok(_) => (String::new(), Vec::new()),
            Err(e) => {
                error!(error = %e, kb_id, "Failed to retrieve documents");
                (String::new(), Vec::new())
            }
        }
    }

    async fn save_conversation(&self, conversation: &Conversation) {
        let key = cache::keys::conversation(&conversation.id);
        if let Err(e) = self
            .cache
            .set_with_ttl(&key, conversation, cache::CONVERSATION_TTL_SECS)
            .await
        {
            error!(error = %e, conversation_id = %conversation.id, "Failed to save conversation");
        }
    }

    async fn save_history_row(&self, user_id: i64, conversation_id: &str, first_message: &str) {
        let title = conversation_title(first_message);
        if let Err(e) = self
            .repo
            .insert_chat_history(user_id, conversation_id.to_string(), title)
            .await
        {
            error!(error = %e, conversation_id, "Failed to save chat history");
        } else {
            info!(conversation_id, user_id, "Saved chat history");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scored(id: &str, content: &str, distance: f32) -> ScoredChunk {
        ScoredChunk {
            id: id.to_string(),
            content: content.to_string(),
            distance,
        }
    }

    #[test]
    fn rag_context_numbers_documents() {
        let docs = vec![scored("a", "first chunk", 0.1), scored("b", "second chunk", 0.2)];
        let context = build_rag_context(&docs);
        assert!(context.starts_with("文档 1:\nfirst chunk"));
        assert!(context.contains("文档 2:\nsecond chunk"));
    }

    #[test]
    fn rag_context_stops_growing_past_the_cap() {
        let docs: Vec<ScoredChunk> = (0..10)
            .map(|i| scored(&format!("c{i}"), &"x".repeat(800), 0.1))
            .collect();
        let context = build_rag_context(&docs);
        // One more document may land after the cap is crossed, never two
        assert!(context.len() < MAX_CONTEXT_LEN + 900);
        assert!(!context.contains("文档 7:"));
    }

    #[test]
    fn llm_messages_start_with_the_system_prompt() {
        let history = vec![ChatMessage::user("hi")];
        let messages = build_llm_messages("", &history);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[0].content, SYSTEM_PROMPT);
        assert_eq!(messages[1].role, "user");
    }

    #[test]
    fn llm_messages_embed_the_rag_context() {
        let history = vec![ChatMessage::user("hi")];
        let messages = build_llm_messages("文档 1:\nsome context", &history);
        assert!(messages[0].content.contains(RAG_PROMPT));
        assert!(messages[0].content.contains("some context"));
    }

    #[test]
    fn llm_messages_keep_only_the_last_ten() {
        let history: Vec<ChatMessage> = (0..25)
            .map(|i| ChatMessage::user(&format!("message {i}")))
            .collect();
        let messages = build_llm_messages("", &history);
        // system + 10 history
        assert_eq!(messages.len(), 11);
        assert_eq!(messages[1].content, "message 15");
        assert_eq!(messages[10].content, "message 24");
    }

    #[test]
    fn fallback_mentions_missing_model() {
        let reply = fallback_reply("");
        assert!(reply.contains("AI模型未配置"));
    }

    #[test]
    fn fallback_quotes_truncated_context() {
        let context = "y".repeat(2000);
        let reply = fallback_reply(&context);
        assert!(reply.starts_with(FALLBACK_RAG_PREFIX));
        assert!(reply.contains(&format!("{}...", "y".repeat(MAX_KEY_POINTS_LEN))));
        assert!(reply.ends_with(FALLBACK_RAG_SUFFIX));
    }

    #[test]
    fn titles_truncate_on_character_boundaries() {
        let short = conversation_title("hello");
        assert_eq!(short, "hello");

        let long = "很".repeat(80);
        let title = conversation_title(&long);
        assert_eq!(title.chars().count(), TITLE_LEN + 3);
        assert!(title.ends_with("..."));
    }

    #[tokio::test(start_paused = true)]
    async fn fallback_stream_reassembles_the_reply() {
        let reply = "one two three".to_string();
        let mut stream = fallback_stream(reply.clone());

        let mut collected = String::new();
        while let Some(token) = stream.next().await {
            collected.push_str(&token.unwrap());
        }
        assert_eq!(collected, reply);
    }

    #[tokio::test]
    async fn llm_generate_happy_path() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({ "stream": false })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "choices": [{ "message": { "role": "assistant", "content": "hello there" } }]
            })))
            .mount(&server)
            .await;

        let mut config = crate::config::AppConfig::default();
        config.openai_api_key = "test-key".to_string();
        config.openai_base_url = server.uri();

        let llm = LlmClient::from_config(&config).unwrap();
        let reply = llm
            .generate(&build_llm_messages("", &[ChatMessage::user("hi")]))
            .await
            .unwrap();
        assert_eq!(reply, "hello there");
    }

    #[tokio::test]
    async fn llm_stream_concatenates_to_the_full_reply() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"choices\":[{\"delta\":{\"content\":\"hello \"}}]}\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
            "data: [DONE]\n\n"
        );
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .and(body_partial_json(serde_json::json!({ "stream": true })))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(body)
                    .insert_header("content-type", "text/event-stream"),
            )
            .mount(&server)
            .await;

        let mut config = crate::config::AppConfig::default();
        config.openai_api_key = "test-key".to_string();
        config.openai_base_url = server.uri();

        let llm = LlmClient::from_config(&config).unwrap();
        let mut stream = llm.stream(build_llm_messages("", &[ChatMessage::user("hi")]));

        let mut collected = String::new();
        while let Some(token) = stream.next().await {
            collected.push_str(&token.unwrap());
        }
        assert_eq!(collected, "hello world");
    }

    #[tokio::test]
    async fn missing_api_key_disables_the_client() {
        let config = crate::config::AppConfig::default();
        assert!(LlmClient::from_config(&config).is_none());
    }
}
