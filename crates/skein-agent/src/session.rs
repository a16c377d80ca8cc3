use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::RwLock;
use tracing::{debug, info};

use skein_core::config::{AppConfig, ModelConfig};
use skein_core::error::{Result, SkeinError};
use skein_core::traits::LlmClient;
use skein_core::types::ChatMessage;

/// Per-session creation options.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    pub title: String,
    /// Defaults to the creation time.
    pub updated_at: Option<DateTime<Utc>>,
}

impl SessionOptions {
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = title.into();
        self
    }

    pub fn with_updated_at(mut self, at: DateTime<Utc>) -> Self {
        self.updated_at = Some(at);
        self
    }
}

/// Point-in-time copy of a session's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    pub session_id: String,
    pub title: String,
    pub model_type: String,
    pub updated_at: DateTime<Utc>,
}

/// A long-lived conversation with one model.
pub struct SessionHandle {
    pub session_id: String,
    pub model_type: String,
    pub title: String,
    last_updated_at: Mutex<DateTime<Utc>>,
    history: tokio::sync::Mutex<Vec<ChatMessage>>,
    llm: Arc<dyn LlmClient>,
    model: ModelConfig,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("session_id", &self.session_id)
            .field("model_type", &self.model_type)
            .field("title", &self.title)
            .field("model", &self.model.model_id)
            .finish()
    }
}

impl SessionHandle {
    pub fn new(
        session_id: impl Into<String>,
        model_type: impl Into<String>,
        options: &SessionOptions,
        llm: Arc<dyn LlmClient>,
        model: ModelConfig,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            model_type: model_type.into(),
            title: options.title.clone(),
            last_updated_at: Mutex::new(options.updated_at.unwrap_or_else(Utc::now)),
            history: tokio::sync::Mutex::new(Vec::new()),
            llm,
            model,
        }
    }

    /// Seed the conversation with a system message.
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.history.get_mut().insert(0, ChatMessage::system(prompt));
        self
    }

    pub fn last_updated_at(&self) -> DateTime<Utc> {
        match self.last_updated_at.lock() {
            Ok(at) => *at,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn touch(&self) {
        let now = Utc::now();
        match self.last_updated_at.lock() {
            Ok(mut at) => *at = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            title: self.title.clone(),
            model_type: self.model_type.clone(),
            updated_at: self.last_updated_at(),
        }
    }

    /// Snapshot of the conversation so far.
    pub async fn history(&self) -> Vec<ChatMessage> {
        self.history.lock().await.clone()
    }

    /// Send one user message and stream the reply.
    ///
    /// Turns on the same session are serialized. A failed turn leaves the
    /// history as it was.
    pub async fn send(
        &self,
        text: &str,
        on_chunk: &mut (dyn FnMut(&str) + Send),
    ) -> Result<String> {
        let mut history = self.history.lock().await;
        history.push(ChatMessage::user(text));

        let reply =
            skein_llm::complete_streaming(self.llm.as_ref(), &self.model, history.clone(), on_chunk)
                .await;
        match reply {
            Ok(reply) => {
                history.push(ChatMessage::assistant(reply.clone()));
                self.touch();
                debug!(session_id = %self.session_id, turns = history.len(), "Session turn complete");
                Ok(reply)
            }
            Err(e) => {
                history.pop();
                Err(e)
            }
        }
    }
}

/// Builds session handles on a registry miss.
pub trait SessionFactory: Send + Sync + 'static {
    fn create(
        &self,
        session_id: &str,
        model_type: &str,
        config: &HashMap<String, serde_json::Value>,
        options: &SessionOptions,
    ) -> BoxFuture<'_, Result<SessionHandle>>;
}

/// Factory that resolves `model_type` against the app's model table.
///
/// Recognized per-session config keys: `system_prompt`, `model_id`.
pub struct LlmSessionFactory {
    config: AppConfig,
    client: Option<Arc<dyn LlmClient>>,
}

impl LlmSessionFactory {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            client: None,
        }
    }

    /// Use one client for every session instead of building one per model.
    pub fn with_client(mut self, client: Arc<dyn LlmClient>) -> Self {
        self.client = Some(client);
        self
    }
}

impl SessionFactory for LlmSessionFactory {
    fn create(
        &self,
        session_id: &str,
        model_type: &str,
        config: &HashMap<String, serde_json::Value>,
        options: &SessionOptions,
    ) -> BoxFuture<'_, Result<SessionHandle>> {
        let resolved = match self.config.model_for(model_type) {
            Some(model) => model.clone(),
            None => {
                let err = SkeinError::Session(format!("unknown model type '{}'", model_type));
                return Box::pin(async move { Err(err) });
            }
        };
        let mut model = resolved;
        if let Some(id) = config.get("model_id").and_then(|v| v.as_str()) {
            model.model_id = id.to_string();
        }
        let system_prompt = config
            .get("system_prompt")
            .and_then(|v| v.as_str())
            .map(String::from);
        let llm = match &self.client {
            Some(client) => client.clone(),
            None => Arc::from(skein_llm::create_client(&model)),
        };

        let mut handle = SessionHandle::new(session_id, model_type, options, llm, model);
        if let Some(prompt) = system_prompt {
            handle = handle.with_system_prompt(prompt);
        }
        Box::pin(async move { Ok(handle) })
    }
}

type UserSessions = HashMap<String, Arc<SessionHandle>>;

/// Maps (user, session) to a live [`SessionHandle`].
///
/// Create-on-miss runs entirely under the write lock, so the factory is
/// invoked at most once per pair even with concurrent callers. Lookups and
/// listings take the read lock.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, UserSessions>>,
    factory: Arc<dyn SessionFactory>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            factory,
        }
    }

    pub async fn get_or_create(
        &self,
        user: &str,
        session_id: &str,
        model_type: &str,
        config: &HashMap<String, serde_json::Value>,
        options: SessionOptions,
    ) -> Result<Arc<SessionHandle>> {
        let mut sessions = self.sessions.write().await;

        if let Some(handle) = sessions.get(user).and_then(|s| s.get(session_id)) {
            return Ok(handle.clone());
        }

        let handle = Arc::new(
            self.factory
                .create(session_id, model_type, config, &options)
                .await?,
        );
        info!(user, session_id, model_type, "Session created");
        sessions
            .entry(user.to_string())
            .or_default()
            .insert(session_id.to_string(), handle.clone());
        Ok(handle)
    }

    pub async fn get(&self, user: &str, session_id: &str) -> Option<Arc<SessionHandle>> {
        let sessions = self.sessions.read().await;
        sessions.get(user)?.get(session_id).cloned()
    }

    /// Remove one session. A user left with no sessions is dropped too.
    pub async fn remove(&self, user: &str, session_id: &str) -> bool {
        let mut sessions = self.sessions.write().await;
        let Some(user_sessions) = sessions.get_mut(user) else {
            return false;
        };
        let removed = user_sessions.remove(session_id).is_some();
        if user_sessions.is_empty() {
            sessions.remove(user);
        }
        if removed {
            info!(user, session_id, "Session removed");
        }
        removed
    }

    /// Metadata snapshot of a user's sessions, ordered by session id.
    pub async fn list_sessions(&self, user: &str) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        let mut infos: Vec<SessionInfo> = sessions
            .get(user)
            .map(|s| s.values().map(|h| h.info()).collect())
            .unwrap_or_default();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    /// Number of users with at least one session.
    pub async fn user_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use skein_test_utils::{test_model_config, MockLlm};

    struct CountingFactory {
        created: Arc<AtomicUsize>,
    }

    impl SessionFactory for CountingFactory {
        fn create(
            &self,
            session_id: &str,
            model_type: &str,
            _config: &HashMap<String, serde_json::Value>,
            options: &SessionOptions,
        ) -> BoxFuture<'_, Result<SessionHandle>> {
            let handle = SessionHandle::new(
                session_id,
                model_type,
                options,
                Arc::new(MockLlm::new()),
                test_model_config(),
            );
            let created = self.created.clone();
            Box::pin(async move {
                // Widen the window for a racing caller
                tokio::time::sleep(Duration::from_millis(5)).await;
                created.fetch_add(1, Ordering::SeqCst);
                Ok(handle)
            })
        }
    }

    struct FailingFactory;

    impl SessionFactory for FailingFactory {
        fn create(
            &self,
            _session_id: &str,
            model_type: &str,
            _config: &HashMap<String, serde_json::Value>,
            _options: &SessionOptions,
        ) -> BoxFuture<'_, Result<SessionHandle>> {
            let err = SkeinError::Session(format!("no backend for {}", model_type));
            Box::pin(async move { Err(err) })
        }
    }

    fn counting_registry() -> (Arc<SessionRegistry>, Arc<AtomicUsize>) {
        let created = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(CountingFactory {
            created: created.clone(),
        });
        (Arc::new(SessionRegistry::new(factory)), created)
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_builds_once() {
        let (registry, created) = counting_registry();
        let mut tasks = Vec::new();
        for _ in 0..16 {
            let registry = registry.clone();
            tasks.push(tokio::spawn(async move {
                registry
                    .get_or_create("ana", "s1", "openai", &HashMap::new(), SessionOptions::default())
                    .await
                    .unwrap()
            }));
        }
        let mut handles = Vec::new();
        for t in tasks {
            handles.push(t.await.unwrap());
        }

        assert_eq!(created.load(Ordering::SeqCst), 1);
        for h in &handles[1..] {
            assert!(Arc::ptr_eq(&handles[0], h));
        }
    }

    #[tokio::test]
    async fn test_creates_minus_removes() {
        let (registry, _) = counting_registry();
        for i in 0..5 {
            registry
                .get_or_create("bo", &format!("s{}", i), "", &HashMap::new(), SessionOptions::default())
                .await
                .unwrap();
        }
        assert!(registry.remove("bo", "s1").await);
        assert!(registry.remove("bo", "s3").await);
        assert!(!registry.remove("bo", "s3").await);
        assert_eq!(registry.list_sessions("bo").await.len(), 3);
    }

    #[tokio::test]
    async fn test_removing_last_session_drops_user() {
        let (registry, _) = counting_registry();
        registry
            .get_or_create("cy", "only", "", &HashMap::new(), SessionOptions::default())
            .await
            .unwrap();
        assert_eq!(registry.user_count().await, 1);
        registry.remove("cy", "only").await;
        assert_eq!(registry.user_count().await, 0);
        assert!(registry.get("cy", "only").await.is_none());
        assert!(!registry.remove("nobody", "x").await);
    }

    #[tokio::test]
    async fn test_list_is_a_snapshot_with_options() {
        let (registry, _) = counting_registry();
        let at = Utc::now() - chrono::Duration::hours(3);
        registry
            .get_or_create(
                "di",
                "b",
                "ollama",
                &HashMap::new(),
                SessionOptions::default().with_title("Trip to Oslo").with_updated_at(at),
            )
            .await
            .unwrap();
        registry
            .get_or_create("di", "a", "openai", &HashMap::new(), SessionOptions::default())
            .await
            .unwrap();

        let listed = registry.list_sessions("di").await;
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].session_id, "a");
        assert_eq!(listed[1].title, "Trip to Oslo");
        assert_eq!(listed[1].model_type, "ollama");
        assert_eq!(listed[1].updated_at, at);

        registry.remove("di", "a").await;
        assert_eq!(listed.len(), 2);
        assert!(registry.list_sessions("unknown").await.is_empty());
    }

    #[tokio::test]
    async fn test_factory_failure_leaves_no_entry() {
        let registry = SessionRegistry::new(Arc::new(FailingFactory));
        let err = registry
            .get_or_create("ed", "s", "mystery", &HashMap::new(), SessionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SkeinError::Session(_)));
        assert_eq!(registry.user_count().await, 0);
    }

    fn app_config() -> AppConfig {
        toml::from_str(
            r#"
[model]
provider = "openai"
model_id = "gpt-4o-mini"
"#,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_llm_factory_send_keeps_history() {
        let llm = MockLlm::new().with_chunks(vec!["Bring ", "an umbrella."]);
        let factory = LlmSessionFactory::new(app_config()).with_client(Arc::new(llm));
        let registry = SessionRegistry::new(Arc::new(factory));

        let mut config = HashMap::new();
        config.insert("system_prompt".to_string(), serde_json::json!("You are a travel helper."));
        let handle = registry
            .get_or_create("fay", "s", "openai", &config, SessionOptions::default())
            .await
            .unwrap();
        let before = handle.last_updated_at();

        let mut chunks = Vec::new();
        let mut cb = |c: &str| chunks.push(c.to_string());
        let reply = handle.send("Weather in Bergen?", &mut cb).await.unwrap();

        assert_eq!(reply, "Bring an umbrella.");
        assert_eq!(chunks, vec!["Bring ", "an umbrella."]);
        let history = handle.history().await;
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].content, "You are a travel helper.");
        assert_eq!(history[2].content, "Bring an umbrella.");
        assert!(handle.last_updated_at() >= before);
    }

    #[tokio::test]
    async fn test_failed_send_rolls_back_history() {
        let llm = MockLlm::new().with_failure(SkeinError::LlmRequest("HTTP 500".into()));
        let factory = LlmSessionFactory::new(app_config()).with_client(Arc::new(llm));
        let handle = factory
            .create("s", "", &HashMap::new(), &SessionOptions::default())
            .await
            .unwrap();
        let mut cb = |_: &str| {};
        assert!(handle.send("hello", &mut cb).await.is_err());
        assert!(handle.history().await.is_empty());
    }

    #[tokio::test]
    async fn test_llm_factory_rejects_unknown_model_type() {
        let factory = LlmSessionFactory::new(app_config());
        let err = factory
            .create("s", "mystery", &HashMap::new(), &SessionOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, SkeinError::Session(_)));
    }
}
