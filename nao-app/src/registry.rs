//! At most one live session per conversation.

use crate::backend::BackendFactory;
use crate::resolver::{ModelResolver, ModelSelection};
use crate::session::{DisposeFn, Session, SessionEnv};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;

/// What a new session is bound to.
#[derive(Debug, Clone)]
pub struct Conversation {
    pub chat_id: String,
    pub project_id: String,
    pub model: Option<ModelSelection>,
}

pub struct SessionRegistry {
    sessions: Arc<DashMap<String, Arc<Session>>>,
    resolver: ModelResolver,
    backends: Arc<dyn BackendFactory>,
    env: Arc<SessionEnv>,
    next_serial: AtomicU64,
}

impl SessionRegistry {
    pub fn new(
        resolver: ModelResolver,
        backends: Arc<dyn BackendFactory>,
        env: Arc<SessionEnv>,
    ) -> Self {
        Self {
            sessions: Arc::new(DashMap::new()),
            resolver,
            backends,
            env,
            next_serial: AtomicU64::new(0),
        }
    }

    /// Stops and forgets any session for the chat, then registers a new one.
    ///
    /// The new session's cancellation is a child of `scope`. Two overlapping
    /// calls for the same chat both succeed; the later registration wins and
    /// the other session is stopped.
    #[tracing::instrument(level = "info", skip_all, fields(chat_id = %conversation.chat_id))]
    pub async fn create(
        &self,
        conversation: &Conversation,
        scope: &CancellationToken,
    ) -> anyhow::Result<Arc<Session>> {
        if let Some((_, previous)) = self.sessions.remove(&conversation.chat_id) {
            tracing::info!(serial = previous.serial(), "stopping previous session");
            previous.stop();
        }

        let config = self
            .resolver
            .resolve(&conversation.project_id, conversation.model.as_ref())
            .await?;
        let backend = self.backends.build(&config)?;

        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        let sessions = self.sessions.clone();
        let key = conversation.chat_id.clone();
        let on_dispose: DisposeFn = Box::new(move || {
            // No-op when a newer session already took the slot.
            sessions.remove_if(&key, |_, current| current.serial() == serial);
        });
        let session = Arc::new(Session::new(
            conversation.chat_id.clone(),
            serial,
            config,
            backend,
            self.env.clone(),
            scope.child_token(),
            on_dispose,
        ));

        if let Some(raced) = self
            .sessions
            .insert(conversation.chat_id.clone(), session.clone())
        {
            tracing::warn!(
                serial = raced.serial(),
                "concurrent session registered meanwhile; stopping it"
            );
            raced.stop();
        }
        tracing::info!(
            serial,
            provider = %session.config().provider,
            model = %session.config().model,
            "session registered"
        );
        Ok(session)
    }

    pub fn get(&self, chat_id: &str) -> Option<Arc<Session>> {
        self.sessions.get(chat_id).map(|entry| entry.value().clone())
    }

    /// Returns whether a session was found.
    pub fn stop(&self, chat_id: &str) -> bool {
        match self.get(chat_id) {
            Some(session) => {
                tracing::info!(chat_id = %chat_id, serial = session.serial(), "stop requested");
                session.stop();
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resolver::EnvCredentials;
    use crate::session::testing::{Script, ScriptedBackend, ScriptedFactory, done, env, text};
    use crate::session::{STOP_REASON_INTERRUPTED, SessionEvent, SessionState};
    use crate::store::{
        ChatRecord, ChatStore, LoadedChat, MemoryChatStore, MessageOutcome, NewChat,
        ProjectLlmConfig, StoredMessage,
    };
    use futures_util::StreamExt;
    use nao_llm::{ChatMessage, Provider};

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<MemoryChatStore>,
        registry: SessionRegistry,
        chat_id: String,
    }

    async fn fixture(scripts: Vec<Script>, keys: EnvCredentials) -> Fixture {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(MemoryChatStore::new());
        let chat = store
            .create_chat(NewChat::from_first_text("p", "u", "hi"), StoredMessage::user("hi"))
            .await
            .expect("create");
        let registry = SessionRegistry::new(
            ModelResolver::new(store.clone(), keys),
            Arc::new(ScriptedFactory(ScriptedBackend::new(scripts))),
            env(store.clone(), dir.path()),
        );
        Fixture {
            _dir: dir,
            store,
            registry,
            chat_id: chat.id,
        }
    }

    fn anthropic_key() -> EnvCredentials {
        EnvCredentials::new().with_key(Provider::Anthropic, Some("sk-ant"))
    }

    fn conversation(chat_id: &str) -> Conversation {
        Conversation {
            chat_id: chat_id.to_string(),
            project_id: "p".to_string(),
            model: None,
        }
    }

    async fn wait_disposed(session: &Session) {
        let mut state = session.watch_state();
        state
            .wait_for(|s| *s == SessionState::Disposed)
            .await
            .expect("state channel");
    }

    #[tokio::test]
    async fn create_replaces_and_cancels_previous_session() {
        let fx = fixture(
            vec![
                Script::Hang(vec![text("first")]),
                Script::Hang(vec![text("second")]),
                Script::Hang(vec![text("third")]),
            ],
            anthropic_key(),
        )
        .await;
        let scope = CancellationToken::new();
        let conv = conversation(&fx.chat_id);

        let mut created = Vec::new();
        for _ in 0..3 {
            let session = fx.registry.create(&conv, &scope).await.expect("create");
            let _stream = session.start(vec![ChatMessage::user("hi")]).expect("start");
            created.push(session);
        }

        let current = fx.registry.get(&fx.chat_id).expect("registered");
        assert_eq!(current.serial(), created[2].serial());
        assert!(created[0].is_cancelled());
        assert!(created[1].is_cancelled());
        assert!(!created[2].is_cancelled());
        assert_eq!(fx.registry.len(), 1);

        // Disposal of the replaced sessions never evicts the newest one.
        wait_disposed(&created[0]).await;
        wait_disposed(&created[1]).await;
        assert_eq!(
            fx.registry.get(&fx.chat_id).map(|s| s.serial()),
            Some(created[2].serial())
        );
    }

    /// Holds the first credential lookup until released.
    struct GatedStore {
        inner: MemoryChatStore,
        gate: tokio::sync::Mutex<Option<tokio::sync::oneshot::Receiver<()>>>,
        entered: tokio::sync::Notify,
    }

    #[async_trait::async_trait]
    impl ChatStore for GatedStore {
        async fn load_chat(&self, chat_id: &str) -> anyhow::Result<Option<LoadedChat>> {
            self.inner.load_chat(chat_id).await
        }

        async fn create_chat(
            &self,
            chat: NewChat,
            first_message: StoredMessage,
        ) -> anyhow::Result<ChatRecord> {
            self.inner.create_chat(chat, first_message).await
        }

        async fn upsert_message(
            &self,
            chat_id: &str,
            message: StoredMessage,
            outcome: MessageOutcome,
        ) -> anyhow::Result<()> {
            self.inner.upsert_message(chat_id, message, outcome).await
        }

        async fn get_project_llm_config(
            &self,
            project_id: &str,
            provider: Provider,
        ) -> anyhow::Result<Option<ProjectLlmConfig>> {
            let gate = self.gate.lock().await.take();
            if let Some(release) = gate {
                self.entered.notify_one();
                let _ = release.await;
            }
            self.inner.get_project_llm_config(project_id, provider).await
        }

        async fn set_project_llm_config(
            &self,
            project_id: &str,
            config: ProjectLlmConfig,
        ) -> anyhow::Result<()> {
            self.inner.set_project_llm_config(project_id, config).await
        }

        async fn find_chat_by_slack_thread(
            &self,
            thread_id: &str,
        ) -> anyhow::Result<Option<ChatRecord>> {
            self.inner.find_chat_by_slack_thread(thread_id).await
        }
    }

    #[tokio::test]
    async fn overlapping_creates_keep_one_session_and_stop_the_other() {
        let dir = tempfile::tempdir().expect("tempdir");
        let (release, gate) = tokio::sync::oneshot::channel();
        let store = Arc::new(GatedStore {
            inner: MemoryChatStore::new(),
            gate: tokio::sync::Mutex::new(Some(gate)),
            entered: tokio::sync::Notify::new(),
        });
        let registry = SessionRegistry::new(
            ModelResolver::new(store.clone(), anthropic_key()),
            Arc::new(ScriptedFactory(ScriptedBackend::new(vec![]))),
            env(Arc::new(MemoryChatStore::new()), dir.path()),
        );
        let scope = CancellationToken::new();
        let conv = conversation("chat-1");

        // The first create parks in model resolution while the second one registers.
        let held = registry.create(&conv, &scope);
        let overtaking = async {
            store.entered.notified().await;
            let session = registry.create(&conv, &scope).await;
            let _ = release.send(());
            session
        };
        let (held, overtaking) = tokio::join!(held, overtaking);
        let held = held.expect("held create");
        let overtaking = overtaking.expect("overtaking create");

        assert_eq!(registry.len(), 1);
        let current = registry.get("chat-1").expect("registered");
        assert_eq!(current.serial(), held.serial());
        assert!(!held.is_cancelled());
        assert!(overtaking.is_cancelled());
    }

    #[tokio::test]
    async fn finished_session_removes_itself() {
        let fx = fixture(
            vec![Script::Chunks(vec![text("done"), done("end_turn")])],
            anthropic_key(),
        )
        .await;
        let session = fx
            .registry
            .create(&conversation(&fx.chat_id), &CancellationToken::new())
            .await
            .expect("create");
        let events: Vec<SessionEvent> = session
            .start(vec![ChatMessage::user("hi")])
            .expect("start")
            .collect()
            .await;
        assert!(matches!(events.last(), Some(SessionEvent::Finish { .. })));
        assert!(fx.registry.get(&fx.chat_id).is_none());
        assert!(fx.registry.is_empty());
    }

    #[tokio::test]
    async fn stop_interrupts_and_persists_once() {
        let fx = fixture(vec![Script::Hang(vec![text("thinking about it")])], anthropic_key()).await;
        let session = fx
            .registry
            .create(&conversation(&fx.chat_id), &CancellationToken::new())
            .await
            .expect("create");
        let mut stream = session.start(vec![ChatMessage::user("hi")]).expect("start");
        assert!(stream.next().await.is_some());

        assert!(fx.registry.stop(&fx.chat_id));
        let rest: Vec<SessionEvent> = stream.collect().await;
        assert!(matches!(
            rest.last(),
            Some(SessionEvent::Finish { stop_reason, .. }) if stop_reason == STOP_REASON_INTERRUPTED
        ));

        let loaded = fx.store.load_chat(&fx.chat_id).await.expect("load").expect("chat");
        let interrupted = loaded
            .messages
            .iter()
            .filter(|m| m.stop_reason.as_deref() == Some(STOP_REASON_INTERRUPTED))
            .count();
        assert_eq!(interrupted, 1);
        assert!(!fx.registry.stop(&fx.chat_id));
    }

    #[tokio::test]
    async fn scope_cancellation_reaches_sessions() {
        let fx = fixture(vec![Script::Hang(vec![])], anthropic_key()).await;
        let scope = CancellationToken::new();
        let session = fx
            .registry
            .create(&conversation(&fx.chat_id), &scope)
            .await
            .expect("create");
        let stream = session.start(vec![ChatMessage::user("hi")]).expect("start");
        scope.cancel();
        let events: Vec<SessionEvent> = stream.collect().await;
        assert!(matches!(
            events.last(),
            Some(SessionEvent::Finish { stop_reason, .. }) if stop_reason == STOP_REASON_INTERRUPTED
        ));
    }

    #[tokio::test]
    async fn unresolvable_model_fails_without_registering() {
        let fx = fixture(vec![], EnvCredentials::new()).await;
        let err = fx
            .registry
            .create(&conversation(&fx.chat_id), &CancellationToken::new())
            .await
            .err()
            .expect("no credentials");
        assert!(
            err.downcast_ref::<crate::resolver::ResolveError>()
                .is_some()
        );
        assert!(fx.registry.get(&fx.chat_id).is_none());
    }
}
