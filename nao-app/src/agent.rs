//! Entry point shared by the HTTP route and the Slack bridge: persist the
//! user's message, open a session, and hand back its event stream.

use crate::registry::{Conversation, SessionRegistry};
use crate::resolver::{ModelSelection, ResolveError};
use crate::session::{SessionEvent, SessionStream};
use crate::store::{ChatStore, MessageOutcome, NewChat, StoredMessage};
use futures_util::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub user_id: String,
    pub text: String,
    pub chat_id: Option<String>,
    pub project_id: Option<String>,
    pub model: Option<ModelSelection>,
    /// Binds a newly created chat to a Slack thread.
    pub slack_thread_id: Option<String>,
}

impl AgentRequest {
    pub fn new(user_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            text: text.into(),
            chat_id: None,
            project_id: None,
            model: None,
            slack_thread_id: None,
        }
    }
}

pub struct AgentRun {
    pub chat_id: String,
    pub is_new: bool,
    pub events: SessionStream,
}

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("{0}")]
    InvalidRequest(String),
    #[error("Chat with id {0} not found.")]
    ChatNotFound(String),
    #[error("You are not authorized to access this chat.")]
    Forbidden,
    #[error(transparent)]
    Config(#[from] ResolveError),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct AgentRuntime {
    store: Arc<dyn ChatStore>,
    registry: Arc<SessionRegistry>,
    default_project_id: String,
    scope: CancellationToken,
}

impl AgentRuntime {
    pub fn new(
        store: Arc<dyn ChatStore>,
        registry: Arc<SessionRegistry>,
        default_project_id: impl Into<String>,
        scope: CancellationToken,
    ) -> Self {
        Self {
            store,
            registry,
            default_project_id: default_project_id.into(),
            scope,
        }
    }

    pub fn store(&self) -> &Arc<dyn ChatStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    #[tracing::instrument(level = "info", skip_all, fields(user_id = %req.user_id, chat_id = ?req.chat_id))]
    pub async fn start(&self, req: AgentRequest) -> Result<AgentRun, AgentError> {
        let text = req.text.trim().to_string();
        if text.is_empty() {
            return Err(AgentError::InvalidRequest(
                "message text is required".to_string(),
            ));
        }

        let (chat_id, is_new) = match req.chat_id.as_deref() {
            Some(chat_id) => {
                let Some(existing) = self.store.load_chat(chat_id).await? else {
                    return Err(AgentError::ChatNotFound(chat_id.to_string()));
                };
                if existing.chat.user_id != req.user_id {
                    return Err(AgentError::Forbidden);
                }
                self.store
                    .upsert_message(chat_id, StoredMessage::user(text), MessageOutcome::default())
                    .await?;
                (chat_id.to_string(), false)
            }
            None => {
                let project_id = req
                    .project_id
                    .clone()
                    .unwrap_or_else(|| self.default_project_id.clone());
                let mut new_chat = NewChat::from_first_text(project_id, req.user_id.clone(), &text);
                if let Some(thread_id) = req.slack_thread_id.as_deref() {
                    new_chat = new_chat.with_slack_thread(thread_id);
                }
                let created = self
                    .store
                    .create_chat(new_chat, StoredMessage::user(text))
                    .await?;
                (created.id, true)
            }
        };

        let Some(loaded) = self.store.load_chat(&chat_id).await? else {
            return Err(AgentError::ChatNotFound(chat_id));
        };
        let conversation = Conversation {
            chat_id: chat_id.clone(),
            project_id: loaded.chat.project_id.clone(),
            model: req.model,
        };
        let session = match self.registry.create(&conversation, &self.scope).await {
            Ok(session) => session,
            Err(e) => {
                return Err(match e.downcast::<ResolveError>() {
                    Ok(resolve) => AgentError::Config(resolve),
                    Err(other) => AgentError::Internal(other),
                });
            }
        };
        let events = session.start(loaded.history())?;

        let events = if is_new {
            let intro = SessionEvent::NewChat {
                chat_id: chat_id.clone(),
                title: loaded.chat.title.clone(),
                created_at: loaded.chat.created_at,
            };
            futures_util::stream::iter([intro]).chain(events).boxed()
        } else {
            events
        };

        tracing::info!(chat_id = %chat_id, is_new, "agent run started");
        Ok(AgentRun {
            chat_id,
            is_new,
            events,
        })
    }

    pub fn stop(&self, chat_id: &str) -> bool {
        self.registry.stop(chat_id)
    }
}
