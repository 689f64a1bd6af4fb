use super::{
    ChatRecord, ChatStore, LoadedChat, MessageOutcome, NewChat, ProjectLlmConfig, StoredMessage,
};
use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use nao_llm::Provider;
use std::collections::HashMap;
use tokio::sync::RwLock;

#[derive(Default)]
struct Inner {
    chats: HashMap<String, LoadedChat>,
    llm_configs: HashMap<(String, Provider), ProjectLlmConfig>,
}

/// Process-local store; everything is lost on restart.
#[derive(Default)]
pub struct MemoryChatStore {
    inner: RwLock<Inner>,
}

impl MemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for MemoryChatStore {
    async fn load_chat(&self, chat_id: &str) -> Result<Option<LoadedChat>> {
        Ok(self.inner.read().await.chats.get(chat_id).cloned())
    }

    async fn create_chat(
        &self,
        chat: NewChat,
        first_message: StoredMessage,
    ) -> Result<ChatRecord> {
        let now = Utc::now();
        let record = ChatRecord {
            id: uuid::Uuid::new_v4().to_string(),
            project_id: chat.project_id,
            user_id: chat.user_id,
            title: chat.title,
            slack_thread_id: chat.slack_thread_id,
            created_at: now,
            updated_at: now,
        };
        self.inner.write().await.chats.insert(
            record.id.clone(),
            LoadedChat {
                chat: record.clone(),
                messages: vec![first_message],
            },
        );
        Ok(record)
    }

    async fn upsert_message(
        &self,
        chat_id: &str,
        mut message: StoredMessage,
        outcome: MessageOutcome,
    ) -> Result<()> {
        message.apply(outcome);
        let mut inner = self.inner.write().await;
        let Some(loaded) = inner.chats.get_mut(chat_id) else {
            return Err(anyhow::anyhow!("chat {chat_id} not found"));
        };
        loaded.chat.updated_at = Utc::now();
        match loaded.messages.iter_mut().find(|m| m.id == message.id) {
            Some(slot) => *slot = message,
            None => loaded.messages.push(message),
        }
        Ok(())
    }

    async fn get_project_llm_config(
        &self,
        project_id: &str,
        provider: Provider,
    ) -> Result<Option<ProjectLlmConfig>> {
        Ok(self
            .inner
            .read()
            .await
            .llm_configs
            .get(&(project_id.to_string(), provider))
            .cloned())
    }

    async fn set_project_llm_config(
        &self,
        project_id: &str,
        config: ProjectLlmConfig,
    ) -> Result<()> {
        self.inner
            .write()
            .await
            .llm_configs
            .insert((project_id.to_string(), config.provider), config);
        Ok(())
    }

    async fn find_chat_by_slack_thread(&self, thread_id: &str) -> Result<Option<ChatRecord>> {
        Ok(self
            .inner
            .read()
            .await
            .chats
            .values()
            .find(|c| c.chat.slack_thread_id.as_deref() == Some(thread_id))
            .map(|c| c.chat.clone()))
    }
}
