use super::{
    ChatRecord, ChatStore, LoadedChat, MessageOutcome, MessageRole, NewChat, ProjectLlmConfig,
    StoredMessage,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nao_llm::Provider;
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// SQLite-backed store. Every statement runs on the blocking pool.
#[derive(Clone)]
pub struct SqliteChatStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteChatStore {
    pub fn open(db_path: &Path) -> Result<Self> {
        tracing::info!(db_path = %db_path.display(), "opening chat store");
        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create database dir {}", parent.display()))?;
        }
        let conn = Connection::open(db_path)
            .with_context(|| format!("open database {}", db_path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")
            .context("set pragmas")?;
        Self::from_connection(conn)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory database")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut guard = conn
                .lock()
                .map_err(|_| anyhow::anyhow!("sqlite connection mutex poisoned"))?;
            f(&mut guard)
        })
        .await
        .context("sqlite task join failed")?
    }
}

fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS chats (
            id TEXT PRIMARY KEY,
            project_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            title TEXT NOT NULL,
            slack_thread_id TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_chats_slack_thread
            ON chats(slack_thread_id) WHERE slack_thread_id IS NOT NULL;

        CREATE TABLE IF NOT EXISTS messages (
            id TEXT PRIMARY KEY,
            chat_id TEXT NOT NULL REFERENCES chats(id) ON DELETE CASCADE,
            role TEXT NOT NULL,
            text TEXT NOT NULL,
            turns TEXT NOT NULL DEFAULT '[]',
            stop_reason TEXT,
            error TEXT,
            token_usage TEXT,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_messages_chat ON messages(chat_id);

        CREATE TABLE IF NOT EXISTS project_llm_configs (
            project_id TEXT NOT NULL,
            provider TEXT NOT NULL,
            api_key TEXT NOT NULL,
            base_url TEXT,
            enabled_models TEXT NOT NULL DEFAULT '[]',
            PRIMARY KEY (project_id, provider)
        );",
    )
    .context("migration failed")?;
    Ok(())
}

fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn chat_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatRecord> {
    let created_at: String = row.get(5)?;
    let updated_at: String = row.get(6)?;
    Ok(ChatRecord {
        id: row.get(0)?,
        project_id: row.get(1)?,
        user_id: row.get(2)?,
        title: row.get(3)?,
        slack_thread_id: row.get(4)?,
        created_at: parse_timestamp(&created_at),
        updated_at: parse_timestamp(&updated_at),
    })
}

const CHAT_COLUMNS: &str =
    "id, project_id, user_id, title, slack_thread_id, created_at, updated_at";

fn upsert_message_row(conn: &Connection, chat_id: &str, message: &StoredMessage) -> Result<()> {
    let turns = serde_json::to_string(&message.turns)?;
    let token_usage = message
        .token_usage
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    conn.execute(
        "INSERT INTO messages (id, chat_id, role, text, turns, stop_reason, error, token_usage, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
         ON CONFLICT(id) DO UPDATE SET
           text = excluded.text,
           turns = excluded.turns,
           stop_reason = excluded.stop_reason,
           error = excluded.error,
           token_usage = excluded.token_usage",
        params![
            message.id,
            chat_id,
            message.role.as_str(),
            message.text,
            turns,
            message.stop_reason,
            message.error,
            token_usage,
            message.created_at.to_rfc3339(),
        ],
    )
    .context("failed to upsert message")?;
    Ok(())
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    async fn load_chat(&self, chat_id: &str) -> Result<Option<LoadedChat>> {
        let chat_id = chat_id.to_string();
        self.with_conn(move |conn| {
            let chat = conn
                .query_row(
                    &format!("SELECT {CHAT_COLUMNS} FROM chats WHERE id = ?1"),
                    params![chat_id],
                    chat_from_row,
                )
                .optional()
                .context("failed to load chat")?;
            let Some(chat) = chat else {
                return Ok(None);
            };

            let mut stmt = conn
                .prepare(
                    "SELECT id, role, text, turns, stop_reason, error, token_usage, created_at
                     FROM messages WHERE chat_id = ?1 ORDER BY rowid ASC",
                )
                .context("failed to prepare message query")?;
            let rows = stmt
                .query_map(params![chat.id], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, Option<String>>(5)?,
                        row.get::<_, Option<String>>(6)?,
                        row.get::<_, String>(7)?,
                    ))
                })
                .context("failed to load messages")?;

            let mut messages = Vec::new();
            for row in rows {
                let (id, role, text, turns, stop_reason, error, token_usage, created_at) =
                    row.context("failed to read message row")?;
                let Some(role) = MessageRole::parse(&role) else {
                    tracing::warn!(message_id = %id, role = %role, "skipping message with unknown role");
                    continue;
                };
                messages.push(StoredMessage {
                    id,
                    role,
                    text,
                    turns: serde_json::from_str(&turns).unwrap_or_default(),
                    stop_reason,
                    error,
                    token_usage: token_usage.and_then(|raw| serde_json::from_str(&raw).ok()),
                    created_at: parse_timestamp(&created_at),
                });
            }
            Ok(Some(LoadedChat { chat, messages }))
        })
        .await
    }

    async fn create_chat(
        &self,
        chat: NewChat,
        first_message: StoredMessage,
    ) -> Result<ChatRecord> {
        self.with_conn(move |conn| {
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
            let tx = conn.transaction().context("begin transaction")?;
            tx.execute(
                &format!("INSERT INTO chats ({CHAT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
                params![
                    record.id,
                    record.project_id,
                    record.user_id,
                    record.title,
                    record.slack_thread_id,
                    now.to_rfc3339(),
                    now.to_rfc3339(),
                ],
            )
            .context("failed to insert chat")?;
            upsert_message_row(&tx, &record.id, &first_message)?;
            tx.commit().context("commit chat")?;
            Ok(record)
        })
        .await
    }

    async fn upsert_message(
        &self,
        chat_id: &str,
        mut message: StoredMessage,
        outcome: MessageOutcome,
    ) -> Result<()> {
        message.apply(outcome);
        let chat_id = chat_id.to_string();
        self.with_conn(move |conn| {
            let updated = conn
                .execute(
                    "UPDATE chats SET updated_at = ?2 WHERE id = ?1",
                    params![chat_id, Utc::now().to_rfc3339()],
                )
                .context("failed to touch chat")?;
            if updated == 0 {
                return Err(anyhow::anyhow!("chat {chat_id} not found"));
            }
            upsert_message_row(conn, &chat_id, &message)
        })
        .await
    }

    async fn get_project_llm_config(
        &self,
        project_id: &str,
        provider: Provider,
    ) -> Result<Option<ProjectLlmConfig>> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    "SELECT api_key, base_url, enabled_models FROM project_llm_configs
                     WHERE project_id = ?1 AND provider = ?2",
                    params![project_id, provider.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, Option<String>>(1)?,
                            row.get::<_, String>(2)?,
                        ))
                    },
                )
                .optional()
                .context("failed to load project llm config")?;
            Ok(row.map(|(api_key, base_url, enabled_models)| ProjectLlmConfig {
                provider,
                api_key,
                base_url,
                enabled_models: serde_json::from_str(&enabled_models).unwrap_or_default(),
            }))
        })
        .await
    }

    async fn set_project_llm_config(
        &self,
        project_id: &str,
        config: ProjectLlmConfig,
    ) -> Result<()> {
        let project_id = project_id.to_string();
        self.with_conn(move |conn| {
            let enabled_models = serde_json::to_string(&config.enabled_models)?;
            conn.execute(
                "INSERT INTO project_llm_configs (project_id, provider, api_key, base_url, enabled_models)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(project_id, provider) DO UPDATE SET
                   api_key = excluded.api_key,
                   base_url = excluded.base_url,
                   enabled_models = excluded.enabled_models",
                params![
                    project_id,
                    config.provider.as_str(),
                    config.api_key,
                    config.base_url,
                    enabled_models,
                ],
            )
            .context("failed to upsert project llm config")?;
            Ok(())
        })
        .await
    }

    async fn find_chat_by_slack_thread(&self, thread_id: &str) -> Result<Option<ChatRecord>> {
        let thread_id = thread_id.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                &format!(
                    "SELECT {CHAT_COLUMNS} FROM chats WHERE slack_thread_id = ?1
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![thread_id],
                chat_from_row,
            )
            .optional()
            .context("failed to find chat by slack thread")
        })
        .await
    }
}
