use crate::{
    chat::{Message, MessageWithAuthor},
    entity::{Chatroom, Membership, User},
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    ConnectOptions, FromRow, Row, SqlitePool,
};
use std::{path::Path, str::FromStr, time::Duration};

/// Result of the conditional membership insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipWrite {
    Created,
    Full,
    Duplicate,
}

/// A message task that was dropped after its retries ran out.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct FailedTask {
    pub id: String,
    pub payload: String,
    pub error: String,
    pub attempts: i64,
    pub failed_at: DateTime<Utc>,
}

/// Operations the admission service and the ingestion worker rely on.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn create_chatroom(&self, chatroom: &Chatroom) -> Result<()>;
    async fn get_chatroom(&self, id: &str) -> Result<Option<Chatroom>>;
    async fn get_user(&self, id: &str) -> Result<Option<User>>;
    async fn count_members(&self, chatroom_id: &str) -> Result<i64>;
    async fn has_membership(&self, user_id: &str, chatroom_id: &str) -> Result<bool>;

    /// Inserts the membership only while the chatroom is below capacity.
    /// The count check and the insert are one statement.
    async fn create_membership(&self, membership: &Membership) -> Result<MembershipWrite>;

    /// Returns whether a membership was actually removed.
    async fn delete_membership(&self, user_id: &str, chatroom_id: &str) -> Result<bool>;

    /// Idempotent on `message.id`; returns the row as stored.
    async fn create_message(&self, message: &Message) -> Result<Message>;

    async fn record_failed_task(&self, task: &FailedTask) -> Result<()>;
}

#[derive(Clone, Debug)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Create a new Store instance.
    /// This will automatically create the database file if it doesn't exist.
    pub async fn new(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).context("Failed to create database directory")?;
            }
        }

        let db_url = format!("sqlite://{}", db_path.to_string_lossy());

        let options = SqliteConnectOptions::from_str(&db_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5))
            .log_statements(tracing::log::LevelFilter::Trace);

        let pool = SqlitePool::connect_with(options)
            .await
            .context("Failed to connect to SQLite database")?;

        Ok(Self { pool })
    }

    /// A private in-memory database with the schema already applied.
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?
            .log_statements(tracing::log::LevelFilter::Trace);

        // One connection that never expires, or the database goes with it
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await
            .context("Failed to open in-memory database")?;

        let store = Self { pool };
        store.init().await?;
        Ok(store)
    }

    /// Initialize the database schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                api_token TEXT NOT NULL UNIQUE,
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chatrooms (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                max_members INTEGER NOT NULL CHECK (max_members > 0),
                created_at DATETIME NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chatroom_users (
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                chatroom_id TEXT NOT NULL REFERENCES chatrooms(id) ON DELETE CASCADE,
                joined_at DATETIME NOT NULL,
                PRIMARY KEY (user_id, chatroom_id)
            );
            CREATE INDEX IF NOT EXISTS idx_chatroom_users_chatroom ON chatroom_users(chatroom_id);

            CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                chatroom_id TEXT NOT NULL REFERENCES chatrooms(id) ON DELETE CASCADE,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                text TEXT,
                attachment_path TEXT,
                created_at DATETIME NOT NULL,
                CHECK (text IS NOT NULL OR attachment_path IS NOT NULL)
            );
            CREATE INDEX IF NOT EXISTS idx_messages_chatroom_created ON messages(chatroom_id, created_at);

            CREATE TABLE IF NOT EXISTS failed_tasks (
                id TEXT PRIMARY KEY,
                payload TEXT NOT NULL,
                error TEXT NOT NULL,
                attempts INTEGER NOT NULL,
                failed_at DATETIME NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to initialize database schema")?;

        Ok(())
    }

    pub async fn create_user(&self, user: &User) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO users (id, name, api_token, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&user.id)
        .bind(&user.name)
        .bind(&user.api_token)
        .bind(user.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save user")?;

        Ok(())
    }

    pub async fn find_user_by_token(&self, token: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>(
            "SELECT id, name, api_token, created_at FROM users WHERE api_token = ?",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to look up user by token")
    }

    /// All chatrooms, oldest first.
    pub async fn list_chatrooms(&self) -> Result<Vec<Chatroom>> {
        sqlx::query_as::<_, Chatroom>(
            "SELECT id, name, max_members, created_at FROM chatrooms ORDER BY created_at ASC, id ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to list chatrooms")
    }

    pub async fn chatrooms_for_user(&self, user_id: &str) -> Result<Vec<Chatroom>> {
        sqlx::query_as::<_, Chatroom>(
            r#"
            SELECT c.id, c.name, c.max_members, c.created_at
            FROM chatrooms c
            JOIN chatroom_users cu ON cu.chatroom_id = c.id
            WHERE cu.user_id = ?
            ORDER BY cu.joined_at ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to list chatrooms for user")
    }

    /// Messages of a chatroom with their authors, oldest first.
    pub async fn list_messages(&self, chatroom_id: &str) -> Result<Vec<MessageWithAuthor>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.chatroom_id, m.user_id, m.text, m.attachment_path, m.created_at,
                   u.name AS user_name, u.api_token AS user_token, u.created_at AS user_created_at
            FROM messages m
            JOIN users u ON u.id = m.user_id
            WHERE m.chatroom_id = ?
            ORDER BY m.created_at ASC, m.id ASC
            "#,
        )
        .bind(chatroom_id)
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch messages")?;

        let mut messages = Vec::with_capacity(rows.len());
        for row in rows {
            let user_id: String = row.try_get("user_id")?;
            messages.push(MessageWithAuthor {
                user: User {
                    id: user_id.clone(),
                    name: row.try_get("user_name")?,
                    api_token: row.try_get("user_token")?,
                    created_at: row.try_get("user_created_at")?,
                },
                message: Message {
                    id: row.try_get("id")?,
                    chatroom_id: row.try_get("chatroom_id")?,
                    user_id,
                    text: row.try_get("text")?,
                    attachment_path: row.try_get("attachment_path")?,
                    created_at: row.try_get("created_at")?,
                },
            });
        }

        Ok(messages)
    }

    pub async fn failed_tasks(&self) -> Result<Vec<FailedTask>> {
        sqlx::query_as::<_, FailedTask>(
            "SELECT id, payload, error, attempts, failed_at FROM failed_tasks ORDER BY failed_at ASC",
        )
        .fetch_all(&self.pool)
        .await
        .context("Failed to fetch failed tasks")
    }

    pub async fn count_messages(&self, chatroom_id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM messages WHERE chatroom_id = ?")
            .bind(chatroom_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count messages")
    }
}

#[async_trait]
impl Gateway for Store {
    async fn create_chatroom(&self, chatroom: &Chatroom) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO chatrooms (id, name, max_members, created_at)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(&chatroom.id)
        .bind(&chatroom.name)
        .bind(chatroom.max_members)
        .bind(chatroom.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save chatroom")?;

        Ok(())
    }

    async fn get_chatroom(&self, id: &str) -> Result<Option<Chatroom>> {
        sqlx::query_as::<_, Chatroom>(
            "SELECT id, name, max_members, created_at FROM chatrooms WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .context("Failed to fetch chatroom")
    }

    async fn get_user(&self, id: &str) -> Result<Option<User>> {
        sqlx::query_as::<_, User>("SELECT id, name, api_token, created_at FROM users WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch user")
    }

    async fn count_members(&self, chatroom_id: &str) -> Result<i64> {
        sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM chatroom_users WHERE chatroom_id = ?")
            .bind(chatroom_id)
            .fetch_one(&self.pool)
            .await
            .context("Failed to count members")
    }

    async fn has_membership(&self, user_id: &str, chatroom_id: &str) -> Result<bool> {
        sqlx::query_scalar::<_, bool>(
            "SELECT EXISTS(SELECT 1 FROM chatroom_users WHERE user_id = ? AND chatroom_id = ?)",
        )
        .bind(user_id)
        .bind(chatroom_id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to check membership")
    }

    async fn create_membership(&self, membership: &Membership) -> Result<MembershipWrite> {
        let result = sqlx::query(
            r#"
            INSERT INTO chatroom_users (user_id, chatroom_id, joined_at)
            SELECT ?1, ?2, ?3
            WHERE (SELECT COUNT(*) FROM chatroom_users WHERE chatroom_id = ?2)
                < (SELECT max_members FROM chatrooms WHERE id = ?2)
            "#,
        )
        .bind(&membership.user_id)
        .bind(&membership.chatroom_id)
        .bind(membership.joined_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(done) if done.rows_affected() == 0 => Ok(MembershipWrite::Full),
            Ok(_) => Ok(MembershipWrite::Created),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Ok(MembershipWrite::Duplicate)
            }
            Err(e) => Err(anyhow::Error::from(e).context("Failed to save membership")),
        }
    }

    async fn delete_membership(&self, user_id: &str, chatroom_id: &str) -> Result<bool> {
        let done = sqlx::query("DELETE FROM chatroom_users WHERE user_id = ? AND chatroom_id = ?")
            .bind(user_id)
            .bind(chatroom_id)
            .execute(&self.pool)
            .await
            .context("Failed to delete membership")?;

        Ok(done.rows_affected() > 0)
    }

    async fn create_message(&self, message: &Message) -> Result<Message> {
        sqlx::query(
            r#"
            INSERT INTO messages (id, chatroom_id, user_id, text, attachment_path, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO NOTHING
            "#,
        )
        .bind(&message.id)
        .bind(&message.chatroom_id)
        .bind(&message.user_id)
        .bind(&message.text)
        .bind(&message.attachment_path)
        .bind(message.created_at)
        .execute(&self.pool)
        .await
        .context("Failed to save message")?;

        sqlx::query_as::<_, Message>(
            r#"
            SELECT id, chatroom_id, user_id, text, attachment_path, created_at
            FROM messages
            WHERE id = ?
            "#,
        )
        .bind(&message.id)
        .fetch_one(&self.pool)
        .await
        .context("Failed to read back message")
    }

    async fn record_failed_task(&self, task: &FailedTask) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO failed_tasks (id, payload, error, attempts, failed_at)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(&task.id)
        .bind(&task.payload)
        .bind(&task.error)
        .bind(task.attempts)
        .bind(task.failed_at)
        .execute(&self.pool)
        .await
        .context("Failed to record failed task")?;

        Ok(())
    }
}
