use crate::entity::User;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// A persisted chatroom message. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: String,
    pub chatroom_id: String,
    pub user_id: String,
    pub text: Option<String>,
    pub attachment_path: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A message as listed to clients, with its author inlined.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageWithAuthor {
    #[serde(flatten)]
    pub message: Message,
    pub user: User,
}
