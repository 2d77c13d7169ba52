use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use uuid::Uuid;

/// A user provisioned by the identity service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: String,
    pub name: String,
    #[serde(skip)]
    pub api_token: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(name: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            api_token: api_token.into(),
            created_at: Utc::now(),
        }
    }
}

impl fmt::Display for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Chatroom {
    pub id: String,
    pub name: String,
    pub max_members: i64,
    pub created_at: DateTime<Utc>,
}

impl Chatroom {
    pub const MAX_NAME_LEN: usize = 255;

    /// Builds a new chatroom with a fresh random id.
    pub fn new(name: impl Into<String>, max_members: i64) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            max_members,
            created_at: Utc::now(),
        }
    }

    /// The notification channel scoped to this chatroom.
    pub fn channel(&self) -> String {
        channel_for(&self.id)
    }
}

pub fn channel_for(chatroom_id: &str) -> String {
    format!("chatroom.{}", chatroom_id)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Membership {
    pub user_id: String,
    pub chatroom_id: String,
    pub joined_at: DateTime<Utc>,
}
