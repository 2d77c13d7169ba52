//! Asynchronous message ingestion.
//!
//! [`MessageQueue::submit`] validates a submission, stores its attachment and
//! enqueues a typed [`MessageTask`]; the caller gets a pending ticket back
//! immediately. A [`Worker`] drains the queue, persisting each message and
//! publishing `MessageCreated` once it is stored. Failed attempts are retried
//! sequentially per [`RetryPolicy`]; a task that runs out of attempts is
//! logged, recorded in the failed-task table and dropped.

use crate::attachment::{BlobStorage, MediaCategory, Upload};
use crate::bus::{Event, EventBus};
use crate::chat::Message;
use crate::entity::channel_for;
use crate::store::{FailedTask, Gateway};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay: max_delay.max(base_delay),
        }
    }

    /// Delay before the attempt following `attempt` (1-based): exponential
    /// in the attempt number, capped at `max_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Message or attachment is required")]
    Empty,

    #[error("Invalid file type")]
    UnsupportedMedia(String),
}

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Chatroom not found")]
    ChatroomNotFound,

    #[error("User not found")]
    AuthorNotFound,

    #[error("Message queue is not accepting tasks")]
    QueueClosed,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

#[derive(Debug, Clone)]
pub struct Submission {
    pub chatroom_id: String,
    pub author_id: String,
    pub text: Option<String>,
    pub attachment: Option<Upload>,
}

/// A validated message waiting to be persisted.
///
/// `message_id` is fixed here so a retried insert stays idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageTask {
    pub id: String,
    pub message_id: String,
    pub chatroom_id: String,
    pub author_id: String,
    pub text: Option<String>,
    pub attachment_path: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TicketStatus {
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmissionTicket {
    pub id: String,
    pub status: TicketStatus,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Delivered(Message),
    ExhaustedRetries { attempts: u32, error: String },
}

#[derive(Clone)]
pub struct MessageQueue {
    tx: mpsc::Sender<MessageTask>,
    gateway: Arc<dyn Gateway>,
    blobs: Arc<dyn BlobStorage>,
}

impl MessageQueue {
    /// Returns the queue handle and the receiving end for a [`Worker`].
    pub fn new(
        capacity: usize,
        gateway: Arc<dyn Gateway>,
        blobs: Arc<dyn BlobStorage>,
    ) -> (Self, mpsc::Receiver<MessageTask>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, gateway, blobs }, rx)
    }

    pub async fn submit(&self, submission: Submission) -> Result<SubmissionTicket, SubmitError> {
        let Submission {
            chatroom_id,
            author_id,
            text,
            attachment,
        } = submission;

        let text = text.filter(|t| !t.trim().is_empty());
        if text.is_none() && attachment.is_none() {
            return Err(ValidationError::Empty.into());
        }

        let attachment = match attachment {
            Some(upload) => match MediaCategory::classify(&upload.content_type) {
                Some(category) => Some((category, upload)),
                None => {
                    warn!(content_type = %upload.content_type, "rejecting unsupported attachment");
                    return Err(ValidationError::UnsupportedMedia(upload.content_type).into());
                }
            },
            None => None,
        };

        if self.gateway.get_chatroom(&chatroom_id).await?.is_none() {
            return Err(SubmitError::ChatroomNotFound);
        }
        if self.gateway.get_user(&author_id).await?.is_none() {
            return Err(SubmitError::AuthorNotFound);
        }

        // Hold a queue slot before any blob is written
        let permit = self
            .tx
            .reserve()
            .await
            .map_err(|_| SubmitError::QueueClosed)?;

        let attachment_path = match attachment {
            Some((category, upload)) => Some(self.blobs.store(category, &upload).await?),
            None => None,
        };

        let task = MessageTask {
            id: Uuid::new_v4().to_string(),
            message_id: Uuid::new_v4().to_string(),
            chatroom_id,
            author_id,
            text,
            attachment_path,
            enqueued_at: Utc::now(),
        };
        let ticket = SubmissionTicket {
            id: task.id.clone(),
            status: TicketStatus::Pending,
            submitted_at: task.enqueued_at,
        };

        info!(task_id = %task.id, chatroom_id = %task.chatroom_id, "message queued for processing");
        permit.send(task);

        Ok(ticket)
    }
}

#[derive(Clone)]
pub struct Worker {
    gateway: Arc<dyn Gateway>,
    bus: Arc<EventBus>,
    policy: RetryPolicy,
}

impl Worker {
    pub fn new(gateway: Arc<dyn Gateway>, bus: Arc<EventBus>, policy: RetryPolicy) -> Self {
        Self {
            gateway,
            bus,
            policy,
        }
    }

    /// Drains the queue until every sender is gone. Tasks run concurrently;
    /// attempts of one task never overlap.
    pub async fn run(self, mut rx: mpsc::Receiver<MessageTask>) {
        info!(max_attempts = self.policy.max_attempts, "message worker started");
        while let Some(task) = rx.recv().await {
            let worker = self.clone();
            tokio::spawn(async move {
                worker.process(task).await;
            });
        }
        info!("message queue closed, worker exiting");
    }

    pub async fn process(&self, task: MessageTask) -> Outcome {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let message = Message {
                id: task.message_id.clone(),
                chatroom_id: task.chatroom_id.clone(),
                user_id: task.author_id.clone(),
                text: task.text.clone(),
                attachment_path: task.attachment_path.clone(),
                created_at: Utc::now(),
            };

            match self.gateway.create_message(&message).await {
                Ok(stored) => {
                    info!(
                        task_id = %task.id,
                        message_id = %stored.id,
                        chatroom_id = %stored.chatroom_id,
                        attempt,
                        "message processed successfully"
                    );
                    self.bus.publish(
                        &channel_for(&stored.chatroom_id),
                        Event::MessageCreated(stored.clone()),
                    );
                    return Outcome::Delivered(stored);
                }
                Err(e) if attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt);
                    warn!(
                        task_id = %task.id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %format!("{:#}", e),
                        "error processing message, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    let error = format!("{:#}", e);
                    error!(
                        task_id = %task.id,
                        chatroom_id = %task.chatroom_id,
                        attempts = attempt,
                        error = %error,
                        "failed to process message, dropping task"
                    );
                    self.record_failure(&task, attempt, &error).await;
                    return Outcome::ExhaustedRetries {
                        attempts: attempt,
                        error,
                    };
                }
            }
        }
    }

    async fn record_failure(&self, task: &MessageTask, attempts: u32, error: &str) {
        let payload = match serde_json::to_string(task) {
            Ok(payload) => payload,
            Err(e) => {
                error!(task_id = %task.id, error = %e, "failed to serialize dropped task");
                return;
            }
        };

        let failed = FailedTask {
            id: task.id.clone(),
            payload,
            error: error.to_string(),
            attempts: i64::from(attempts),
            failed_at: Utc::now(),
        };
        if let Err(e) = self.gateway.record_failed_task(&failed).await {
            error!(task_id = %task.id, error = %format!("{:#}", e), "failed to record dropped task");
        }
    }
}
