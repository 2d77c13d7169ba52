use crate::chat::Message;
use crate::entity::{Chatroom, User};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum Event {
    /// A user was admitted into a chatroom
    UserJoined { chatroom: Chatroom, user: User },

    /// A membership was removed
    UserLeft { chatroom_id: String, user_id: String },

    /// A queued message was persisted
    MessageCreated(Message),
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::UserJoined { .. } => "UserJoined",
            Event::UserLeft { .. } => "UserLeft",
            Event::MessageCreated(_) => "MessageCreated",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Notification {
    pub channel: String,
    pub event: Event,
}

type Registry = Arc<Mutex<HashMap<String, broadcast::Sender<Notification>>>>;

fn lock(registry: &Registry) -> MutexGuard<'_, HashMap<String, broadcast::Sender<Notification>>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Per-channel fan-out of chatroom events.
///
/// Each channel keeps its own broadcast sender, created on first subscribe
/// and removed once its last [`Subscription`] is dropped. Publishing to a
/// channel nobody listens on is a no-op.
pub struct EventBus {
    capacity: usize,
    channels: Registry,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            channels: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self, channel: impl Into<String>) -> Subscription {
        let channel = channel.into();
        let rx = lock(&self.channels)
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();

        debug!(channel = %channel, "subscriber attached");

        Subscription {
            channel,
            rx: Some(rx),
            registry: self.channels.clone(),
        }
    }

    /// Returns how many subscribers the event was handed to.
    pub fn publish(&self, channel: &str, event: Event) -> usize {
        let tx = lock(&self.channels).get(channel).cloned();
        let Some(tx) = tx else {
            debug!(channel = %channel, event = event.name(), "no subscribers");
            return 0;
        };

        let name = event.name();
        match tx.send(Notification {
            channel: channel.to_string(),
            event,
        }) {
            Ok(count) => {
                debug!(channel = %channel, event = name, subscribers = count, "event published");
                count
            }
            // Every receiver went away between the lookup and the send
            Err(_) => 0,
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.channels)
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }
}

/// A live subscription to one channel. Dropping it unsubscribes.
pub struct Subscription {
    channel: String,
    rx: Option<broadcast::Receiver<Notification>>,
    registry: Registry,
}

impl Subscription {
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits for the next event. Events missed while lagging are skipped.
    pub async fn recv(&mut self) -> Option<Notification> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(notification) => return Some(notification),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, skipped, "subscriber lagged, events dropped");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        // Release the receiver first so the count below excludes it
        drop(self.rx.take());

        let mut channels = lock(&self.registry);
        if channels
            .get(&self.channel)
            .is_some_and(|tx| tx.receiver_count() == 0)
        {
            channels.remove(&self.channel);
            debug!(channel = %self.channel, "channel pruned");
        }
    }
}
