use crate::bus::{Event, EventBus};
use crate::entity::{channel_for, Membership};
use crate::store::{Gateway, MembershipWrite};
use chrono::Utc;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("Chatroom not found")]
    ChatroomNotFound,

    #[error("User not found")]
    UserNotFound,

    #[error("Chatroom is full")]
    Full,

    #[error("User already in chatroom")]
    AlreadyMember,

    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Grants and revokes chatroom membership.
///
/// The capacity check that decides admission is the gateway's conditional
/// insert, so concurrent joins cannot push a chatroom past `max_members`.
/// The reads before it only pick which error to report. `UserJoined` is
/// published after the membership row is written.
pub struct Admissions {
    gateway: Arc<dyn Gateway>,
    bus: Arc<EventBus>,
}

impl Admissions {
    pub fn new(gateway: Arc<dyn Gateway>, bus: Arc<EventBus>) -> Self {
        Self { gateway, bus }
    }

    pub async fn join(&self, chatroom_id: &str, user_id: &str) -> Result<Membership, AdmissionError> {
        let chatroom = self
            .gateway
            .get_chatroom(chatroom_id)
            .await?
            .ok_or(AdmissionError::ChatroomNotFound)?;
        let user = self
            .gateway
            .get_user(user_id)
            .await?
            .ok_or(AdmissionError::UserNotFound)?;

        if self.gateway.has_membership(&user.id, &chatroom.id).await? {
            return Err(AdmissionError::AlreadyMember);
        }
        if self.gateway.count_members(&chatroom.id).await? >= chatroom.max_members {
            return Err(AdmissionError::Full);
        }

        let membership = Membership {
            user_id: user.id.clone(),
            chatroom_id: chatroom.id.clone(),
            joined_at: Utc::now(),
        };

        match self.gateway.create_membership(&membership).await? {
            MembershipWrite::Created => {}
            MembershipWrite::Full => {
                // The capacity filter hides the primary key conflict
                if self.gateway.has_membership(&user.id, &chatroom.id).await? {
                    return Err(AdmissionError::AlreadyMember);
                }
                debug!(chatroom_id = %chatroom.id, user_id = %user.id, "lost join race at capacity");
                return Err(AdmissionError::Full);
            }
            MembershipWrite::Duplicate => return Err(AdmissionError::AlreadyMember),
        }

        info!(chatroom_id = %chatroom.id, user_id = %user.id, "user joined chatroom");

        let channel = chatroom.channel();
        self.bus.publish(&channel, Event::UserJoined { chatroom, user });

        Ok(membership)
    }

    /// Idempotent. Publishes `UserLeft` only when a membership was removed.
    pub async fn leave(&self, chatroom_id: &str, user_id: &str) -> Result<(), AdmissionError> {
        if !self.gateway.delete_membership(user_id, chatroom_id).await? {
            debug!(chatroom_id, user_id, "leave without membership");
            return Ok(());
        }

        info!(chatroom_id, user_id, "user left chatroom");
        self.bus.publish(
            &channel_for(chatroom_id),
            Event::UserLeft {
                chatroom_id: chatroom_id.to_string(),
                user_id: user_id.to_string(),
            },
        );

        Ok(())
    }
}
