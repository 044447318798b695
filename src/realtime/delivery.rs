use tracing::{debug, warn};
use uuid::Uuid;

use crate::{
    conversations::{validate_content, Directory, Message, MessageStore, Receipts},
    error::{ChatError, ChatResult},
};

use super::{envelope::ServerEnvelope, hub::Hub};

/// Where a client wants something to go.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Target {
    Conversation(Uuid),
    /// The direct conversation with this user.
    Recipient(String),
}

/// Persists first, then pushes to whoever is connected.
///
/// Live delivery is best effort: nothing is queued for offline users, who
/// pick messages up from history when they come back.
#[derive(Clone)]
pub struct Delivery {
    directory: Directory,
    messages: MessageStore,
    receipts: Receipts,
    hub: Hub,
}

impl Delivery {
    pub fn new(directory: Directory, messages: MessageStore, receipts: Receipts, hub: Hub) -> Self {
        Self { directory, messages, receipts, hub }
    }

    /// A rejected send leaves nothing behind, not even a new conversation.
    pub async fn send(&self, sender_id: &str, target: Target, content: &str) -> ChatResult<Message> {
        validate_content(content)?;

        let conversation_id = match target {
            Target::Conversation(id) => id,
            Target::Recipient(recipient_id) => {
                if recipient_id == sender_id {
                    return Err(ChatError::InvalidInput("cannot message yourself".to_owned()));
                }
                self.directory
                    .get_or_create(&[sender_id.to_owned(), recipient_id])
                    .await?
            }
        };

        let message = self.messages.append(conversation_id, sender_id, content).await?;

        let event = ServerEnvelope::Message(message.clone());
        match self.hub.send_to_conversation(conversation_id, &event, Some(sender_id)).await {
            Ok(delivered) => debug!(
                conversation = %conversation_id,
                message = message.id,
                delivered,
                "message pushed"
            ),
            Err(err) => warn!(
                conversation = %conversation_id,
                message = message.id,
                error = %err,
                "live delivery skipped"
            ),
        }

        Ok(message)
    }

    /// Typing indicators are never stored. Returns how many connections got it.
    pub async fn typing(&self, sender_id: &str, target: Target, typing: bool) -> ChatResult<usize> {
        let conversation_id = match target {
            Target::Conversation(id) => {
                self.directory.authorize(id, sender_id).await?;
                id
            }
            Target::Recipient(recipient_id) => {
                match self.directory.find_direct(sender_id, &recipient_id).await? {
                    Some(id) => id,
                    None => return Ok(0),
                }
            }
        };

        let user_id = sender_id.to_owned();
        let event = if typing {
            ServerEnvelope::TypingStart { conversation_id, user_id }
        } else {
            ServerEnvelope::TypingStop { conversation_id, user_id }
        };

        self.hub
            .send_to_conversation(conversation_id, &event, Some(sender_id))
            .await
    }

    /// Marks the conversation read for `reader_id` and lets the others know.
    pub async fn mark_read(&self, conversation_id: Uuid, reader_id: &str) -> ChatResult<u64> {
        let flipped = self.receipts.mark_read(conversation_id, reader_id).await?;

        if flipped > 0 {
            let event = ServerEnvelope::Read {
                conversation_id,
                user_id: reader_id.to_owned(),
            };
            if let Err(err) = self.hub.send_to_conversation(conversation_id, &event, Some(reader_id)).await {
                warn!(conversation = %conversation_id, error = %err, "read receipt not pushed");
            }
        }

        Ok(flipped)
    }
}
