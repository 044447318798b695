use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    conversations::Message,
    error::{ChatError, ChatResult},
};

use super::{delivery::Target, presence::PresenceStatus};

/// Frames a client may send over the socket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEnvelope {
    Auth {
        token: String,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        #[serde(default)]
        recipient_id: Option<String>,
        #[serde(default)]
        conversation_id: Option<Uuid>,
        content: String,
    },
    #[serde(rename_all = "camelCase")]
    TypingStart {
        #[serde(default)]
        recipient_id: Option<String>,
        #[serde(default)]
        conversation_id: Option<Uuid>,
    },
    #[serde(rename_all = "camelCase")]
    TypingStop {
        #[serde(default)]
        recipient_id: Option<String>,
        #[serde(default)]
        conversation_id: Option<Uuid>,
    },
    StatusUpdate {
        status: PresenceStatus,
    },
    #[serde(rename_all = "camelCase")]
    MarkRead {
        conversation_id: Uuid,
    },
}

impl ClientEnvelope {
    pub fn parse(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}

/// Frames the server pushes to clients.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEnvelope {
    /// A new message from someone else.
    Message(Message),
    /// The sender's own message, as persisted.
    MessageSent(Message),
    #[serde(rename_all = "camelCase")]
    TypingStart { conversation_id: Uuid, user_id: String },
    #[serde(rename_all = "camelCase")]
    TypingStop { conversation_id: Uuid, user_id: String },
    #[serde(rename_all = "camelCase")]
    UserOnline { user_id: String },
    #[serde(rename_all = "camelCase")]
    UserOffline { user_id: String },
    #[serde(rename_all = "camelCase")]
    Read { conversation_id: Uuid, user_id: String },
    Error { message: String },
}

/// `conversationId` wins when both are present.
pub(crate) fn target(conversation_id: Option<Uuid>, recipient_id: Option<String>) -> ChatResult<Target> {
    match (conversation_id, recipient_id) {
        (Some(id), _) => Ok(Target::Conversation(id)),
        (None, Some(recipient)) => Ok(Target::Recipient(recipient)),
        (None, None) => Err(ChatError::InvalidInput(
            "either conversationId or recipientId is required".to_owned(),
        )),
    }
}
