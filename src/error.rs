use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("user {user} is not a participant of conversation {conversation}")]
    NotParticipant { conversation: Uuid, user: String },

    #[error("conversation {0} not found")]
    ConversationNotFound(Uuid),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not authenticated")]
    Unauthenticated,

    #[error("storage error: {0}")]
    Storage(#[from] sqlx::Error),
}

pub type ChatResult<T> = Result<T, ChatError>;
