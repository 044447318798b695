use uuid::Uuid;

use crate::{
    db::DatabasePool,
    error::{ChatError, ChatResult},
};

/// Per-message read flags. Flags only ever go from unread to read.
#[derive(Clone)]
pub struct Receipts {
    db: DatabasePool,
}

impl Receipts {
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }

    /// Marks everything the other participants sent as read by `user_id`.
    /// Returns how many messages flipped; repeated calls return 0.
    pub async fn mark_read(&self, conversation_id: Uuid, user_id: &str) -> ChatResult<u64> {
        let mut tx = self.db.writer.begin().await?;

        let member: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conversation_participants WHERE conversation_id=? AND user_id=?")
            .bind(conversation_id.to_string())
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;
        if member.is_none() {
            return Err(ChatError::NotParticipant {
                conversation: conversation_id,
                user: user_id.to_owned(),
            });
        }

        let flipped = sqlx::query("UPDATE messages SET is_read = 1 WHERE conversation_id=? AND sender_id != ? AND is_read = 0")
            .bind(conversation_id.to_string())
            .bind(user_id)
            .execute(&mut *tx)
            .await?
            .rows_affected();

        tx.commit().await?;
        Ok(flipped)
    }

    /// Unread messages for `user_id` across all of their conversations.
    pub async fn unread_total(&self, user_id: &str) -> ChatResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM messages m \
             JOIN conversation_participants p ON p.conversation_id = m.conversation_id \
             WHERE p.user_id = ? AND m.sender_id != ? AND m.is_read = 0",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_one(&self.db.reader)
        .await?;

        Ok(count)
    }
}
