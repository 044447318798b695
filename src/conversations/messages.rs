use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::{now_millis, DatabasePool},
    error::{ChatError, ChatResult},
};

use super::parse_id;

pub const MAX_CONTENT_CHARS: usize = 4000;
const ANONYMOUS: &str = "Anonymous";

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: i64,
    pub conversation_id: Uuid,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub sent_at: i64,
    pub is_read: bool,
}

type MessageRow = (i64, String, String, String, String, i64, bool);

fn into_message((id, conversation_id, sender_id, sender_name, content, sent_at, is_read): MessageRow) -> ChatResult<Message> {
    Ok(Message {
        id,
        conversation_id: parse_id(&conversation_id)?,
        sender_id,
        sender_name,
        content,
        sent_at,
        is_read,
    })
}

/// Rejects blank or oversized content before anything is written.
pub(crate) fn validate_content(content: &str) -> ChatResult<()> {
    if content.trim().is_empty() {
        return Err(ChatError::InvalidInput("message content must not be blank".to_owned()));
    }
    if content.chars().count() > MAX_CONTENT_CHARS {
        return Err(ChatError::InvalidInput(format!(
            "message content exceeds {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(())
}

/// Durable, append-only message history.
///
/// A message returned from [`MessageStore::append`] has been committed and is
/// visible to every later [`MessageStore::page`], whatever happens to live
/// delivery afterwards.
#[derive(Clone)]
pub struct MessageStore {
    db: DatabasePool,
}

impl MessageStore {
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }

    pub async fn append(&self, conversation_id: Uuid, sender_id: &str, content: &str) -> ChatResult<Message> {
        validate_content(content)?;

        let mut tx = self.db.writer.begin().await?;

        let member: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conversation_participants WHERE conversation_id=? AND user_id=?")
            .bind(conversation_id.to_string())
            .bind(sender_id)
            .fetch_optional(&mut *tx)
            .await?;
        if member.is_none() {
            let known: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conversations WHERE id=?")
                .bind(conversation_id.to_string())
                .fetch_optional(&mut *tx)
                .await?;
            if known.is_none() {
                return Err(ChatError::ConversationNotFound(conversation_id));
            }
            return Err(ChatError::NotParticipant {
                conversation: conversation_id,
                user: sender_id.to_owned(),
            });
        }

        let sent_at = now_millis();
        let id = sqlx::query("INSERT INTO messages (conversation_id,sender_id,content,sent_at,is_read) VALUES (?,?,?,?,0)")
            .bind(conversation_id.to_string())
            .bind(sender_id)
            .bind(content)
            .bind(sent_at)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();

        let sender_name: Option<(String,)> = sqlx::query_as("SELECT display_name FROM users WHERE id=?")
            .bind(sender_id)
            .fetch_optional(&mut *tx)
            .await?;

        tx.commit().await?;

        Ok(Message {
            id,
            conversation_id,
            sender_id: sender_id.to_owned(),
            sender_name: sender_name.map_or_else(|| ANONYMOUS.to_owned(), |(name,)| name),
            content: content.to_owned(),
            sent_at,
            is_read: false,
        })
    }

    /// Newest first, ordered by `(sent_at, id)` descending. `offset` walks
    /// backwards in time; callers wanting chronological order reverse the page.
    pub async fn page(&self, conversation_id: Uuid, limit: u32, offset: u32) -> ChatResult<Vec<Message>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let rows: Vec<MessageRow> = sqlx::query_as(
            "SELECT m.id, m.conversation_id, m.sender_id, COALESCE(u.display_name, ?), m.content, m.sent_at, m.is_read \
             FROM messages m LEFT JOIN users u ON u.id = m.sender_id \
             WHERE m.conversation_id = ? \
             ORDER BY m.sent_at DESC, m.id DESC \
             LIMIT ? OFFSET ?",
        )
        .bind(ANONYMOUS)
        .bind(conversation_id.to_string())
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.db.reader)
        .await?;

        rows.into_iter().map(into_message).collect()
    }

    /// Messages in the conversation that `user_id` did not send and has not read.
    pub async fn unread_count(&self, conversation_id: Uuid, user_id: &str) -> ChatResult<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM messages WHERE conversation_id=? AND sender_id != ? AND is_read = 0")
            .bind(conversation_id.to_string())
            .bind(user_id)
            .fetch_one(&self.db.reader)
            .await?;

        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{auth::ensure_user, conversations::Directory, db::test_pool};

    async fn setup() -> (tempfile::TempDir, MessageStore, Uuid) {
        let (dir, db) = test_pool().await;
        let conversation = Directory::new(db.clone())
            .get_or_create(&["alice".to_owned(), "bob".to_owned()])
            .await
            .unwrap();
        (dir, MessageStore::new(db), conversation)
    }

    #[tokio::test]
    async fn append_is_immediately_pageable() {
        let (_dir, store, conversation) = setup().await;

        let sent = store.append(conversation, "alice", "hello").await.unwrap();
        assert_eq!(sent.sender_name, ANONYMOUS);
        assert!(!sent.is_read);

        let page = store.page(conversation, 10, 0).await.unwrap();
        assert_eq!(page, [sent]);
    }

    #[tokio::test]
    async fn append_resolves_sender_name() {
        let (dir, db) = test_pool().await;
        let alias = ensure_user(&db, "alice").await.unwrap();
        let conversation = Directory::new(db.clone())
            .get_or_create(&["alice".to_owned(), "bob".to_owned()])
            .await
            .unwrap();

        let sent = MessageStore::new(db).append(conversation, "alice", "hi").await.unwrap();
        assert_eq!(sent.sender_name, alias);
        drop(dir);
    }

    #[tokio::test]
    async fn outsiders_cannot_append() {
        let (_dir, store, conversation) = setup().await;

        let err = store.append(conversation, "mallory", "let me in").await.unwrap_err();
        assert!(matches!(err, ChatError::NotParticipant { .. }));
        assert!(store.page(conversation, 10, 0).await.unwrap().is_empty());

        let unknown = Uuid::now_v7();
        assert!(matches!(
            store.append(unknown, "alice", "anyone there?").await,
            Err(ChatError::ConversationNotFound(id)) if id == unknown
        ));
    }

    #[tokio::test]
    async fn rejects_blank_and_oversized_content() {
        let (_dir, store, conversation) = setup().await;

        assert!(matches!(
            store.append(conversation, "alice", "  \n").await,
            Err(ChatError::InvalidInput(_))
        ));

        let long = "x".repeat(MAX_CONTENT_CHARS + 1);
        assert!(matches!(
            store.append(conversation, "alice", &long).await,
            Err(ChatError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn pages_are_contiguous_and_newest_first() {
        let (_dir, store, conversation) = setup().await;

        let mut sent = Vec::new();
        for i in 0..5 {
            let sender = if i % 2 == 0 { "alice" } else { "bob" };
            sent.push(store.append(conversation, sender, &format!("m{i}")).await.unwrap());
        }

        let first = store.page(conversation, 2, 0).await.unwrap();
        let second = store.page(conversation, 2, 2).await.unwrap();

        let ids: Vec<i64> = first.iter().chain(&second).map(|m| m.id).collect();
        let newest: Vec<i64> = sent.iter().rev().take(4).map(|m| m.id).collect();
        assert_eq!(ids, newest);

        let last = store.page(conversation, 2, 4).await.unwrap();
        assert_eq!(last.len(), 1);
        assert_eq!(last[0].content, "m0");

        assert!(store.page(conversation, 2, 10).await.unwrap().is_empty());
        assert!(store.page(conversation, 0, 0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unread_count_ignores_own_messages() {
        let (_dir, store, conversation) = setup().await;

        store.append(conversation, "alice", "one").await.unwrap();
        store.append(conversation, "alice", "two").await.unwrap();
        store.append(conversation, "bob", "three").await.unwrap();

        assert_eq!(store.unread_count(conversation, "bob").await.unwrap(), 2);
        assert_eq!(store.unread_count(conversation, "alice").await.unwrap(), 1);
    }
}
