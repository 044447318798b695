use std::collections::HashMap;

use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    db::{is_unique_violation, now_millis, DatabasePool},
    error::{ChatError, ChatResult},
};

use super::parse_id;

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationSummary {
    pub id: Uuid,
    pub created_at: i64,
    pub participants: Vec<String>,
    pub last_message_at: Option<i64>,
    pub last_message: Option<String>,
    pub unread_count: i64,
}

/// Creates conversations and answers membership questions.
#[derive(Clone)]
pub struct Directory {
    db: DatabasePool,
}

/// Canonical key for an unordered pair. Length-prefixed so that no two
/// distinct pairs can encode to the same string.
fn direct_key(a: &str, b: &str) -> String {
    let (a, b) = if a <= b { (a, b) } else { (b, a) };
    format!("{}:{a}{b}", a.len())
}

fn normalize(participants: &[String]) -> ChatResult<Vec<String>> {
    let mut members: Vec<String> = participants
        .iter()
        .map(|p| p.trim().to_owned())
        .collect();

    if members.iter().any(String::is_empty) {
        return Err(ChatError::InvalidInput("participant ids must not be blank".to_owned()));
    }

    members.sort();
    members.dedup();

    if members.len() < 2 {
        return Err(ChatError::InvalidInput(
            "a conversation needs at least two distinct participants".to_owned(),
        ));
    }

    Ok(members)
}

impl Directory {
    pub fn new(db: DatabasePool) -> Self {
        Self { db }
    }

    /// Returns the conversation for exactly these participants, creating it
    /// if needed. Two-party conversations are deduplicated: callers racing on
    /// the same pair all get the same id back.
    pub async fn get_or_create(&self, participants: &[String]) -> ChatResult<Uuid> {
        let members = normalize(participants)?;

        let Some(key) = (members.len() == 2).then(|| direct_key(&members[0], &members[1])) else {
            return self.insert(&members, None).await;
        };

        if let Some(id) = self.lookup_direct(&key).await? {
            return Ok(id);
        }

        self.insert(&members, Some(&key)).await
    }

    pub async fn find_direct(&self, a: &str, b: &str) -> ChatResult<Option<Uuid>> {
        if a == b {
            return Ok(None);
        }
        self.lookup_direct(&direct_key(a, b)).await
    }

    async fn lookup_direct(&self, key: &str) -> ChatResult<Option<Uuid>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT id FROM conversations WHERE direct_key=?")
            .bind(key)
            .fetch_optional(&self.db.reader)
            .await?;

        row.map(|(id,)| parse_id(&id)).transpose()
    }

    /// Reads the committed winner of a two-party race straight off the writer.
    async fn winner(&self, key: &str) -> ChatResult<Uuid> {
        let (id,): (String,) = sqlx::query_as("SELECT id FROM conversations WHERE direct_key=?")
            .bind(key)
            .fetch_one(&self.db.writer)
            .await?;

        parse_id(&id)
    }

    /// Inserts a conversation. For a two-party set the `direct_key` unique
    /// constraint decides races: the loser rolls back and returns the winner.
    pub(crate) async fn insert(&self, members: &[String], key: Option<&str>) -> ChatResult<Uuid> {
        let id = Uuid::now_v7();
        let now = now_millis();

        let mut tx = self.db.writer.begin().await?;

        let inserted = sqlx::query("INSERT INTO conversations (id,created_at,direct_key) VALUES (?,?,?)")
            .bind(id.to_string())
            .bind(now)
            .bind(key)
            .execute(&mut *tx)
            .await;

        match (inserted, key) {
            (Err(err), Some(key)) if is_unique_violation(&err) => {
                tx.rollback().await?;
                debug!(%key, "lost conversation creation race");
                return self.winner(key).await;
            }
            (Err(err), _) => return Err(err.into()),
            (Ok(_), _) => {}
        }

        for member in members {
            sqlx::query("INSERT INTO conversation_participants (conversation_id,user_id,joined_at) VALUES (?,?,?)")
                .bind(id.to_string())
                .bind(member)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;

        info!(conversation = %id, participants = ?members, "conversation created");
        Ok(id)
    }

    async fn exists(&self, conversation_id: Uuid) -> ChatResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conversations WHERE id=?")
            .bind(conversation_id.to_string())
            .fetch_optional(&self.db.reader)
            .await?;

        Ok(row.is_some())
    }

    pub async fn is_participant(&self, conversation_id: Uuid, user_id: &str) -> ChatResult<bool> {
        let row: Option<(i64,)> = sqlx::query_as("SELECT 1 FROM conversation_participants WHERE conversation_id=? AND user_id=?")
            .bind(conversation_id.to_string())
            .bind(user_id)
            .fetch_optional(&self.db.reader)
            .await?;

        Ok(row.is_some())
    }

    /// Fails with `NotParticipant` unless `user_id` belongs to the conversation,
    /// or `ConversationNotFound` if there is no such conversation.
    pub async fn authorize(&self, conversation_id: Uuid, user_id: &str) -> ChatResult<()> {
        if self.is_participant(conversation_id, user_id).await? {
            return Ok(());
        }
        if !self.exists(conversation_id).await? {
            return Err(ChatError::ConversationNotFound(conversation_id));
        }
        Err(ChatError::NotParticipant {
            conversation: conversation_id,
            user: user_id.to_owned(),
        })
    }

    pub async fn participants(&self, conversation_id: Uuid) -> ChatResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as("SELECT user_id FROM conversation_participants WHERE conversation_id=? ORDER BY user_id")
            .bind(conversation_id.to_string())
            .fetch_all(&self.db.reader)
            .await?;

        Ok(rows.into_iter().map(|(user_id,)| user_id).collect())
    }

    /// Everyone who shares at least one conversation with `user_id`.
    pub async fn partners(&self, user_id: &str) -> ChatResult<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            "SELECT DISTINCT other.user_id FROM conversation_participants me \
             JOIN conversation_participants other ON other.conversation_id = me.conversation_id \
             WHERE me.user_id = ? AND other.user_id != ? ORDER BY other.user_id",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.db.reader)
        .await?;

        Ok(rows.into_iter().map(|(user_id,)| user_id).collect())
    }

    /// Conversations of `user_id`, most recently active first. Conversations
    /// without messages come last.
    pub async fn list_for_user(&self, user_id: &str) -> ChatResult<Vec<ConversationSummary>> {
        let rows: Vec<(String, i64, Option<i64>, Option<String>, i64)> = sqlx::query_as(
            "SELECT c.id, c.created_at, \
                (SELECT MAX(m.sent_at) FROM messages m WHERE m.conversation_id = c.id) AS last_at, \
                (SELECT m.content FROM messages m WHERE m.conversation_id = c.id ORDER BY m.sent_at DESC, m.id DESC LIMIT 1), \
                (SELECT COUNT(*) FROM messages m WHERE m.conversation_id = c.id AND m.sender_id != ? AND m.is_read = 0) \
             FROM conversations c \
             JOIN conversation_participants p ON p.conversation_id = c.id \
             WHERE p.user_id = ? \
             ORDER BY last_at IS NULL, last_at DESC, c.created_at DESC, c.id DESC",
        )
        .bind(user_id)
        .bind(user_id)
        .fetch_all(&self.db.reader)
        .await?;

        let members: Vec<(String, String)> = sqlx::query_as(
            "SELECT conversation_id, user_id FROM conversation_participants \
             WHERE conversation_id IN (SELECT conversation_id FROM conversation_participants WHERE user_id = ?) \
             ORDER BY user_id",
        )
        .bind(user_id)
        .fetch_all(&self.db.reader)
        .await?;

        let mut by_conversation: HashMap<String, Vec<String>> = HashMap::new();
        for (conversation_id, member) in members {
            by_conversation.entry(conversation_id).or_default().push(member);
        }

        rows.into_iter()
            .map(|(id, created_at, last_message_at, last_message, unread_count)| {
                Ok(ConversationSummary {
                    participants: by_conversation.remove(&id).unwrap_or_default(),
                    id: parse_id(&id)?,
                    created_at,
                    last_message_at,
                    last_message,
                    unread_count,
                })
            })
            .collect()
    }
}
