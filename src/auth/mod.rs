use axum::{routing::post, Router};
use rand::seq::IndexedRandom;
use tracing::info;

use crate::{db::{now_millis, DatabasePool}, AppState};

mod ticket;

pub use ticket::{issue_ticket, TicketStore};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/ws/ticket", post(issue_ticket))
}

const ADJECTIVES: [&str; 25] = [
    "Quick", "Lazy", "Mysterious", "Jolly", "Brave", "Silent", "Witty", "Fierce",
    "Clever", "Gentle", "Wild", "Calm", "Bold", "Shy", "Proud", "Happy", "Sad",
    "Eager", "Fancy", "Rusty", "Golden", "Silver", "Bright", "Dark", "Lucky",
];

const NOUNS: [&str; 24] = [
    "Fox", "Bear", "Eagle", "Wolf", "Dragon", "Tiger", "Lion", "Owl", "Rabbit",
    "Falcon", "Hawk", "Shark", "Panda", "Kitten", "Puppy", "Phoenix", "Griffin",
    "Unicorn", "Turtle", "Dolphin", "Whale", "Elephant", "Giraffe", "Zebra",
];

pub(crate) fn random_alias() -> String {
    let mut rng = rand::rng();
    format!(
        "{} {}",
        ADJECTIVES.choose(&mut rng).copied().unwrap_or("Nameless"),
        NOUNS.choose(&mut rng).copied().unwrap_or("User"),
    )
}

/// Makes sure an identity handed to us by the login collaborator has a
/// display name, inventing one the first time it is seen.
pub async fn ensure_user(db: &DatabasePool, user_id: &str) -> Result<String, sqlx::Error> {
    let inserted = sqlx::query("INSERT INTO users (id,display_name,created_at) VALUES (?,?,?) ON CONFLICT(id) DO NOTHING")
        .bind(user_id)
        .bind(random_alias())
        .bind(now_millis())
        .execute(&db.writer)
        .await?
        .rows_affected();

    let (display_name,): (String,) = sqlx::query_as("SELECT display_name FROM users WHERE id=?")
        .bind(user_id)
        .fetch_one(&db.writer)
        .await?;

    if inserted > 0 {
        info!(user = %user_id, alias = %display_name, "new user");
    }

    Ok(display_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    #[tokio::test]
    async fn ensure_user_is_stable() {
        let (_dir, db) = test_pool().await;

        let first = ensure_user(&db, "alice").await.unwrap();
        let second = ensure_user(&db, "alice").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.split(' ').count(), 2);
    }
}
