mod api;
mod directory;
mod messages;
mod receipts;

use axum::{routing::{get, post}, Router};
use uuid::Uuid;

use crate::{error::{ChatError, ChatResult}, AppState};

pub use directory::{ConversationSummary, Directory};
pub use messages::{Message, MessageStore, MAX_CONTENT_CHARS};
pub(crate) use messages::validate_content;
pub use receipts::Receipts;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/conversations", get(api::list).post(api::create))
        .route("/conversations/{id}/messages", get(api::history).post(api::send))
        .route("/conversations/{id}/read", post(api::mark_read))
        .route("/conversations/{id}/unread", get(api::unread))
        .route("/unread", get(api::unread_total))
}

pub(crate) fn parse_id(raw: &str) -> ChatResult<Uuid> {
    Uuid::parse_str(raw).map_err(|err| ChatError::Storage(sqlx::Error::Decode(Box::new(err))))
}
