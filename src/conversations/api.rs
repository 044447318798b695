use axum::{debug_handler, extract::{Path, Query, State}, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use tower_sessions::Session;
use uuid::Uuid;

use crate::{
    auth,
    db::DatabasePool,
    realtime::{Delivery, Target},
    session, AppResult, AppState,
};

use super::{ConversationSummary, Directory, Message, MessageStore, Receipts};

const DEFAULT_PAGE: u32 = 50;
const MAX_PAGE: u32 = 100;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CreateConversation {
    participant_ids: Vec<String>,
}

#[derive(Serialize)]
pub(crate) struct Created {
    id: Uuid,
}

#[derive(Deserialize)]
pub(crate) struct PageQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[derive(Deserialize)]
pub(crate) struct SendMessage {
    content: String,
}

#[derive(Serialize)]
pub(crate) struct Count {
    count: i64,
}

#[derive(Serialize)]
pub(crate) struct Marked {
    marked: u64,
}

#[debug_handler(state = AppState)]
pub(crate) async fn list(
    State(directory): State<Directory>,
    session: Session,
) -> AppResult<Json<Vec<ConversationSummary>>> {
    let user_id = session::current_user(&session).await?;
    Ok(Json(directory.list_for_user(&user_id).await?))
}

#[debug_handler(state = AppState)]
pub(crate) async fn create(
    State(directory): State<Directory>,
    State(db): State<DatabasePool>,
    session: Session,
    Json(CreateConversation { mut participant_ids }): Json<CreateConversation>,
) -> AppResult<Json<Created>> {
    let user_id = session::current_user(&session).await?;
    auth::ensure_user(&db, &user_id).await?;

    participant_ids.push(user_id);
    let id = directory.get_or_create(&participant_ids).await?;

    Ok(Json(Created { id }))
}

/// Newest first. Viewing the latest page counts as reading the conversation.
#[debug_handler(state = AppState)]
pub(crate) async fn history(
    Path(conversation_id): Path<Uuid>,
    Query(PageQuery { limit, offset }): Query<PageQuery>,
    State(directory): State<Directory>,
    State(messages): State<MessageStore>,
    State(delivery): State<Delivery>,
    session: Session,
) -> AppResult<Json<Vec<Message>>> {
    let user_id = session::current_user(&session).await?;
    directory.authorize(conversation_id, &user_id).await?;

    let limit = limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE);
    let offset = offset.unwrap_or(0);
    let page = messages.page(conversation_id, limit, offset).await?;

    if offset == 0 {
        delivery.mark_read(conversation_id, &user_id).await?;
    }

    Ok(Json(page))
}

/// For clients without a live socket. Goes through the same pipeline.
#[debug_handler(state = AppState)]
pub(crate) async fn send(
    Path(conversation_id): Path<Uuid>,
    State(delivery): State<Delivery>,
    State(db): State<DatabasePool>,
    session: Session,
    Json(SendMessage { content }): Json<SendMessage>,
) -> AppResult<(StatusCode, Json<Message>)> {
    let user_id = session::current_user(&session).await?;
    auth::ensure_user(&db, &user_id).await?;

    let message = delivery
        .send(&user_id, Target::Conversation(conversation_id), &content)
        .await?;

    Ok((StatusCode::CREATED, Json(message)))
}

#[debug_handler(state = AppState)]
pub(crate) async fn mark_read(
    Path(conversation_id): Path<Uuid>,
    State(delivery): State<Delivery>,
    session: Session,
) -> AppResult<Json<Marked>> {
    let user_id = session::current_user(&session).await?;
    let marked = delivery.mark_read(conversation_id, &user_id).await?;
    Ok(Json(Marked { marked }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn unread(
    Path(conversation_id): Path<Uuid>,
    State(directory): State<Directory>,
    State(messages): State<MessageStore>,
    session: Session,
) -> AppResult<Json<Count>> {
    let user_id = session::current_user(&session).await?;
    directory.authorize(conversation_id, &user_id).await?;

    let count = messages.unread_count(conversation_id, &user_id).await?;
    Ok(Json(Count { count }))
}

#[debug_handler(state = AppState)]
pub(crate) async fn unread_total(
    State(receipts): State<Receipts>,
    session: Session,
) -> AppResult<Json<Count>> {
    let user_id = session::current_user(&session).await?;
    let count = receipts.unread_total(&user_id).await?;
    Ok(Json(Count { count }))
}
