use tower_sessions::Session;

use crate::{error::ChatError, AppResult};

/// Written by the login collaborator once it has resolved who the caller is.
pub const USER_ID: &str = "user_id";

pub async fn user_id(session: &Session) -> AppResult<Option<String>> {
    Ok(session.get::<String>(USER_ID).await?)
}

pub async fn current_user(session: &Session) -> AppResult<String> {
    let Some(user_id) = user_id(session).await? else {
        return Err(ChatError::Unauthenticated.into());
    };
    Ok(user_id)
}
