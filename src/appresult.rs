use axum::{http::StatusCode, response::{IntoResponse, Response}};
use tracing::error;

use crate::error::ChatError;

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug)]
pub struct AppError(pub anyhow::Error);

impl AppError {
    fn status(&self) -> StatusCode {
        match self.0.downcast_ref::<ChatError>() {
            Some(ChatError::NotParticipant { .. }) => StatusCode::FORBIDDEN,
            Some(ChatError::ConversationNotFound(_)) => StatusCode::NOT_FOUND,
            Some(ChatError::InvalidInput(_)) => StatusCode::BAD_REQUEST,
            Some(ChatError::Unauthenticated) => StatusCode::UNAUTHORIZED,
            Some(ChatError::Storage(_)) | None => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = ?self.0, "request failed");
            return (status, "internal error").into_response();
        }

        (status, self.0.to_string()).into_response()
    }
}

impl<E> From<E> for AppError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    #[test]
    fn maps_chat_errors_to_status() {
        let forbidden = AppError::from(ChatError::NotParticipant {
            conversation: Uuid::nil(),
            user: "mallory".to_owned(),
        });
        assert_eq!(forbidden.into_response().status(), StatusCode::FORBIDDEN);

        let bad = AppError::from(ChatError::InvalidInput("empty".to_owned()));
        assert_eq!(bad.into_response().status(), StatusCode::BAD_REQUEST);

        let anon = AppError::from(ChatError::Unauthenticated);
        assert_eq!(anon.into_response().status(), StatusCode::UNAUTHORIZED);
    }

    #[test]
    fn other_errors_are_internal() {
        let err = AppError::from(anyhow::anyhow!("boom"));
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
