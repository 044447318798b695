mod delivery;
mod envelope;
mod hub;
mod presence;
mod ws;

use axum::{debug_handler, extract::{Path, State}, routing::get, Json, Router};
use serde::Serialize;
use tower_sessions::Session;

use crate::{session, AppResult, AppState};

pub use delivery::{Delivery, Target};
pub use envelope::{ClientEnvelope, ServerEnvelope};
pub use hub::{Connection, ConnectionId, Hub, Outbox};
pub use presence::{PresenceStatus, PresenceTracker};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/ws", get(ws::connect))
        .route("/api/presence/{user_id}", get(presence))
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct PresenceView {
    user_id: String,
    status: PresenceStatus,
}

#[debug_handler(state = AppState)]
pub(crate) async fn presence(
    Path(user_id): Path<String>,
    State(hub): State<Hub>,
    session: Session,
) -> AppResult<Json<PresenceView>> {
    session::current_user(&session).await?;

    let status = hub.status(&user_id);
    Ok(Json(PresenceView { user_id, status }))
}
