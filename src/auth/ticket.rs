use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{debug_handler, extract::State, Json};
use parking_lot::Mutex;
use rand::{distr::Alphanumeric, Rng};
use serde::Serialize;
use tokio::time::Instant;
use tower_sessions::Session;

use crate::{session, AppResult, AppState};

const TICKET_LEN: usize = 32;

struct Ticket {
    user_id: String,
    expires_at: Instant,
}

/// Single-use tokens that let a websocket prove which session opened it.
#[derive(Clone)]
pub struct TicketStore {
    tickets: Arc<Mutex<HashMap<String, Ticket>>>,
    ttl: Duration,
}

impl TicketStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            tickets: Arc::default(),
            ttl,
        }
    }

    pub fn issue(&self, user_id: &str) -> String {
        let token: String = rand::rng()
            .sample_iter(&Alphanumeric)
            .take(TICKET_LEN)
            .map(char::from)
            .collect();

        let now = Instant::now();
        let mut tickets = self.tickets.lock();
        tickets.retain(|_, ticket| ticket.expires_at > now);
        tickets.insert(
            token.clone(),
            Ticket {
                user_id: user_id.to_owned(),
                expires_at: now + self.ttl,
            },
        );

        token
    }

    pub fn redeem(&self, token: &str) -> Option<String> {
        let ticket = self.tickets.lock().remove(token)?;
        (ticket.expires_at > Instant::now()).then_some(ticket.user_id)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TicketResponse {
    ticket: String,
    expires_in_secs: u64,
}

#[debug_handler(state = AppState)]
pub async fn issue_ticket(
    State(tickets): State<TicketStore>,
    session: Session,
) -> AppResult<Json<TicketResponse>> {
    let user_id = session::current_user(&session).await?;

    Ok(Json(TicketResponse {
        ticket: tickets.issue(&user_id),
        expires_in_secs: tickets.ttl.as_secs(),
    }))
}
