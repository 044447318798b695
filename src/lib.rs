pub mod appresult;
pub mod auth;
pub mod config;
pub mod conversations;
pub mod db;
pub mod error;
pub mod realtime;
pub mod session;

use std::sync::Arc;

use axum::{extract::FromRef, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

pub use appresult::{AppError, AppResult};
pub use config::Config;

use auth::TicketStore;
use conversations::{Directory, MessageStore, Receipts};
use db::DatabasePool;
use realtime::{Delivery, Hub, PresenceTracker};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub config: Arc<Config>,
    pub db: DatabasePool,
    pub directory: Directory,
    pub messages: MessageStore,
    pub receipts: Receipts,
    pub hub: Hub,
    pub delivery: Delivery,
    pub tickets: TicketStore,
}

impl AppState {
    pub fn new(config: Config, db: DatabasePool) -> Self {
        let directory = Directory::new(db.clone());
        let messages = MessageStore::new(db.clone());
        let receipts = Receipts::new(db.clone());
        let hub = Hub::new(
            directory.clone(),
            PresenceTracker::new(db.clone(), config.presence_ttl),
        );
        let delivery = Delivery::new(directory.clone(), messages.clone(), receipts.clone(), hub.clone());
        let tickets = TicketStore::new(config.ticket_ttl);

        Self {
            config: Arc::new(config),
            db,
            directory,
            messages,
            receipts,
            hub,
            delivery,
            tickets,
        }
    }
}

/// Every route, without the session layer (the caller picks the store).
pub fn app(state: AppState) -> Router {
    Router::new()
        .nest("/api", conversations::router())
        .merge(realtime::router())
        .merge(auth::router())
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
