#![allow(dead_code)]

use std::{net::SocketAddr, time::Duration};

use axum::{extract::Path, routing::post, Router};
use tower_sessions::{MemoryStore, Session, SessionManagerLayer};
use whispers::{app, db::DatabasePool, session::USER_ID, AppState, Config};

pub async fn state() -> (tempfile::TempDir, AppState) {
    state_with(Config::default()).await
}

pub async fn state_with(config: Config) -> (tempfile::TempDir, AppState) {
    let dir = tempfile::tempdir().unwrap();
    let url = format!("sqlite://{}?mode=rwc", dir.path().join("chat.db").display());
    let db = DatabasePool::connect(&url, 4).await.unwrap();
    (dir, AppState::new(config, db))
}

/// Stands in for the login flow: puts `user` into the caller's session.
async fn login(session: Session, Path(user): Path<String>) {
    session.insert(USER_ID, user).await.unwrap();
}

pub fn router(state: AppState) -> Router {
    app(state)
        .route("/login/{user}", post(login))
        .layer(SessionManagerLayer::new(MemoryStore::default()).with_secure(false))
}

pub async fn serve(state: AppState) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let router = router(state);
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}

/// Polls `check` until it holds, failing the test after two seconds.
pub async fn eventually(what: &str, check: impl Fn() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
