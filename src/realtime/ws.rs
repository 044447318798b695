use std::{sync::Arc, time::Duration};

use axum::{
    body::Bytes,
    debug_handler,
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use parking_lot::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tower_sessions::Session;
use tracing::{debug, error, info, warn};

use crate::{auth, error::ChatError, session, AppResult, AppState};

use super::{
    envelope::{self, ClientEnvelope, ServerEnvelope},
    hub::{Connection, Outbox},
};

/// How long the writer gets to flush its close frame once the reader is done.
const WRITER_GRACE: Duration = Duration::from_secs(5);

type Sink = SplitSink<WebSocket, Message>;
type Stream = SplitStream<WebSocket>;

/// When the peer was last heard from, shared by the reader and the writer.
#[derive(Clone)]
struct Liveness(Arc<Mutex<Instant>>);

impl Liveness {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Instant::now())))
    }

    fn mark(&self) {
        *self.0.lock() = Instant::now();
    }

    fn idle(&self) -> Duration {
        self.0.lock().elapsed()
    }
}

#[debug_handler(state = AppState)]
pub async fn connect(
    State(state): State<AppState>,
    session: Session,
    ws: WebSocketUpgrade,
) -> AppResult<Response> {
    let user_id = session::user_id(&session).await?;

    Ok(ws.on_upgrade(move |socket| serve(state, socket, user_id)))
}

async fn serve(state: AppState, socket: WebSocket, user_id: Option<String>) {
    let (mut sink, mut stream) = socket.split();

    let user_id = match user_id {
        Some(user_id) => user_id,
        None => match authenticate(&state, &mut sink, &mut stream).await {
            Some(user_id) => user_id,
            None => {
                let _ = sink.send(Message::Close(None)).await;
                return;
            }
        },
    };

    if let Err(err) = auth::ensure_user(&state.db, &user_id).await {
        error!(user = %user_id, error = %err, "could not load user, dropping connection");
        let _ = sink.send(Message::Close(None)).await;
        return;
    }

    let (connection, outbox) = Connection::open(state.config.outbound_queue);
    let liveness = Liveness::new();
    state.hub.register(&user_id, connection.clone()).await;

    let mut writer = tokio::spawn(write_loop(
        sink,
        outbox,
        liveness.clone(),
        state.config.ping_interval,
        state.config.pong_timeout,
    ));

    read_loop(&state, &user_id, &connection, &mut stream, &liveness).await;

    connection.close();
    state.hub.unregister(&user_id, connection.id()).await;

    if tokio::time::timeout(WRITER_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }

    info!(user = %user_id, connection = connection.id(), "disconnected");
}

/// Waits for an `auth` frame carrying a ticket. Anything else before that is
/// answered with an error and otherwise ignored.
async fn authenticate(state: &AppState, sink: &mut Sink, stream: &mut Stream) -> Option<String> {
    let deadline = tokio::time::sleep(state.config.auth_timeout);
    tokio::pin!(deadline);

    loop {
        let frame = tokio::select! {
            _ = &mut deadline => {
                debug!("socket never authenticated");
                return None;
            }
            frame = stream.next() => frame,
        };

        let text = match frame {
            Some(Ok(Message::Text(text))) => text,
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
            Some(Ok(_)) => continue,
        };

        match ClientEnvelope::parse(text.as_str()) {
            Ok(ClientEnvelope::Auth { token }) => {
                if let Some(user_id) = state.tickets.redeem(&token) {
                    return Some(user_id);
                }
                warn!("rejected websocket ticket");
                reply(sink, "invalid or expired token").await;
                return None;
            }
            Ok(_) => reply(sink, "authenticate first").await,
            Err(err) => debug!(error = %err, "dropping malformed frame"),
        }
    }
}

async fn reply(sink: &mut Sink, message: &str) {
    let event = ServerEnvelope::Error { message: message.to_owned() };
    if let Ok(text) = serde_json::to_string(&event) {
        let _ = sink.send(Message::Text(text.into())).await;
    }
}

async fn read_loop(
    state: &AppState,
    user_id: &str,
    connection: &Connection,
    stream: &mut Stream,
    liveness: &Liveness,
) {
    loop {
        let frame = tokio::select! {
            _ = connection.closed() => break,
            frame = stream.next() => frame,
        };

        let frame = match frame {
            Some(Ok(frame)) => frame,
            Some(Err(err)) => {
                debug!(user = %user_id, error = %err, "transport error");
                break;
            }
            None => break,
        };

        liveness.mark();

        match frame {
            Message::Text(text) => {
                state.hub.touch(user_id).await;
                match ClientEnvelope::parse(text.as_str()) {
                    Ok(envelope) => handle(state, user_id, connection, envelope).await,
                    Err(err) => warn!(user = %user_id, error = %err, "dropping malformed envelope"),
                }
            }
            Message::Binary(_) => {
                state.hub.touch(user_id).await;
                debug!(user = %user_id, "dropping binary frame");
            }
            Message::Ping(_) | Message::Pong(_) => state.hub.heartbeat(user_id).await,
            Message::Close(_) => break,
        }
    }
}

async fn handle(state: &AppState, user_id: &str, connection: &Connection, envelope: ClientEnvelope) {
    let result = match envelope {
        ClientEnvelope::Auth { .. } => {
            debug!(user = %user_id, "ignoring auth on an authenticated socket");
            Ok(())
        }
        ClientEnvelope::Message { recipient_id, conversation_id, content } => {
            match envelope::target(conversation_id, recipient_id) {
                Ok(target) => state
                    .delivery
                    .send(user_id, target, &content)
                    .await
                    .map(|message| {
                        connection.offer(ServerEnvelope::MessageSent(message));
                    }),
                Err(err) => Err(err),
            }
        }
        ClientEnvelope::TypingStart { recipient_id, conversation_id } => {
            typing(state, user_id, conversation_id, recipient_id, true).await
        }
        ClientEnvelope::TypingStop { recipient_id, conversation_id } => {
            typing(state, user_id, conversation_id, recipient_id, false).await
        }
        ClientEnvelope::StatusUpdate { status } => {
            state.hub.set_status(user_id, status).await;
            Ok(())
        }
        ClientEnvelope::MarkRead { conversation_id } => state
            .delivery
            .mark_read(conversation_id, user_id)
            .await
            .map(|_| ()),
    };

    let Err(err) = result else {
        return;
    };

    let message = match &err {
        ChatError::Storage(_) => {
            error!(user = %user_id, error = %err, "request failed");
            "internal error".to_owned()
        }
        _ => {
            debug!(user = %user_id, error = %err, "request rejected");
            err.to_string()
        }
    };
    connection.offer(ServerEnvelope::Error { message });
}

async fn typing(
    state: &AppState,
    user_id: &str,
    conversation_id: Option<uuid::Uuid>,
    recipient_id: Option<String>,
    started: bool,
) -> Result<(), ChatError> {
    let target = envelope::target(conversation_id, recipient_id)?;
    state.delivery.typing(user_id, target, started).await?;
    Ok(())
}

/// Owns the socket's sending half. Drains the outbound queue and pings on a
/// fixed cadence; a peer silent for longer than `pong_timeout` is dropped.
async fn write_loop(
    mut sink: Sink,
    mut outbox: Outbox,
    liveness: Liveness,
    ping_interval: Duration,
    pong_timeout: Duration,
) {
    let mut ping = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = outbox.closed.cancelled() => break,
            event = outbox.rx.recv() => {
                let Some(event) = event else { break };
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(err) => {
                        error!(error = %err, "failed to encode event");
                        continue;
                    }
                };
                if sink.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            _ = ping.tick() => {
                if liveness.idle() > pong_timeout {
                    info!("peer went silent, closing");
                    break;
                }
                if sink.send(Message::Ping(Bytes::new())).await.is_err() {
                    break;
                }
            }
        }
    }

    outbox.closed.cancel();
    let _ = sink.send(Message::Close(None)).await;
}
