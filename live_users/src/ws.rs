//! Realtime channel: one task per WebSocket connection.
//!
//! The task forwards every fanned-out [`ServerEvent`] to its client and feeds
//! client frames into the presence engine. Replies that concern only the
//! sender (`loginSuccess`, `loginError`, `error`) are written straight to
//! this socket and never broadcast.

use crate::{
    api::AppState,
    auth,
    directory::blocking,
    engine::Outcome,
    error::AuthError,
    housekeeping::spawn_sweeper,
    registry::ConnectionId,
};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use presence_api::{ClientEvent, ServerEvent};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tracing::{debug, error, warn};
use uuid::Uuid;

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(stream: WebSocket, state: AppState) {
    let conn = ConnectionId::new();
    let (mut sender, mut receiver) = stream.split();
    let mut events = BroadcastStream::new(state.engine.fanout().subscribe());
    let sweeper = spawn_sweeper(state.engine.clone(), state.config.presence.sweep_every);
    debug!(conn_id = %conn, "realtime connection opened");

    loop {
        tokio::select! {
            ev = events.next() => match ev {
                Some(Ok(ev)) => {
                    if send_event(&mut sender, &ev).await.is_err() {
                        break;
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(skipped))) => {
                    warn!(conn_id = %conn, skipped, "client lagging, events dropped");
                }
                None => break,
            },
            msg = receiver.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = dispatch(&state, conn, &text).await {
                        if send_event(&mut sender, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(conn_id = %conn, error = %e, "realtime transport error");
                    break;
                }
            },
        }
    }

    sweeper.abort();
    let outcome = state.engine.connection_closed(conn).await;
    debug!(conn_id = %conn, ?outcome, "realtime connection closed");
}

async fn send_event(
    sender: &mut SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    match event.to_json() {
        Ok(text) => sender.send(Message::Text(text)).await,
        Err(e) => {
            error!(error = %e, "serializing server event failed");
            Ok(())
        }
    }
}

/// Apply one client frame. Returns the reply meant for this client only.
async fn dispatch(state: &AppState, conn: ConnectionId, text: &str) -> Option<ServerEvent> {
    let event = match ClientEvent::parse(text) {
        Ok(ev) => ev,
        Err(e) => {
            warn!(conn_id = %conn, error = %e, "malformed realtime frame");
            return Some(ServerEvent::Error {
                message: format!("malformed event: {e}"),
            });
        }
    };
    let engine = &state.engine;
    match event {
        ClientEvent::Login { login_id, password } => {
            match auth::authenticate(&state.directory, &login_id, &password).await {
                Ok(account) => {
                    if engine.login(account.id(), Some(conn)).await == Outcome::Failed {
                        return Some(ServerEvent::LoginError {
                            message: "Login failed".into(),
                        });
                    }
                    Some(ServerEvent::LoginSuccess {
                        user_id: account.user.id,
                        first_name: account.user.first_name,
                        last_name: account.user.last_name,
                    })
                }
                Err(AuthError::InvalidCredentials) => {
                    debug!(conn_id = %conn, "realtime login rejected");
                    Some(ServerEvent::LoginError {
                        message: "Invalid credentials".into(),
                    })
                }
                Err(e) => {
                    error!(conn_id = %conn, error = %e, "realtime login failed");
                    Some(ServerEvent::LoginError {
                        message: "Login failed".into(),
                    })
                }
            }
        }
        ClientEvent::Connect { user_id } => {
            let outcome = engine.connect(user_id, conn).await;
            unknown_user_reply(state, user_id, outcome).await
        }
        ClientEvent::Registered { user_data } => {
            let outcome = engine.register(user_data.id, Some(conn)).await;
            unknown_user_reply(state, user_data.id, outcome).await
        }
        ClientEvent::UpdateStatus { user_id, status } => {
            let outcome = engine.update_status(user_id, status).await;
            unknown_user_reply(state, user_id, outcome).await
        }
        ClientEvent::Disconnect { user_id } => {
            engine.disconnect(user_id, conn).await;
            None
        }
        ClientEvent::Heartbeat { user_id } => {
            engine.heartbeat(user_id, conn).await;
            None
        }
    }
}

/// An ignored write means either a newer write won or the user does not
/// exist; only the latter is worth telling the client about.
async fn unknown_user_reply(state: &AppState, user: Uuid, outcome: Outcome) -> Option<ServerEvent> {
    if outcome != Outcome::Ignored {
        return None;
    }
    match blocking(&state.directory, move |d| d.find_by_id(&user)).await {
        Ok(None) => {
            warn!(user_id = %user, "realtime event for unknown user");
            Some(ServerEvent::Error {
                message: "User not found".into(),
            })
        }
        Ok(Some(_)) => None,
        Err(e) => {
            error!(user_id = %user, error = %e, "user lookup failed");
            None
        }
    }
}
