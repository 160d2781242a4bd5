//! WebSocket gateway: one session per socket, snapshots pushed on change.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;
use validator::Validate;

use crate::error::{AppError, AppResult};
use crate::handlers::http::AppState;
use crate::models::event::{AvatarView, ClientMessage, MessageView, ServerEvent, SnapshotView};
use crate::models::position::{resolve_initial_position, share_query, Position};
use crate::services::SessionService;

type Outbox = mpsc::UnboundedSender<String>;

/// GET /ws?lat=..&lng=.. — upgrade to the gateway. The query picks the
/// starting position; anything missing or invalid uses the default.
pub async fn ws_handler(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let position = resolve_initial_position(&params);
    ws.on_upgrade(move |socket| handle_socket(state, socket, position))
}

pub fn generate_socket_id() -> String {
    format!("{}.{}", std::process::id(), Uuid::new_v4().as_simple())
}

async fn handle_socket(state: AppState, socket: WebSocket, position: Position) {
    let socket_id = generate_socket_id();
    let session = state.new_session();
    info!(socket_id = %socket_id, "ws connected");

    let (mut sender, mut receiver) = socket.split();

    let hello = ServerEvent::ConnectionEstablished {
        socket_id: socket_id.clone(),
        position,
        share_query: share_query(position),
        saved_display_name: session.saved_display_name(),
        tutorial_shown: session.tutorial_shown(),
    };
    let Ok(hello) = serde_json::to_string(&hello) else {
        return;
    };
    if sender.send(Message::Text(hello)).await.is_err() {
        return;
    }

    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sender.send(Message::Text(msg)).await.is_err() {
                break;
            }
        }
    });
    let push_task = tokio::spawn(push_snapshots(session.clone(), tx.clone()));

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                let result = match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => dispatch(&session, client_msg, position, &tx).await,
                    Err(e) => Err(AppError::Validation(format!("unrecognised event: {}", e))),
                };
                if let Err(e) = result {
                    debug!(socket_id = %socket_id, error = %e, "client event rejected");
                    send_event(
                        &tx,
                        &ServerEvent::Error {
                            message: e.to_string(),
                            code: e.code(),
                        },
                    );
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    push_task.abort();
    session.reset().await;
    send_task.abort();
    info!(socket_id = %socket_id, "ws disconnected");
}

async fn dispatch(
    session: &SessionService,
    msg: ClientMessage,
    initial_position: Position,
    tx: &Outbox,
) -> AppResult<()> {
    match msg {
        ClientMessage::SignIn { data } => {
            data.validate()
                .map_err(|e| AppError::Validation(e.to_string()))?;
            let position = data.position.unwrap_or(initial_position);
            let signed_in = match data.token.as_deref() {
                Some(token) => session.resume(&data.display_name, position, token).await?,
                None => session.sign_in(&data.display_name, position).await?,
            };
            send_event(
                tx,
                &ServerEvent::SignedIn {
                    user_id: signed_in.user_id,
                    display_name: signed_in.display_name,
                    login_epoch: signed_in.login_epoch,
                    token: signed_in.token,
                },
            );
        }
        ClientMessage::Send { data } => {
            data.validate()
                .map_err(|e| AppError::Validation(e.to_string()))?;
            session.send(&data.text).await?;
        }
        ClientMessage::Move { data } => {
            session
                .move_to(Position {
                    lat: data.lat,
                    lng: data.lng,
                })
                .await?;
        }
        ClientMessage::MarkRead { data } => session.mark_read(&data.id).await?,
        ClientMessage::Rename { data } => {
            data.validate()
                .map_err(|e| AppError::Validation(e.to_string()))?;
            session.set_display_name(&data.display_name).await?;
        }
        ClientMessage::TutorialShown => session.mark_tutorial_shown()?,
        ClientMessage::SignOut => session.reset().await,
        ClientMessage::Ping => {
            send_event(tx, &ServerEvent::Pong);
            return Ok(());
        }
    }
    send_event(tx, &snapshot(session).await);
    Ok(())
}

/// Push a fresh snapshot every time the session's derived view changes.
async fn push_snapshots(session: SessionService, tx: Outbox) {
    let mut changes = session.changes();
    while changes.changed().await.is_ok() {
        if !send_event(&tx, &snapshot(&session).await) {
            break;
        }
    }
}

/// Everything the client renders, built from the session's current state.
pub async fn snapshot(session: &SessionService) -> ServerEvent {
    let own_user_id = session.session().await.map(|s| s.user_id);
    let own = own_user_id.as_deref();
    let visible = session.visible_messages().await;
    let log = session.message_log().await;
    let presence = session.presence().await;

    ServerEvent::Snapshot(SnapshotView {
        phase: session.phase().await,
        in_range: session.is_in_range().await,
        unread_count: visible.len(),
        messages: visible
            .iter()
            .map(|m| MessageView::from_message(m, own))
            .collect(),
        log: log.iter().map(|m| MessageView::from_message(m, own)).collect(),
        avatars: presence
            .iter()
            .map(|e| AvatarView::from_entry(e, own))
            .collect(),
    })
}

fn send_event(tx: &Outbox, event: &ServerEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(payload) => tx.send(payload).is_ok(),
        Err(e) => {
            warn!(error = %e, "failed to encode server event");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::{AnonymousIdentity, JwtSecret};
    use crate::config::SyncSettings;
    use crate::models::event::{MarkReadPayload, SendPayload, SignInPayload};
    use crate::repositories::MemoryLog;
    use std::sync::Arc;

    fn state(log: &MemoryLog) -> AppState {
        AppState::new(
            Arc::new(log.clone()),
            Arc::new(AnonymousIdentity::new(
                JwtSecret::new("test-jwt-secret-min-32-chars!!!!!".to_string()).unwrap(),
            )),
            SyncSettings::default(),
        )
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        while let Ok(raw) = rx.try_recv() {
            out.push(serde_json::from_str(&raw).unwrap());
        }
        out
    }

    fn tokyo() -> Position {
        Position::new(35.6809591, 139.7673068).unwrap()
    }

    #[test]
    fn socket_ids_are_unique() {
        let a = generate_socket_id();
        let b = generate_socket_id();
        assert_ne!(a, b);
        assert!(a.starts_with(&format!("{}.", std::process::id())));
    }

    #[tokio::test]
    async fn sign_in_then_send_replies_with_events() {
        let log = MemoryLog::new();
        let session = state(&log).new_session();
        let (tx, mut rx) = mpsc::unbounded_channel();

        dispatch(
            &session,
            ClientMessage::SignIn {
                data: SignInPayload {
                    display_name: "Alice".to_string(),
                    position: None,
                    token: None,
                },
            },
            tokyo(),
            &tx,
        )
        .await
        .unwrap();
        let events = drain(&mut rx);
        assert_eq!(events[0]["event"], "signed_in");
        assert_eq!(events[1]["event"], "snapshot");
        assert_eq!(events[1]["data"]["phase"], "active");

        dispatch(
            &session,
            ClientMessage::Send {
                data: SendPayload {
                    text: "hello".to_string(),
                },
            },
            tokyo(),
            &tx,
        )
        .await
        .unwrap();
        assert_eq!(log.len().await, 2);
        assert_eq!(log.all().await[1].position, tokyo());
    }

    #[tokio::test]
    async fn events_before_sign_in_are_rejected() {
        let session = state(&MemoryLog::new()).new_session();
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = dispatch(
            &session,
            ClientMessage::MarkRead {
                data: MarkReadPayload {
                    id: "m1".to_string(),
                },
            },
            tokyo(),
            &tx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 4010);
    }

    #[tokio::test]
    async fn ping_gets_pong_only() {
        let session = state(&MemoryLog::new()).new_session();
        let (tx, mut rx) = mpsc::unbounded_channel();
        dispatch(&session, ClientMessage::Ping, tokyo(), &tx)
            .await
            .unwrap();
        let events = drain(&mut rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0]["event"], "pong");
    }

    #[tokio::test]
    async fn sign_in_with_a_token_keeps_the_user_id() {
        let log = MemoryLog::new();
        let app = state(&log);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sign_in = |token: Option<String>| ClientMessage::SignIn {
            data: SignInPayload {
                display_name: "Alice".to_string(),
                position: None,
                token,
            },
        };

        dispatch(&app.new_session(), sign_in(None), tokyo(), &tx)
            .await
            .unwrap();
        let first = drain(&mut rx).remove(0);
        let token = first["data"]["token"].as_str().unwrap().to_string();

        dispatch(&app.new_session(), sign_in(Some(token)), tokyo(), &tx)
            .await
            .unwrap();
        let second = drain(&mut rx).remove(0);
        assert_eq!(second["event"], "signed_in");
        assert_eq!(second["data"]["user_id"], first["data"]["user_id"]);

        let err = dispatch(
            &app.new_session(),
            sign_in(Some("stale".to_string())),
            tokyo(),
            &tx,
        )
        .await
        .unwrap_err();
        assert_eq!(err.code(), 4009);
    }
}
