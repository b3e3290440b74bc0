use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use parley_core::ids::{ParticipantId, SessionId};
use parley_core::wire::{ClientMessage, ServerEvent};

use crate::handlers::handle_message;
use crate::server::AppState;

const CONNECT_DEADLINE: Duration = Duration::from_secs(10);
const PING_INTERVAL: Duration = Duration::from_secs(30);

pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Drive one participant's connection from handshake to teardown. The
/// first frame must be `connect`; everything after flows through the
/// session registry. Teardown always removes the participant, which is
/// what forces a held lock open when a holder's socket dies.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sink, mut stream) = socket.split();

    let (session_id, name) =
        match tokio::time::timeout(CONNECT_DEADLINE, read_connect(&mut stream)).await {
            Ok(Some(parts)) => parts,
            Ok(None) => return,
            Err(_) => {
                tracing::debug!("socket closed, no connect within deadline");
                let _ = sink.close().await;
                return;
            }
        };

    let participant_id = ParticipantId::new();
    let (tx, mut rx) = mpsc::channel::<ServerEvent>(state.config.max_send_queue);

    if let Err(e) = state
        .registry
        .admit(&session_id, &participant_id, &name, tx.clone())
        .await
    {
        tracing::error!(session_id = %session_id, error = %e, "admission failed");
        let _ = send_event(
            &mut sink,
            &ServerEvent::ProtocolError {
                message: "failed to open session".into(),
            },
        )
        .await;
        let _ = sink.close().await;
        return;
    }

    let _ = tx
        .send(ServerEvent::Connected {
            session_id: session_id.clone(),
            participant_id: participant_id.clone(),
        })
        .await;

    // Writer owns the sink: queued events plus a keepalive ping.
    let writer = tokio::spawn(async move {
        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    if send_event(&mut sink, &event).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        let _ = sink.close().await;
    });

    while let Some(msg) = stream.next().await {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(participant_id = %participant_id, error = %e, "socket read error");
                break;
            }
        };
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(parsed) => {
                    handle_message(&state.registry, &session_id, &participant_id, parsed).await;
                }
                Err(e) => {
                    tracing::debug!(participant_id = %participant_id, error = %e, "malformed client message");
                    let _ = tx
                        .send(ServerEvent::ProtocolError {
                            message: format!("malformed message: {e}"),
                        })
                        .await;
                }
            },
            Message::Close(_) => break,
            // axum answers pings itself; pongs and binary frames are noise
            _ => {}
        }
    }

    state.registry.remove(&session_id, &participant_id).await;
    writer.abort();
    tracing::info!(session_id = %session_id, participant_id = %participant_id, "socket closed");
}

/// Wait for the opening `connect` frame. Any other first frame fails the
/// handshake and the socket is dropped.
async fn read_connect(
    stream: &mut futures::stream::SplitStream<WebSocket>,
) -> Option<(SessionId, String)> {
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                return match serde_json::from_str::<ClientMessage>(text.as_str()) {
                    Ok(ClientMessage::Connect { session_id, name }) => {
                        Some((session_id, name))
                    }
                    Ok(other) => {
                        tracing::debug!(got = ?other, "first frame was not connect");
                        None
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "unparseable handshake frame");
                        None
                    }
                };
            }
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn send_event(
    sink: &mut futures::stream::SplitSink<WebSocket, Message>,
    event: &ServerEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    sink.send(Message::Text(json.into())).await
}
