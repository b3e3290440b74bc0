use parley_core::entry::{ConversationEntry, Role};
use parley_core::ids::{ParticipantId, SessionId};
use parley_core::wire::{ClientMessage, ReleaseReason, ServerEvent};

use crate::lock::LockDecision;
use crate::registry::{SessionRegistry, SessionState};

/// Dispatch one decoded client message. The sender is already admitted;
/// `Connect` is consumed by the socket layer and is a protocol violation
/// if it shows up again here.
pub async fn handle_message(
    registry: &SessionRegistry,
    session_id: &SessionId,
    participant_id: &ParticipantId,
    msg: ClientMessage,
) {
    let Some(state) = registry.get(session_id) else {
        tracing::warn!(session_id = %session_id, "message for unknown session");
        return;
    };
    let mut state = state.lock().await;
    // The sender may have been swept out between socket read and dispatch
    let Some(sender_name) = state.find(participant_id).map(|p| p.name.clone()) else {
        return;
    };

    match msg {
        ClientMessage::Connect { .. } => {
            state.send_to(
                participant_id,
                ServerEvent::ProtocolError {
                    message: "already connected".into(),
                },
            );
        }

        ClientMessage::SyncRequest => {
            // Log read happens under the session mutex so the snapshot is
            // consistent with the roster and lock state shipped next to it.
            match registry.log().list_entries(session_id) {
                Ok(entries) => {
                    state.send_to(
                        participant_id,
                        ServerEvent::SyncState {
                            entries: entries.into_iter().map(|s| s.entry).collect(),
                            participants: state.roster(),
                            lock: state.lock.snapshot(),
                        },
                    );
                }
                Err(e) => {
                    tracing::error!(session_id = %session_id, error = %e, "sync read failed");
                    state.send_to(
                        participant_id,
                        ServerEvent::ProtocolError {
                            message: "failed to read conversation history".into(),
                        },
                    );
                }
            }
        }

        ClientMessage::LockRequest => {
            match state.lock.request(participant_id, &sender_name) {
                LockDecision::Granted => {
                    tracing::info!(session_id = %session_id, participant_id = %participant_id, "lock granted");
                    state.broadcast(
                        &ServerEvent::LockGranted {
                            holder_id: participant_id.clone(),
                            holder_name: sender_name,
                        },
                        None,
                    );
                }
                LockDecision::Denied { holder_name } => {
                    state.send_to(participant_id, ServerEvent::LockDenied { holder_name });
                }
            }
        }

        ClientMessage::LockRelease => {
            if state.lock.release(participant_id) {
                tracing::info!(session_id = %session_id, participant_id = %participant_id, "lock released");
                state.broadcast(
                    &ServerEvent::LockReleased {
                        reason: ReleaseReason::Released,
                    },
                    None,
                );
            } else {
                // Releasing a lock you do not hold is not an error worth
                // surfacing; it happens naturally around sweeps.
                tracing::debug!(session_id = %session_id, participant_id = %participant_id, "release ignored, not holder");
            }
        }

        ClientMessage::UserMessage { content } => {
            if !holds_lock(&state, participant_id) {
                drop_unauthorized(session_id, participant_id, "user_message");
                return;
            }
            let entry = ConversationEntry::new(Role::User, content, Some(sender_name));
            match registry.log().append_entry(session_id, &entry) {
                Ok(stored) => {
                    state.broadcast(
                        &ServerEvent::UserMessage {
                            entry: stored.entry,
                        },
                        Some(participant_id),
                    );
                }
                Err(e) => fail_durable_write(&mut state, session_id, participant_id, &e),
            }
        }

        ClientMessage::AssistantChunk { delta } => {
            if !holds_lock(&state, participant_id) {
                drop_unauthorized(session_id, participant_id, "assistant_chunk");
                return;
            }
            state.broadcast(
                &ServerEvent::AssistantDelta {
                    participant_id: participant_id.clone(),
                    delta,
                },
                Some(participant_id),
            );
        }

        ClientMessage::AssistantComplete { content } => {
            if !holds_lock(&state, participant_id) {
                drop_unauthorized(session_id, participant_id, "assistant_complete");
                return;
            }
            let entry = ConversationEntry::new(Role::Assistant, content, Some(sender_name));
            match registry.log().append_entry(session_id, &entry) {
                Ok(stored) => {
                    state.broadcast(
                        &ServerEvent::AssistantComplete {
                            entry: stored.entry,
                        },
                        Some(participant_id),
                    );
                }
                Err(e) => fail_durable_write(&mut state, session_id, participant_id, &e),
            }
        }

        ClientMessage::ToolExecute { tool_use_id, name } => {
            state.broadcast(
                &ServerEvent::ToolExecuting {
                    tool_use_id,
                    name,
                    participant_name: sender_name,
                },
                Some(participant_id),
            );
        }

        ClientMessage::ToolResult {
            tool_use_id,
            content,
            is_error,
        } => {
            match registry
                .log()
                .append_tool_result(session_id, &tool_use_id, &content, participant_id)
            {
                Ok(_) => {
                    state.broadcast(
                        &ServerEvent::ToolResult {
                            tool_use_id,
                            content,
                            is_error,
                        },
                        Some(participant_id),
                    );
                }
                Err(e) => fail_durable_write(&mut state, session_id, participant_id, &e),
            }
        }
    }
}

fn holds_lock(state: &SessionState, participant_id: &ParticipantId) -> bool {
    state
        .lock
        .holder()
        .is_some_and(|(holder, _)| holder == participant_id)
}

/// Mutations from non-holders are dropped without a reply. A stale sender
/// learns its lock is gone from the lock_released it already received.
fn drop_unauthorized(session_id: &SessionId, participant_id: &ParticipantId, kind: &str) {
    tracing::warn!(
        session_id = %session_id,
        participant_id = %participant_id,
        kind,
        "dropping mutation from non-holder"
    );
}

/// A failed append must not leave the session wedged behind a holder whose
/// write was lost. Release the lock first, then tell the sender.
fn fail_durable_write(
    state: &mut SessionState,
    session_id: &SessionId,
    participant_id: &ParticipantId,
    err: &parley_store::StoreError,
) {
    tracing::error!(session_id = %session_id, error = %err, "durable append failed");
    if holds_lock(state, participant_id) {
        state.lock.force_release();
        state.broadcast(
            &ServerEvent::LockReleased {
                reason: ReleaseReason::Released,
            },
            None,
        );
    }
    state.send_to(
        participant_id,
        ServerEvent::ProtocolError {
            message: "failed to record message, turn lock released".into(),
        },
    );
}
