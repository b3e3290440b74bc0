use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;

use parley_core::ids::{ParticipantId, SessionId};
use parley_core::wire::{ParticipantInfo, ReleaseReason, ServerEvent};
use parley_store::{ConversationLog, StoreError};

use crate::lock::TurnLock;

/// One connected transport endpoint, owned by its session.
pub struct Participant {
    pub id: ParticipantId,
    pub name: String,
    pub tx: mpsc::Sender<ServerEvent>,
    pub connected_at: Instant,
}

/// Live, in-memory state for one session. Rebuildable from the durable log
/// plus currently-connected transports; the roster is never persisted.
pub struct SessionState {
    pub participants: Vec<Participant>,
    pub lock: TurnLock,
}

impl SessionState {
    fn new() -> Self {
        Self {
            participants: Vec::new(),
            lock: TurnLock::new(),
        }
    }

    pub fn roster(&self) -> Vec<ParticipantInfo> {
        self.participants
            .iter()
            .map(|p| ParticipantInfo {
                participant_id: p.id.clone(),
                name: p.name.clone(),
            })
            .collect()
    }

    pub fn find(&self, id: &ParticipantId) -> Option<&Participant> {
        self.participants.iter().find(|p| &p.id == id)
    }

    /// Deliver an event to one participant. Best-effort: a full or closed
    /// queue drops the event with a warning and never blocks the caller.
    pub fn send_to(&self, id: &ParticipantId, event: ServerEvent) {
        if let Some(p) = self.find(id) {
            deliver(p, event);
        }
    }

    /// Deliver an event to every participant except `exclude` (the
    /// originator already has local knowledge and gets no echo).
    pub fn broadcast(&self, event: &ServerEvent, exclude: Option<&ParticipantId>) {
        for p in &self.participants {
            if Some(&p.id) == exclude {
                continue;
            }
            deliver(p, event.clone());
        }
    }
}

fn deliver(p: &Participant, event: ServerEvent) {
    if let Err(e) = p.tx.try_send(event) {
        // One slow or dead participant must not affect the others.
        tracing::warn!(
            participant_id = %p.id,
            error = %e,
            "dropping event for participant"
        );
    }
}

/// In-memory table of live sessions. Sessions are created on first admit
/// and removed from the table (not from the durable log) when their last
/// participant leaves. One async Mutex per session serializes all roster,
/// lock, and broadcast operations for that session; distinct sessions
/// proceed in parallel.
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Arc<Mutex<SessionState>>>,
    log: Arc<ConversationLog>,
}

impl SessionRegistry {
    pub fn new(log: Arc<ConversationLog>) -> Self {
        Self {
            sessions: DashMap::new(),
            log,
        }
    }

    pub fn log(&self) -> &ConversationLog {
        &self.log
    }

    pub fn get(&self, session_id: &SessionId) -> Option<Arc<Mutex<SessionState>>> {
        self.sessions.get(session_id).map(|e| Arc::clone(e.value()))
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Admit a participant, creating the session if absent. The session
    /// record is persisted before the participant is registered, so a sync
    /// issued right after admission always finds the session in the log.
    pub async fn admit(
        &self,
        session_id: &SessionId,
        participant_id: &ParticipantId,
        name: &str,
        tx: mpsc::Sender<ServerEvent>,
    ) -> Result<(), StoreError> {
        self.log.create_session(session_id)?;

        loop {
            let state = self
                .sessions
                .entry(session_id.clone())
                .or_insert_with(|| Arc::new(Mutex::new(SessionState::new())))
                .clone();

            let mut guard = state.lock().await;
            // A concurrent remove may have destroyed this session between
            // the entry clone and the lock acquisition. Joining an orphaned
            // state would leave the participant invisible, so re-check the
            // map and retry on a fresh entry instead.
            let live = self
                .sessions
                .get(session_id)
                .is_some_and(|e| Arc::ptr_eq(e.value(), &state));
            if !live {
                continue;
            }

            let info = ParticipantInfo {
                participant_id: participant_id.clone(),
                name: name.to_string(),
            };
            guard.broadcast(&ServerEvent::ParticipantJoined { participant: info }, None);
            guard.participants.push(Participant {
                id: participant_id.clone(),
                name: name.to_string(),
                tx,
                connected_at: Instant::now(),
            });
            break;
        }

        tracing::info!(session_id = %session_id, participant_id = %participant_id, name, "participant admitted");
        Ok(())
    }

    /// Remove a participant. Idempotent: removing someone already gone is a
    /// no-op. Forces the lock idle if the departing participant held it,
    /// and drops the session from the table once the roster is empty.
    pub async fn remove(&self, session_id: &SessionId, participant_id: &ParticipantId) {
        let Some(state) = self.get(session_id) else {
            return;
        };

        let empty = {
            let mut state = state.lock().await;
            let Some(idx) = state.participants.iter().position(|p| &p.id == participant_id)
            else {
                return;
            };
            let departed = state.participants.remove(idx);

            let held_by_departed = state
                .lock
                .holder()
                .is_some_and(|(holder, _)| holder == participant_id);
            if held_by_departed {
                state.lock.force_release();
                state.broadcast(
                    &ServerEvent::LockReleased {
                        reason: ReleaseReason::HolderDisconnected,
                    },
                    None,
                );
                tracing::info!(session_id = %session_id, participant_id = %participant_id, "lock force-released on disconnect");
            }

            state.broadcast(
                &ServerEvent::ParticipantLeft {
                    participant: ParticipantInfo {
                        participant_id: departed.id,
                        name: departed.name,
                    },
                },
                None,
            );

            state.participants.is_empty()
        };

        if empty {
            // History stays in the durable log; only the live state goes.
            self.sessions
                .remove_if(session_id, |_, state| match state.try_lock() {
                    Ok(s) => s.participants.is_empty(),
                    Err(_) => false,
                });
            tracing::info!(session_id = %session_id, "session destroyed (empty roster)");
        }
    }

    pub async fn participants(&self, session_id: &SessionId) -> Vec<ParticipantInfo> {
        match self.get(session_id) {
            Some(state) => state.lock().await.roster(),
            None => Vec::new(),
        }
    }

    /// Expire any lock held longer than `timeout`, notifying all
    /// participants of affected sessions. Returns how many locks expired.
    pub async fn sweep_expired(&self, timeout: Duration) -> usize {
        let states: Vec<(SessionId, Arc<Mutex<SessionState>>)> = self
            .sessions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();

        let mut expired = 0;
        for (session_id, state) in states {
            let mut state = state.lock().await;
            if state.lock.expire_if_older_than(timeout) {
                expired += 1;
                tracing::info!(session_id = %session_id, "lock expired by sweep");
                state.broadcast(
                    &ServerEvent::LockReleased {
                        reason: ReleaseReason::Timeout,
                    },
                    None,
                );
            }
        }
        expired
    }
}

/// Start the periodic lock-expiry sweep.
pub fn start_lock_sweep(
    registry: Arc<SessionRegistry>,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume the immediate first tick
        loop {
            ticker.tick().await;
            registry.sweep_expired(timeout).await;
        }
    })
}
