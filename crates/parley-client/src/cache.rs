use parley_core::entry::ConversationEntry;
use parley_core::ids::ParticipantId;
use parley_core::repair::{repair, RepairOutcome};
use parley_core::wire::{LockState, ParticipantInfo, ServerEvent};

/// Local mirror of one session: the entry log, the live roster, and the
/// lock, folded from server events. A resync replaces the whole mirror;
/// nothing is ever merged, so a cache that drifted while disconnected
/// cannot contaminate the fresh state.
#[derive(Default)]
pub struct SessionCache {
    entries: Vec<ConversationEntry>,
    participants: Vec<ParticipantInfo>,
    lock: LockState,
    draft: Option<Draft>,
}

/// In-flight assistant text, accumulated from deltas until the complete
/// entry arrives.
struct Draft {
    participant_id: ParticipantId,
    text: String,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[ConversationEntry] {
        &self.entries
    }

    pub fn participants(&self) -> &[ParticipantInfo] {
        &self.participants
    }

    pub fn lock(&self) -> &LockState {
        &self.lock
    }

    pub fn draft_text(&self) -> Option<&str> {
        self.draft.as_ref().map(|d| d.text.as_str())
    }

    /// Integrity-repaired view of the log, for building a model request.
    /// A resynced log may interleave fragments from several participants'
    /// turns; the repairer drops what no longer lines up.
    pub fn repaired(&self) -> RepairOutcome {
        repair(&self.entries)
    }

    /// Fold one server event into the mirror. Events with no local state
    /// effect (tool traffic, diagnostics) pass through untouched.
    pub fn apply(&mut self, event: &ServerEvent) {
        match event {
            ServerEvent::SyncState {
                entries,
                participants,
                lock,
            } => self.replace(entries.clone(), participants.clone(), lock.clone()),

            ServerEvent::ParticipantJoined { participant } => {
                if !self
                    .participants
                    .iter()
                    .any(|p| p.participant_id == participant.participant_id)
                {
                    self.participants.push(participant.clone());
                }
            }
            ServerEvent::ParticipantLeft { participant } => {
                self.participants
                    .retain(|p| p.participant_id != participant.participant_id);
            }

            ServerEvent::LockGranted {
                holder_id,
                holder_name,
            } => {
                self.lock = LockState {
                    holder_id: Some(holder_id.clone()),
                    holder_name: Some(holder_name.clone()),
                    granted_at: None,
                };
            }
            ServerEvent::LockReleased { .. } => {
                self.lock = LockState::idle();
                // A turn that lost its lock mid-stream never completes
                self.draft = None;
            }

            ServerEvent::UserMessage { entry } => self.entries.push(entry.clone()),

            ServerEvent::AssistantDelta {
                participant_id,
                delta,
            } => {
                match &mut self.draft {
                    Some(draft) if draft.participant_id == *participant_id => {
                        draft.text.push_str(delta);
                    }
                    _ => {
                        self.draft = Some(Draft {
                            participant_id: participant_id.clone(),
                            text: delta.clone(),
                        });
                    }
                }
            }
            ServerEvent::AssistantComplete { entry } => {
                self.entries.push(entry.clone());
                self.draft = None;
            }

            ServerEvent::Connected { .. }
            | ServerEvent::LockDenied { .. }
            | ServerEvent::ToolExecuting { .. }
            | ServerEvent::ToolResult { .. }
            | ServerEvent::ProtocolError { .. } => {}
        }
    }

    /// Discard everything and adopt the authority's snapshot wholesale.
    pub fn replace(
        &mut self,
        entries: Vec<ConversationEntry>,
        participants: Vec<ParticipantInfo>,
        lock: LockState,
    ) {
        self.entries = entries;
        self.participants = participants;
        self.lock = lock;
        self.draft = None;
    }
}
