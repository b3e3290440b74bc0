use serde::{Deserialize, Serialize};

use crate::entry::{ConversationEntry, EntryContent};
use crate::ids::{ParticipantId, SessionId, ToolUseId};

/// Messages a participant sends to the session authority.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// First message on a fresh socket. Admits the sender into the session,
    /// creating it if absent.
    Connect {
        session_id: SessionId,
        name: String,
    },
    /// Pull the full durable log plus the live roster and lock state.
    SyncRequest,
    LockRequest,
    LockRelease,
    /// Holder-only. Appended to the log before broadcast.
    UserMessage { content: EntryContent },
    /// Holder-only streaming delta; never persisted.
    AssistantChunk { delta: String },
    /// Holder-only. Appended to the log before broadcast.
    AssistantComplete { content: EntryContent },
    ToolExecute {
        tool_use_id: ToolUseId,
        name: String,
    },
    ToolResult {
        tool_use_id: ToolUseId,
        content: serde_json::Value,
        #[serde(default)]
        is_error: bool,
    },
}

/// Events the authority delivers to participants.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    Connected {
        session_id: SessionId,
        participant_id: ParticipantId,
    },
    SyncState {
        entries: Vec<ConversationEntry>,
        participants: Vec<ParticipantInfo>,
        lock: LockState,
    },
    ParticipantJoined { participant: ParticipantInfo },
    ParticipantLeft { participant: ParticipantInfo },
    LockGranted {
        holder_id: ParticipantId,
        holder_name: String,
    },
    /// Sent to the requester only.
    LockDenied { holder_name: String },
    LockReleased { reason: ReleaseReason },
    UserMessage { entry: ConversationEntry },
    AssistantDelta {
        participant_id: ParticipantId,
        delta: String,
    },
    AssistantComplete { entry: ConversationEntry },
    ToolExecuting {
        tool_use_id: ToolUseId,
        name: String,
        participant_name: String,
    },
    ToolResult {
        tool_use_id: ToolUseId,
        content: serde_json::Value,
        is_error: bool,
    },
    /// Diagnostic for malformed input. Authorization drops are silent.
    ProtocolError { message: String },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub participant_id: ParticipantId,
    pub name: String,
}

/// Snapshot of a session's turn lock, as shipped over the wire.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct LockState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder_id: Option<ParticipantId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub holder_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub granted_at: Option<String>,
}

impl LockState {
    pub fn idle() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.holder_id.is_some()
    }

    pub fn held_by(&self, participant_id: &ParticipantId) -> bool {
        self.holder_id.as_ref() == Some(participant_id)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseReason {
    Released,
    Timeout,
    HolderDisconnected,
}

impl ServerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Connected { .. } => "connected",
            Self::SyncState { .. } => "sync_state",
            Self::ParticipantJoined { .. } => "participant_joined",
            Self::ParticipantLeft { .. } => "participant_left",
            Self::LockGranted { .. } => "lock_granted",
            Self::LockDenied { .. } => "lock_denied",
            Self::LockReleased { .. } => "lock_released",
            Self::UserMessage { .. } => "user_message",
            Self::AssistantDelta { .. } => "assistant_delta",
            Self::AssistantComplete { .. } => "assistant_complete",
            Self::ToolExecuting { .. } => "tool_executing",
            Self::ToolResult { .. } => "tool_result",
            Self::ProtocolError { .. } => "protocol_error",
        }
    }
}
