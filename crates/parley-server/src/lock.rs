use std::time::Duration;

use chrono::Utc;
use tokio::time::Instant;

use parley_core::ids::ParticipantId;
use parley_core::wire::LockState;

/// Per-session turn lock. At most one holder at any time; holding is
/// advisory and bounded by an idle timeout enforced by the sweep task.
#[derive(Clone, Debug)]
pub enum TurnLock {
    Idle,
    Held {
        participant_id: ParticipantId,
        name: String,
        granted_at: Instant,
        granted_wall: String,
    },
}

/// Outcome of a lock request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LockDecision {
    Granted,
    Denied { holder_name: String },
}

impl TurnLock {
    pub fn new() -> Self {
        Self::Idle
    }

    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held { .. })
    }

    pub fn holder(&self) -> Option<(&ParticipantId, &str)> {
        match self {
            Self::Idle => None,
            Self::Held {
                participant_id,
                name,
                ..
            } => Some((participant_id, name.as_str())),
        }
    }

    /// Grant if idle, or re-grant to the current holder with a fresh
    /// timestamp. Denial is non-queuing: the requester must retry.
    pub fn request(&mut self, participant_id: &ParticipantId, name: &str) -> LockDecision {
        match self {
            Self::Held {
                participant_id: holder,
                name: holder_name,
                ..
            } if holder != participant_id => LockDecision::Denied {
                holder_name: holder_name.clone(),
            },
            _ => {
                *self = Self::Held {
                    participant_id: participant_id.clone(),
                    name: name.to_string(),
                    granted_at: Instant::now(),
                    granted_wall: Utc::now().to_rfc3339(),
                };
                LockDecision::Granted
            }
        }
    }

    /// Release by the holder. Returns false (and leaves the lock alone)
    /// for anyone else.
    pub fn release(&mut self, participant_id: &ParticipantId) -> bool {
        match self {
            Self::Held {
                participant_id: holder,
                ..
            } if holder == participant_id => {
                *self = Self::Idle;
                true
            }
            _ => false,
        }
    }

    /// Unconditional release used when the holder disconnects.
    pub fn force_release(&mut self) {
        *self = Self::Idle;
    }

    /// Expire the lock if it has been held longer than `timeout`.
    pub fn expire_if_older_than(&mut self, timeout: Duration) -> bool {
        match self {
            Self::Held { granted_at, .. } if granted_at.elapsed() >= timeout => {
                *self = Self::Idle;
                true
            }
            _ => false,
        }
    }

    /// Wire-format snapshot of the current state.
    pub fn snapshot(&self) -> LockState {
        match self {
            Self::Idle => LockState::idle(),
            Self::Held {
                participant_id,
                name,
                granted_wall,
                ..
            } => LockState {
                holder_id: Some(participant_id.clone()),
                holder_name: Some(name.clone()),
                granted_at: Some(granted_wall.clone()),
            },
        }
    }
}

impl Default for TurnLock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn grant_when_idle() {
        let mut lock = TurnLock::new();
        let alice = ParticipantId::new();
        assert_eq!(lock.request(&alice, "alice"), LockDecision::Granted);
        assert!(lock.is_held());
        assert_eq!(lock.holder().unwrap().1, "alice");
    }

    #[tokio::test]
    async fn deny_when_held_by_other() {
        let mut lock = TurnLock::new();
        let alice = ParticipantId::new();
        let bob = ParticipantId::new();
        lock.request(&alice, "alice");

        assert_eq!(
            lock.request(&bob, "bob"),
            LockDecision::Denied {
                holder_name: "alice".into()
            }
        );
        // Unchanged holder
        assert_eq!(lock.holder().unwrap().0, &alice);
    }

    #[tokio::test]
    async fn regrant_to_holder_refreshes_timestamp() {
        tokio::time::pause();
        let mut lock = TurnLock::new();
        let alice = ParticipantId::new();
        lock.request(&alice, "alice");

        tokio::time::advance(Duration::from_secs(25)).await;
        assert_eq!(lock.request(&alice, "alice"), LockDecision::Granted);

        // Refreshed grant survives what the original would not have
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(!lock.expire_if_older_than(Duration::from_secs(30)));
    }

    #[tokio::test]
    async fn release_only_by_holder() {
        let mut lock = TurnLock::new();
        let alice = ParticipantId::new();
        let bob = ParticipantId::new();
        lock.request(&alice, "alice");

        assert!(!lock.release(&bob));
        assert!(lock.is_held());

        assert!(lock.release(&alice));
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn release_when_idle_is_noop() {
        let mut lock = TurnLock::new();
        assert!(!lock.release(&ParticipantId::new()));
    }

    #[tokio::test]
    async fn expiry_respects_timeout() {
        tokio::time::pause();
        let mut lock = TurnLock::new();
        lock.request(&ParticipantId::new(), "carol");

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(!lock.expire_if_older_than(Duration::from_secs(30)));
        assert!(lock.is_held());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert!(lock.expire_if_older_than(Duration::from_secs(30)));
        assert!(!lock.is_held());
    }

    #[tokio::test]
    async fn snapshot_reflects_state() {
        let mut lock = TurnLock::new();
        assert!(!lock.snapshot().is_held());

        let alice = ParticipantId::new();
        lock.request(&alice, "alice");
        let snap = lock.snapshot();
        assert!(snap.held_by(&alice));
        assert_eq!(snap.holder_name.as_deref(), Some("alice"));
        assert!(snap.granted_at.is_some());

        lock.force_release();
        assert!(!lock.snapshot().is_held());
    }
}
