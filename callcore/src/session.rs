use crate::state::CallPhase;
use crate::types::{CallId, ParticipantId};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Coarse call state exposed to collaborators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    Connecting,
    Connected,
    Recovering,
    Failed,
    Ended,
}

impl From<CallPhase> for SessionState {
    fn from(phase: CallPhase) -> Self {
        match phase {
            CallPhase::AcquiringMedia | CallPhase::Connecting => Self::Connecting,
            CallPhase::Connected => Self::Connected,
            CallPhase::Recovering { .. } => Self::Recovering,
            CallPhase::Failed(_) => Self::Failed,
            CallPhase::Ended => Self::Ended,
        }
    }
}

/// One call attempt between two participants.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSession {
    pub call_id: CallId,
    pub local_participant_id: ParticipantId,
    pub remote_participant_id: ParticipantId,
    pub is_initiator: bool,
    pub state: SessionState,
    /// Set when the transport first connects, not when the call is placed.
    pub started_at: Option<DateTime<Utc>>,
}

impl CallSession {
    pub fn new(local: ParticipantId, remote: ParticipantId, is_initiator: bool) -> Self {
        Self {
            call_id: CallId::for_participants(&local, &remote),
            local_participant_id: local,
            remote_participant_id: remote,
            is_initiator,
            state: SessionState::Connecting,
            started_at: None,
        }
    }

    /// Record the first connection. Later reconnections keep the first timestamp.
    pub fn mark_connected(&mut self, at: DateTime<Utc>) {
        self.started_at.get_or_insert(at);
    }

    /// Caller and receiver, in that order.
    pub fn caller_and_receiver(&self) -> (&ParticipantId, &ParticipantId) {
        if self.is_initiator {
            (&self.local_participant_id, &self.remote_participant_id)
        } else {
            (&self.remote_participant_id, &self.local_participant_id)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::FailureReason;
    use chrono::TimeZone;

    #[test]
    fn test_both_sides_share_call_id() {
        let caller = CallSession::new("alice".into(), "bob".into(), true);
        let callee = CallSession::new("bob".into(), "alice".into(), false);

        assert_eq!(caller.call_id, callee.call_id);
        assert_eq!(caller.caller_and_receiver(), callee.caller_and_receiver());
    }

    #[test]
    fn test_started_at_is_first_connection() {
        let mut session = CallSession::new("alice".into(), "bob".into(), true);
        let first = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let second = Utc.with_ymd_and_hms(2026, 1, 1, 10, 5, 0).unwrap();

        session.mark_connected(first);
        session.mark_connected(second);
        assert_eq!(session.started_at, Some(first));
    }

    #[test]
    fn test_phase_mapping() {
        assert_eq!(
            SessionState::from(CallPhase::AcquiringMedia),
            SessionState::Connecting
        );
        assert_eq!(
            SessionState::from(CallPhase::Recovering { attempt: 2 }),
            SessionState::Recovering
        );
        assert_eq!(
            SessionState::from(CallPhase::Failed(FailureReason::Signaling)),
            SessionState::Failed
        );
        assert_eq!(
            serde_json::to_value(SessionState::Connected).unwrap(),
            "CONNECTED"
        );
    }
}
