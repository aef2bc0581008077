//! Application services the call core reports into.
//!
//! These are injected into each negotiator and ring controller rather than
//! looked up globally.

use async_trait::async_trait;
use callcore::types::{CallId, ParticipantId};
use serde::Serialize;

/// Notification payloads, tagged the way the notification service stores them.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "eventType",
    content = "payload",
    rename_all = "snake_case",
    rename_all_fields = "camelCase"
)]
pub enum Notification {
    /// Announces an incoming call; enough to render a ring screen.
    Call {
        call_id: CallId,
        caller_name: String,
        caller_avatar: Option<String>,
    },
    /// Call terminated. `missed` is set for declined or unanswered calls.
    CallEnded { duration_seconds: u64, missed: bool },
}

impl Notification {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Call { .. } => "call",
            Self::CallEnded { .. } => "call_ended",
        }
    }
}

#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn notify(
        &self,
        recipient: &ParticipantId,
        sender: &ParticipantId,
        notification: Notification,
    ) -> Result<(), anyhow::Error>;
}

#[async_trait]
pub trait CallHistoryStore: Send + Sync {
    async fn record_call(
        &self,
        caller: &ParticipantId,
        receiver: &ParticipantId,
        duration_seconds: u64,
    ) -> Result<(), anyhow::Error>;
}

/// Audible ring owned by the UI.
pub trait RingAlert: Send + Sync {
    fn start(&self);

    fn stop(&self);
}

/// A [`RingAlert`] that makes no sound.
#[derive(Debug, Default)]
pub struct SilentAlert;

impl RingAlert for SilentAlert {
    fn start(&self) {}

    fn stop(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_payload_shape() {
        let ended = serde_json::to_value(Notification::CallEnded {
            duration_seconds: 42,
            missed: false,
        })
        .unwrap();
        assert_eq!(ended["eventType"], "call_ended");
        assert_eq!(ended["payload"]["durationSeconds"], 42);

        let call = Notification::Call {
            call_id: CallId::new("a_b"),
            caller_name: "Ada".to_string(),
            caller_avatar: None,
        };
        assert_eq!(call.event_type(), "call");
        let value = serde_json::to_value(call).unwrap();
        assert_eq!(value["eventType"], "call");
        assert_eq!(value["payload"]["callerName"], "Ada");
    }
}
