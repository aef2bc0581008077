//! Signal messages exchanged over the call's broadcast topic.
//!
//! # Wire format
//!
//! ```json
//! {
//!   "type": "offer" | "answer" | "ice-candidate",
//!   "payload": { ... },
//!   "senderId": "...",
//!   "receiverId": "..."
//! }
//! ```
//!
//! The payload is opaque to the channel. Offer and answer payloads carry a
//! [`SessionDescription`]; candidate payloads carry an [`IceCandidate`].

use crate::types::ParticipantId;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SignalError {
    #[error("malformed signal: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("{kind} signal does not carry a {expected}")]
    UnexpectedPayload {
        kind: SignalKind,
        expected: &'static str,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SignalKind {
    Offer,
    Answer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

impl fmt::Display for SignalKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addressed unit of exchange on the signaling channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    pub payload: Value,
    pub sender_id: ParticipantId,
    pub receiver_id: ParticipantId,
}

impl SignalMessage {
    pub fn new(
        kind: SignalKind,
        payload: Value,
        sender_id: ParticipantId,
        receiver_id: ParticipantId,
    ) -> Self {
        Self {
            kind,
            payload,
            sender_id,
            receiver_id,
        }
    }

    pub fn is_addressed_to(&self, participant: &ParticipantId) -> bool {
        &self.receiver_id == participant
    }

    pub fn encode(&self) -> Result<Vec<u8>, SignalError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(frame: &[u8]) -> Result<Self, SignalError> {
        Ok(serde_json::from_slice(frame)?)
    }

    /// Session description carried by an offer or answer.
    pub fn session_description(&self) -> Result<SessionDescription, SignalError> {
        let expected = match self.kind {
            SignalKind::Offer => SdpType::Offer,
            SignalKind::Answer => SdpType::Answer,
            SignalKind::IceCandidate => {
                return Err(SignalError::UnexpectedPayload {
                    kind: self.kind,
                    expected: "session description",
                });
            }
        };
        let description: SessionDescription = serde_json::from_value(self.payload.clone())?;
        if description.sdp_type != expected {
            return Err(SignalError::UnexpectedPayload {
                kind: self.kind,
                expected: "matching session description",
            });
        }
        Ok(description)
    }

    pub fn ice_candidate(&self) -> Result<IceCandidate, SignalError> {
        if self.kind != SignalKind::IceCandidate {
            return Err(SignalError::UnexpectedPayload {
                kind: self.kind,
                expected: "candidate",
            });
        }
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

impl SdpType {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::Pranswer => "pranswer",
            Self::Rollback => "rollback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn to_payload(&self) -> Value {
        json!({ "type": self.sdp_type.as_str(), "sdp": self.sdp })
    }
}

/// A proposed network path for the peer transport.
///
/// Follows the browser `RTCIceCandidateInit` field names on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// The candidate line (e.g., "candidate:1 1 UDP 2130706431 192.168.1.1 8888 typ host")
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_m_line_index: Option<u16>,
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }

    pub fn with_sdp_mid(mut self, sdp_mid: impl Into<String>) -> Self {
        self.sdp_mid = Some(sdp_mid.into());
        self
    }

    pub fn with_sdp_m_line_index(mut self, index: u16) -> Self {
        self.sdp_m_line_index = Some(index);
        self
    }

    pub fn to_payload(&self) -> Value {
        json!({
            "candidate": self.candidate,
            "sdpMid": self.sdp_mid,
            "sdpMLineIndex": self.sdp_m_line_index,
            "usernameFragment": self.username_fragment,
        })
    }
}
