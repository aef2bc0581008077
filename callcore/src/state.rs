//! Call negotiation state machine.
//!
//! [`Negotiation::apply`] is the single transition function of a call: it takes
//! the current state and one [`NegotiationEvent`] and returns the list of
//! [`Effect`]s the runtime must execute. It never performs I/O itself, which
//! keeps the recovery rules testable without a live transport.
//!
//! ```text
//! AcquiringMedia → Connecting → Connected ⇄ Recovering → Failed
//!        └──────────────┴────────────┴──────────┴──────────┴──→ Ended
//! ```

use crate::media::{DeviceErrorKind, MediaLevel};
use crate::signal::{IceCandidate, SessionDescription};
use serde::Serialize;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Role {
    /// Creates the initial offer.
    Initiator,
    /// Waits for the offer and answers it.
    Responder,
}

/// Aggregate peer transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Connectivity-check (ICE) state, distinct from the aggregate transport state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceConnectionState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailureReason {
    Device(DeviceErrorKind),
    Signaling,
    Transport,
}

impl FailureReason {
    /// Device and signaling failures can be retried by the user; exhausted
    /// transport recovery requires starting a new call.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Transport)
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Device(kind) => kind.user_message(),
            Self::Signaling => {
                "Could not reach the other participant. Check your connection and try again."
            }
            Self::Transport => "The connection was lost and could not be restored. Please call again.",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CallPhase {
    AcquiringMedia,
    Connecting,
    Connected,
    Recovering { attempt: u32 },
    Failed(FailureReason),
    Ended,
}

impl CallPhase {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, Self::Ended)
    }
}

/// Non-fatal condition surfaced to the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum CallWarning {
    DegradedMedia {
        level: MediaLevel,
        cause: DeviceErrorKind,
    },
    TransportDisconnected,
    Reconnecting {
        attempt: u32,
        max: u32,
    },
    IceRestarting,
    SignalingLost,
}

impl CallWarning {
    pub fn message(&self) -> String {
        match self {
            Self::DegradedMedia {
                level: MediaLevel::VideoOnly,
                ..
            } => "Microphone unavailable, continuing with video only.".to_string(),
            Self::DegradedMedia {
                level: MediaLevel::AudioOnly,
                ..
            } => "Camera unavailable, continuing with audio only.".to_string(),
            Self::DegradedMedia { level, .. } => {
                format!("Continuing with {} media.", level.describe())
            }
            Self::TransportDisconnected => "Connection interrupted, waiting for it to recover.".to_string(),
            Self::Reconnecting { attempt, max } => format!("Reconnecting ({attempt}/{max})..."),
            Self::IceRestarting => "Network path lost, searching for a new one.".to_string(),
            Self::SignalingLost => "Signaling unavailable; the call continues but cannot renegotiate.".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum NegotiationEvent {
    MediaAcquired { warning: Option<CallWarning> },
    MediaFailed(DeviceErrorKind),
    LocalOfferCreated(SessionDescription),
    /// Result of the initial channel join of the current attempt.
    ChannelJoined(bool),
    /// The channel reported `SUBSCRIBED`, possibly after a reconnect.
    ChannelReady,
    ChannelExhausted,
    OfferRetryElapsed,
    RemoteOffer(SessionDescription),
    RemoteAnswer(SessionDescription),
    RemoteCandidate(IceCandidate),
    LocalCandidate(IceCandidate),
    ConnectionStateChanged(PeerConnectionState),
    IceConnectionStateChanged(IceConnectionState),
    Retry,
    Hangup,
    RemoteHangup,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Warn(CallWarning),
    SendOffer(SessionDescription),
    /// Apply the remote offer, then create, apply and send an answer.
    AnswerOffer(SessionDescription),
    ApplyAnswer(SessionDescription),
    ApplyCandidate(IceCandidate),
    SendCandidate(IceCandidate),
    ScheduleOfferRetry { attempt: u32 },
    /// Restart connectivity checks in place and send the resulting offer.
    RestartIce,
    /// First transition to connected; starts the talk-time clock.
    MarkConnected,
    StartQualityMonitor,
    StopQualityMonitor,
    /// A disconnect or connectivity restart resolved without leaving connected.
    ConnectionRestored,
    /// Release everything and run acquisition, join and negotiation again.
    Reinitialize { attempt: u32 },
    /// Release media, transport and channel without notifying anyone.
    ReleaseResources,
    /// Final cleanup plus history and termination-notification side effects.
    Teardown { notify_remote: bool },
}

#[derive(Debug, Clone)]
pub struct InvalidTransition {
    pub current_state: String,
    pub attempted: String,
}

impl fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid transition {} in state {}",
            self.attempted, self.current_state
        )
    }
}

impl std::error::Error for InvalidTransition {}

/// Per-call negotiation state.
#[derive(Debug, Clone)]
pub struct Negotiation {
    phase: CallPhase,
    role: Role,
    max_recovery_attempts: u32,
    recovery_attempts: u32,
    max_offer_attempts: u32,
    offer_attempts: u32,
    channel_ready: bool,
    local_offer: Option<SessionDescription>,
    offer_sent: bool,
    awaiting_answer: bool,
    remote_description_set: bool,
    pending_candidates: Vec<IceCandidate>,
    ever_connected: bool,
    /// A transient disconnect or ICE restart is outstanding.
    interrupted: bool,
    torn_down: bool,
}

impl Negotiation {
    pub fn new(role: Role, max_recovery_attempts: u32, max_offer_attempts: u32) -> Self {
        Self {
            phase: CallPhase::AcquiringMedia,
            role,
            max_recovery_attempts,
            recovery_attempts: 0,
            max_offer_attempts,
            offer_attempts: 0,
            channel_ready: false,
            local_offer: None,
            offer_sent: false,
            awaiting_answer: false,
            remote_description_set: false,
            pending_candidates: Vec::new(),
            ever_connected: false,
            interrupted: false,
            torn_down: false,
        }
    }

    pub fn phase(&self) -> CallPhase {
        self.phase
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn recovery_attempts(&self) -> u32 {
        self.recovery_attempts
    }

    pub fn ever_connected(&self) -> bool {
        self.ever_connected
    }

    pub fn buffered_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Apply one event. Events that make no sense in the current state are
    /// rejected without changing anything.
    pub fn apply(&mut self, event: NegotiationEvent) -> Result<Vec<Effect>, InvalidTransition> {
        use CallPhase as P;
        use NegotiationEvent as E;

        let effects = match (self.phase, event) {
            (P::Ended, E::Hangup | E::RemoteHangup) => Vec::new(),
            (_, E::Hangup) => self.end(true),
            (_, E::RemoteHangup) => self.end(false),

            (P::AcquiringMedia | P::Recovering { .. }, E::MediaAcquired { warning }) => {
                if self.phase == P::AcquiringMedia {
                    self.phase = P::Connecting;
                }
                warning.map(Effect::Warn).into_iter().collect()
            }
            (P::AcquiringMedia | P::Recovering { .. }, E::MediaFailed(kind)) => {
                self.fail(FailureReason::Device(kind))
            }

            (P::Connecting | P::Recovering { .. }, E::LocalOfferCreated(offer))
                if self.role == Role::Initiator =>
            {
                self.local_offer = Some(offer);
                self.try_send_offer()
            }
            (P::Connecting | P::Connected | P::Recovering { .. }, E::ChannelJoined(true) | E::ChannelReady) => {
                self.channel_ready = true;
                self.try_send_offer()
            }
            (P::Connecting | P::Connected | P::Recovering { .. }, E::ChannelJoined(false)) => {
                self.channel_ready = false;
                if self.role == Role::Initiator && !self.offer_sent {
                    self.retry_offer_or_fail()
                } else {
                    Vec::new()
                }
            }
            (P::Connecting | P::Recovering { .. }, E::OfferRetryElapsed) => {
                if self.offer_sent {
                    Vec::new()
                } else if self.channel_ready {
                    self.try_send_offer()
                } else {
                    self.retry_offer_or_fail()
                }
            }
            (P::Connected, E::ChannelExhausted) => vec![Effect::Warn(CallWarning::SignalingLost)],
            (P::Connecting | P::Recovering { .. }, E::ChannelExhausted) => {
                self.fail(FailureReason::Signaling)
            }

            (P::Connecting | P::Connected | P::Recovering { .. }, E::RemoteOffer(offer))
                if self.role == Role::Responder || self.remote_description_set =>
            {
                self.remote_description_set = true;
                let mut effects = vec![Effect::AnswerOffer(offer)];
                effects.extend(self.drain_candidates());
                effects
            }
            (P::Connecting | P::Connected | P::Recovering { .. }, E::RemoteAnswer(answer))
                if self.awaiting_answer =>
            {
                self.awaiting_answer = false;
                self.remote_description_set = true;
                let mut effects = vec![Effect::ApplyAnswer(answer)];
                effects.extend(self.drain_candidates());
                effects
            }
            (P::Connecting | P::Connected | P::Recovering { .. }, E::RemoteCandidate(candidate)) => {
                if self.remote_description_set {
                    vec![Effect::ApplyCandidate(candidate)]
                } else {
                    self.pending_candidates.push(candidate);
                    Vec::new()
                }
            }
            (P::Connecting | P::Connected | P::Recovering { .. }, E::LocalCandidate(candidate)) => {
                vec![Effect::SendCandidate(candidate)]
            }

            (
                P::Connecting | P::Recovering { .. },
                E::ConnectionStateChanged(PeerConnectionState::Connected)
                | E::IceConnectionStateChanged(
                    IceConnectionState::Connected | IceConnectionState::Completed,
                ),
            ) => self.connected(),
            (
                P::Connected,
                E::ConnectionStateChanged(PeerConnectionState::Connected)
                | E::IceConnectionStateChanged(
                    IceConnectionState::Connected | IceConnectionState::Completed,
                ),
            ) => {
                if std::mem::take(&mut self.interrupted) {
                    vec![Effect::ConnectionRestored]
                } else {
                    Vec::new()
                }
            }
            (
                P::Connecting | P::Connected | P::Recovering { .. },
                E::ConnectionStateChanged(PeerConnectionState::Failed),
            ) => self.recover(),
            (
                P::Connecting | P::Connected | P::Recovering { .. },
                E::ConnectionStateChanged(PeerConnectionState::Disconnected),
            ) => {
                self.interrupted = true;
                vec![Effect::Warn(CallWarning::TransportDisconnected)]
            }
            (
                P::Connecting | P::Connected | P::Recovering { .. },
                E::IceConnectionStateChanged(IceConnectionState::Failed),
            ) => {
                self.awaiting_answer = true;
                self.interrupted = true;
                vec![Effect::Warn(CallWarning::IceRestarting), Effect::RestartIce]
            }
            (
                P::Connecting | P::Connected | P::Recovering { .. },
                E::ConnectionStateChanged(_) | E::IceConnectionStateChanged(_),
            ) => Vec::new(),

            (P::Failed(reason), E::Retry) if reason.is_retryable() => {
                self.phase = P::AcquiringMedia;
                self.recovery_attempts = 0;
                self.reset_attempt();
                vec![Effect::Reinitialize { attempt: 0 }]
            }

            (phase, event) => {
                return Err(InvalidTransition {
                    current_state: format!("{phase:?}"),
                    attempted: format!("{event:?}"),
                });
            }
        };
        Ok(effects)
    }

    fn try_send_offer(&mut self) -> Vec<Effect> {
        if self.role != Role::Initiator || !self.channel_ready || self.offer_sent {
            return Vec::new();
        }
        let Some(offer) = self.local_offer.clone() else {
            return Vec::new();
        };
        self.offer_sent = true;
        self.awaiting_answer = true;
        vec![Effect::SendOffer(offer)]
    }

    fn retry_offer_or_fail(&mut self) -> Vec<Effect> {
        if self.offer_attempts < self.max_offer_attempts {
            self.offer_attempts += 1;
            vec![Effect::ScheduleOfferRetry {
                attempt: self.offer_attempts,
            }]
        } else {
            self.fail(FailureReason::Signaling)
        }
    }

    fn drain_candidates(&mut self) -> Vec<Effect> {
        std::mem::take(&mut self.pending_candidates)
            .into_iter()
            .map(Effect::ApplyCandidate)
            .collect()
    }

    fn connected(&mut self) -> Vec<Effect> {
        self.phase = CallPhase::Connected;
        self.recovery_attempts = 0;
        self.interrupted = false;
        let mut effects = Vec::with_capacity(2);
        if !self.ever_connected {
            self.ever_connected = true;
            effects.push(Effect::MarkConnected);
        }
        effects.push(Effect::StartQualityMonitor);
        effects
    }

    fn recover(&mut self) -> Vec<Effect> {
        if self.recovery_attempts >= self.max_recovery_attempts {
            return self.fail(FailureReason::Transport);
        }
        self.recovery_attempts += 1;
        let attempt = self.recovery_attempts;
        self.phase = CallPhase::Recovering { attempt };
        self.reset_attempt();
        vec![
            Effect::StopQualityMonitor,
            Effect::Warn(CallWarning::Reconnecting {
                attempt,
                max: self.max_recovery_attempts,
            }),
            Effect::Reinitialize { attempt },
        ]
    }

    fn fail(&mut self, reason: FailureReason) -> Vec<Effect> {
        self.phase = CallPhase::Failed(reason);
        if reason.is_retryable() {
            vec![Effect::StopQualityMonitor, Effect::ReleaseResources]
        } else {
            self.torn_down = true;
            vec![
                Effect::StopQualityMonitor,
                Effect::Teardown {
                    notify_remote: true,
                },
            ]
        }
    }

    fn end(&mut self, notify_remote: bool) -> Vec<Effect> {
        self.phase = CallPhase::Ended;
        if std::mem::replace(&mut self.torn_down, true) {
            return Vec::new();
        }
        vec![Effect::StopQualityMonitor, Effect::Teardown { notify_remote }]
    }

    fn reset_attempt(&mut self) {
        self.offer_attempts = 0;
        self.channel_ready = false;
        self.local_offer = None;
        self.offer_sent = false;
        self.awaiting_answer = false;
        self.remote_description_set = false;
        self.pending_candidates.clear();
    }
}
