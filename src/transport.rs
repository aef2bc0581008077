//! Seams to the external primitives driven by the call core.
//!
//! Two primitives are assumed to exist outside this crate:
//!
//! - a broadcast channel transport ([`ChannelTransport`]) with at-least-once
//!   delivery to live subscribers, used for signaling;
//! - capture devices ([`MediaDevices`]) and a peer transport
//!   ([`PeerTransportFactory`] / [`PeerTransport`]) that carry the media.
//!
//! Both follow the factory-plus-event-stream shape: creating or subscribing
//! returns an `mpsc::Receiver` of events alongside the handle.

use crate::error::DeviceError;
use async_trait::async_trait;
use bytes::Bytes;
use callcore::media::MediaConstraints;
use callcore::quality::{MediaKind, TransportStats};
use callcore::signal::{IceCandidate, SessionDescription};
use callcore::state::{IceConnectionState, PeerConnectionState};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Subscription status reported by the channel transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionStatus {
    Subscribed,
    Closed,
    ChannelError,
    TimedOut,
}

/// An event produced by a topic subscription.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Status(SubscriptionStatus),
    /// A frame broadcast on the topic by another subscriber.
    Message(Bytes),
}

#[async_trait]
pub trait ChannelTransport: Send + Sync {
    /// Subscribes to a topic. Status transitions and inbound frames arrive on
    /// the returned receiver.
    async fn subscribe(&self, topic: &str) -> Result<mpsc::Receiver<ChannelEvent>, anyhow::Error>;

    async fn broadcast(&self, topic: &str, frame: Bytes) -> Result<(), anyhow::Error>;

    async fn unsubscribe(&self, topic: &str);
}

/// A captured local stream.
pub trait LocalStream: Send + Sync {
    fn id(&self) -> &str;

    fn has_audio(&self) -> bool;

    fn has_video(&self) -> bool;

    fn set_audio_enabled(&self, enabled: bool);

    fn set_video_enabled(&self, enabled: bool);

    /// Stops every track. Must be safe to call more than once.
    fn stop(&self);
}

#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn acquire(
        &self,
        constraints: MediaConstraints,
    ) -> Result<Arc<dyn LocalStream>, DeviceError>;
}

/// Handle to a track received from the remote participant, for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteTrack {
    pub id: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    ConnectionState(PeerConnectionState),
    IceConnectionState(IceConnectionState),
    /// A local candidate was gathered and should be sent to the remote side.
    LocalCandidate(IceCandidate),
    RemoteTrack(RemoteTrack),
}

#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn add_stream(&self, stream: Arc<dyn LocalStream>) -> Result<(), anyhow::Error>;

    /// Creates an offer. With `ice_restart` the offer carries fresh
    /// connectivity credentials.
    async fn create_offer(&self, ice_restart: bool) -> Result<SessionDescription, anyhow::Error>;

    async fn create_answer(&self) -> Result<SessionDescription, anyhow::Error>;

    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), anyhow::Error>;

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), anyhow::Error>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), anyhow::Error>;

    async fn stats(&self) -> Result<TransportStats, anyhow::Error>;

    async fn close(&self);
}

/// A factory responsible for creating new peer transports.
#[async_trait]
pub trait PeerTransportFactory: Send + Sync {
    async fn create_transport(
        &self,
    ) -> Result<(Arc<dyn PeerTransport>, mpsc::Receiver<PeerEvent>), anyhow::Error>;
}
