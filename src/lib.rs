//! Two-party call signaling runtime.
//!
//! The protocol logic (state machine, wire format, backoff, quality
//! classification) lives in `callcore`; this crate drives it on tokio against
//! injected transports and collaborators.

pub use callcore::{backoff, session, signal, state, types};

pub mod channel;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod loopback;
pub mod media;
pub mod negotiator;
pub mod quality;
pub mod ring;
pub mod transport;

#[cfg(test)]
mod test_utils;

pub use channel::{ChannelStatus, SignalingChannel};
pub use config::{CallConfig, ChannelConfig};
pub use error::{CallError, DeviceError};
pub use negotiator::{
    CallDependencies, CallNegotiator, CallSnapshot, CallerProfile, start_outgoing_call,
};
pub use quality::QualityMonitor;
pub use ring::{IncomingCall, RingController};
