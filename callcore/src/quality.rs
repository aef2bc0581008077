//! Coarse call quality classification from transport statistics.

use serde::Serialize;

const EXCELLENT_RTT_MS: f64 = 100.0;
const EXCELLENT_LOSS: f64 = 0.01;
const GOOD_RTT_MS: f64 = 300.0;
const GOOD_LOSS: f64 = 0.05;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallQuality {
    Excellent,
    Good,
    Poor,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    Frozen,
    Waiting,
    InProgress,
    Failed,
    Succeeded,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CandidatePairStats {
    pub state: CandidatePairState,
    pub nominated: bool,
    /// Seconds, as reported by the transport.
    pub current_round_trip_time: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InboundRtpStats {
    pub kind: MediaKind,
    /// May be negative when duplicates are received.
    pub packets_lost: i64,
    pub packets_received: u64,
}

/// Subset of a transport statistics report used for quality sampling.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TransportStats {
    pub candidate_pairs: Vec<CandidatePairStats>,
    pub inbound_rtp: Vec<InboundRtpStats>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualitySample {
    pub round_trip_time_ms: f64,
    pub packet_loss_ratio: f64,
}

impl QualitySample {
    /// Extract a sample from a stats report.
    ///
    /// Round-trip time comes from the active (nominated, succeeded) candidate
    /// pair. Loss comes from inbound video, or inbound audio on calls without
    /// video. Returns `None` until an active pair reports a round-trip time.
    pub fn from_stats(stats: &TransportStats) -> Option<Self> {
        let active = stats
            .candidate_pairs
            .iter()
            .filter(|pair| pair.state == CandidatePairState::Succeeded)
            .find(|pair| pair.nominated)
            .or_else(|| {
                stats
                    .candidate_pairs
                    .iter()
                    .find(|pair| pair.state == CandidatePairState::Succeeded)
            })?;
        let round_trip_time_ms = active.current_round_trip_time? * 1000.0;

        let inbound = stats
            .inbound_rtp
            .iter()
            .find(|rtp| rtp.kind == MediaKind::Video)
            .or_else(|| {
                stats
                    .inbound_rtp
                    .iter()
                    .find(|rtp| rtp.kind == MediaKind::Audio)
            });
        let packet_loss_ratio = inbound.map_or(0.0, |rtp| {
            packet_loss_ratio(rtp.packets_lost.max(0) as u64, rtp.packets_received)
        });

        Some(Self {
            round_trip_time_ms,
            packet_loss_ratio,
        })
    }

    pub fn classify(&self) -> CallQuality {
        if self.round_trip_time_ms < EXCELLENT_RTT_MS && self.packet_loss_ratio < EXCELLENT_LOSS {
            CallQuality::Excellent
        } else if self.round_trip_time_ms < GOOD_RTT_MS && self.packet_loss_ratio < GOOD_LOSS {
            CallQuality::Good
        } else {
            CallQuality::Poor
        }
    }
}

/// `lost / (lost + received)`, zero before any packet has been received.
pub fn packet_loss_ratio(lost: u64, received: u64) -> f64 {
    if received == 0 {
        return 0.0;
    }
    lost as f64 / (lost + received) as f64
}
