//! Transport abstraction
//!
//! One transport is one peer connection used for one connection attempt.
//! Every attempt gets a fresh generation number; events and negotiation
//! results carry it so the supervisor can drop anything that belongs to a
//! transport it already tore down.

use super::media_track::MediaPacket;
use super::signaling::{IceCandidate, SessionDescription};
use super::ViewerError;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

/// Monotonic attempt identifier
pub type Generation = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MediaKind::Audio => "audio",
            MediaKind::Video => "video",
        }
    }
}

impl TryFrom<RTPCodecType> for MediaKind {
    type Error = ViewerError;

    fn try_from(kind: RTPCodecType) -> Result<Self, Self::Error> {
        match kind {
            RTPCodecType::Audio => Ok(MediaKind::Audio),
            RTPCodecType::Video => Ok(MediaKind::Video),
            other => Err(ViewerError::MediaError(format!("Unsupported track kind: {:?}", other))),
        }
    }
}

/// ICE connection state as seen by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl IceState {
    /// Path established
    pub fn is_up(&self) -> bool {
        matches!(self, IceState::Connected | IceState::Completed)
    }

    /// Path lost; the attempt has to be replaced
    pub fn is_down(&self) -> bool {
        matches!(self, IceState::Disconnected | IceState::Failed)
    }
}

impl From<RTCIceConnectionState> for IceState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => IceState::Checking,
            RTCIceConnectionState::Connected => IceState::Connected,
            RTCIceConnectionState::Completed => IceState::Completed,
            RTCIceConnectionState::Disconnected => IceState::Disconnected,
            RTCIceConnectionState::Failed => IceState::Failed,
            RTCIceConnectionState::Closed => IceState::Closed,
            _ => IceState::New,
        }
    }
}

/// Remote track announced by the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundTrack {
    pub id: String,
    /// msid stream label the track belongs to
    pub stream_id: String,
    pub kind: MediaKind,
    pub ssrc: u32,
    pub codec: String,
}

#[derive(Debug, Clone)]
pub enum TransportEvent {
    NegotiationNeeded,
    IceStateChanged(IceState),
    TrackAdded(InboundTrack),
}

/// Handle used by transport callbacks to report back to the supervisor
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: Generation,
    events: mpsc::UnboundedSender<(Generation, TransportEvent)>,
}

impl EventSink {
    pub fn new(generation: Generation, events: mpsc::UnboundedSender<(Generation, TransportEvent)>) -> Self {
        Self { generation, events }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    /// Returns false once the supervisor is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.events.send((self.generation, event)).is_ok()
    }
}

/// Everything a factory needs to wire up one attempt
pub struct TransportContext {
    pub events: EventSink,
    /// Inbound RTP is fanned out here
    pub packets: broadcast::Sender<MediaPacket>,
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Create the local offer and set it as the local description
    async fn create_offer(&self) -> Result<SessionDescription, ViewerError>;

    async fn apply_answer(&self, answer: &SessionDescription) -> Result<(), ViewerError>;

    async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), ViewerError>;

    /// Release the connection and every track reader. Safe to call twice.
    async fn close(&self) -> Result<(), ViewerError>;
}

#[async_trait]
pub trait TransportFactory: Send + Sync {
    /// Build a transport with all event handlers registered and the
    /// receive-only transceivers added.
    async fn open(&self, ctx: TransportContext) -> Result<Arc<dyn Transport>, ViewerError>;
}
